//! Real-time price feed
//!
//! Caches the latest YES bid/ask per market from the ticker stream, falls back to a
//! synchronous REST quote whenever the cache can't be trusted, and owns the
//! reconnect loop and the ref-counted subscription set.

pub mod connector;
pub mod messages;
pub mod subscription;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{OrderAction, Side, Venue};
use crate::utils::Backoff;

pub use connector::{KalshiStreamConnector, StreamConnector, StreamEvent, StreamSession};
pub use messages::QuoteUpdate;
pub use subscription::SubscriptionSet;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Stream closed")]
    Closed,
    #[error("Price refresh failed: {0}")]
    Refresh(String),
}

impl FeedError {
    /// Cannot be repaired by reconnecting
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::Auth(_))
    }
}

/// Cached quote for one market
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSample {
    pub yes_bid: Option<f64>,
    pub yes_ask: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

impl PriceSample {
    /// Directional YES-scale price: selling YES or buying NO hits the bid, the other
    /// two hit the ask. A missing side falls back to the other one.
    pub fn directional(&self, side: Side, action: OrderAction) -> Option<f64> {
        let uses_bid = matches!(
            (side, action),
            (Side::Yes, OrderAction::Sell) | (Side::No, OrderAction::Buy)
        );
        if uses_bid {
            self.yes_bid.or(self.yes_ask)
        } else {
            self.yes_ask.or(self.yes_bid)
        }
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.observed_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Result of a price lookup. Triggers may only fire on `fresh` observations.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceObservation {
    pub price: f64,
    pub observed_at: DateTime<Utc>,
    pub fresh: bool,
}

/// Feed timing
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub stale_after: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub ping_interval: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60),
            reconnect_initial: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(60),
            ping_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
enum FeedCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Price feed shared by every engine task
pub struct PriceFeed {
    venue: Arc<dyn Venue>,
    config: FeedConfig,
    cache: RwLock<HashMap<String, PriceSample>>,
    subscriptions: Mutex<SubscriptionSet>,
    /// Command channel into the live session, present only while connected
    session_tx: Mutex<Option<mpsc::UnboundedSender<FeedCommand>>>,
    connected: AtomicBool,
    messages_received: AtomicU64,
    reconnects: AtomicU64,
}

impl PriceFeed {
    pub fn new(venue: Arc<dyn Venue>, config: FeedConfig) -> Self {
        Self {
            venue,
            config,
            cache: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(SubscriptionSet::new()),
            session_tx: Mutex::new(None),
            connected: AtomicBool::new(false),
            messages_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Failed or dropped sessions since start
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Read-only copy of the cached sample
    pub async fn cached(&self, market_id: &str) -> Option<PriceSample> {
        self.cache.read().await.get(market_id).cloned()
    }

    /// Cached directional price without any I/O
    pub async fn cached_price(&self, market_id: &str, side: Side, action: OrderAction) -> Option<f64> {
        self.cached(market_id)
            .await
            .and_then(|s| s.directional(side, action))
    }

    fn is_stale(&self, sample: &PriceSample) -> bool {
        sample.age() >= self.config.stale_after
    }

    /// Best directional price for `market_id`.
    ///
    /// Uses the cache when the stream is up and the sample is fresh; otherwise refreshes
    /// synchronously over REST. If the refresh fails but an old sample exists, that
    /// sample is returned with `fresh = false`.
    pub async fn get_price(
        &self,
        market_id: &str,
        side: Side,
        action: OrderAction,
    ) -> Result<PriceObservation, FeedError> {
        let cached = self.cached(market_id).await;

        if let Some(sample) = &cached {
            if self.is_connected() && !self.is_stale(sample) {
                if let Some(price) = sample.directional(side, action) {
                    return Ok(PriceObservation {
                        price,
                        observed_at: sample.observed_at,
                        fresh: true,
                    });
                }
            }
        }

        match self.refresh(market_id).await {
            Ok(sample) => match sample.directional(side, action) {
                Some(price) => Ok(PriceObservation {
                    price,
                    observed_at: sample.observed_at,
                    fresh: true,
                }),
                None => Err(FeedError::Refresh(format!("no quote for {}", market_id))),
            },
            Err(e) => {
                if let Some(price) = cached.as_ref().and_then(|s| s.directional(side, action)) {
                    debug!("Refresh failed for {}, serving stale sample: {}", market_id, e);
                    let sample = cached.as_ref().map(|s| s.observed_at).unwrap_or_else(Utc::now);
                    return Ok(PriceObservation {
                        price,
                        observed_at: sample,
                        fresh: false,
                    });
                }
                Err(e)
            }
        }
    }

    /// Point-in-time REST quote, written into the cache
    pub async fn refresh(&self, market_id: &str) -> Result<PriceSample, FeedError> {
        let quote = self
            .venue
            .get_quote(market_id)
            .await
            .map_err(|e| FeedError::Refresh(e.to_string()))?;

        let sample = PriceSample {
            yes_bid: quote.yes_bid,
            yes_ask: quote.yes_ask,
            observed_at: Utc::now(),
        };
        self.cache
            .write()
            .await
            .insert(market_id.to_string(), sample.clone());
        Ok(sample)
    }

    /// Reference a market. Only the first reference reaches the stream.
    pub async fn subscribe(&self, market_id: &str) {
        let mut subs = self.subscriptions.lock().await;
        if subs.add(market_id) {
            info!("📡 Subscribing {}", market_id);
            self.send_command(FeedCommand::Subscribe(market_id.to_string()))
                .await;
        }
    }

    /// Release a market reference. The last release leaves the stream.
    pub async fn unsubscribe(&self, market_id: &str) {
        let mut subs = self.subscriptions.lock().await;
        if subs.remove(market_id) {
            info!("📴 Unsubscribing {}", market_id);
            self.send_command(FeedCommand::Unsubscribe(market_id.to_string()))
                .await;
        }
    }

    pub async fn active_markets(&self) -> Vec<String> {
        self.subscriptions.lock().await.markets()
    }

    pub async fn ref_count(&self, market_id: &str) -> usize {
        self.subscriptions.lock().await.ref_count(market_id)
    }

    async fn send_command(&self, command: FeedCommand) {
        if let Some(tx) = self.session_tx.lock().await.as_ref() {
            // a closed receiver means the session is going away; the next
            // connect resubscribes the full set
            let _ = tx.send(command);
        }
    }

    fn apply_update(&self, update: QuoteUpdate, cache: &mut HashMap<String, PriceSample>) {
        cache.insert(
            update.market_id,
            PriceSample {
                yes_bid: update.yes_bid,
                yes_ask: update.yes_ask,
                observed_at: Utc::now(),
            },
        );
    }

    /// Load REST snapshots for every active market
    async fn load_snapshot(&self) {
        for market in self.active_markets().await {
            if let Err(e) = self.refresh(&market).await {
                warn!("Initial snapshot failed for {}: {}", market, e);
            }
        }
    }

    /// Stream loop: connect, resubscribe, read until the session drops, back off, repeat.
    ///
    /// Returns `Ok(())` on cancellation and `Err(FeedError::Auth)` when the venue rejects
    /// the credentials.
    pub async fn run(
        &self,
        connector: Arc<dyn StreamConnector>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        let mut backoff = Backoff::new(self.config.reconnect_initial, self.config.reconnect_max);
        info!("🚀 Price feed starting");

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            self.load_snapshot().await;

            let result = self.run_session(connector.as_ref(), &cancel, &mut backoff).await;
            self.connected.store(false, Ordering::SeqCst);
            *self.session_tx.lock().await = None;

            match result {
                Ok(()) => {
                    info!("Price feed stopped");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    error!("❌ Price feed halted: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff.next_delay();
                    warn!(
                        "WebSocket disconnected ({}), reconnecting in {:?} (attempt {})",
                        e,
                        delay,
                        backoff.attempts()
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn run_session(
        &self,
        connector: &dyn StreamConnector,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<(), FeedError> {
        let mut session = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            session = connector.connect() => session?,
        };

        // Install the command channel before reading the set so a subscribe that
        // races the connect is delivered at least once.
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.session_tx.lock().await = Some(tx);

        let markets = self.active_markets().await;
        session.subscribe(&markets).await?;
        self.connected.store(true, Ordering::SeqCst);
        backoff.reset();
        info!("✅ Price stream live ({} markets)", markets.len());

        let mut ping = interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    session.close().await;
                    return Ok(());
                }
                command = rx.recv() => match command {
                    Some(FeedCommand::Subscribe(market)) => session.subscribe(&[market]).await?,
                    Some(FeedCommand::Unsubscribe(market)) => session.unsubscribe(&[market]).await?,
                    None => {}
                },
                _ = ping.tick() => session.ping().await?,
                event = session.next_event() => match event {
                    Some(Ok(StreamEvent::Quote(update))) => {
                        self.messages_received.fetch_add(1, Ordering::Relaxed);
                        let mut cache = self.cache.write().await;
                        self.apply_update(update, &mut cache);
                    }
                    Some(Ok(StreamEvent::Ignored)) => {
                        self.messages_received.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(Err(FeedError::Protocol(msg))) => {
                        warn!("Dropping malformed message: {}", msg);
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(FeedError::Closed),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MockVenue, Quote};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    fn quote(bid: f64, ask: f64) -> Quote {
        Quote {
            market_id: "KXA".into(),
            yes_bid: Some(bid),
            yes_ask: Some(ask),
        }
    }

    #[test]
    fn test_directional_price() {
        let sample = PriceSample {
            yes_bid: Some(0.40),
            yes_ask: Some(0.44),
            observed_at: Utc::now(),
        };
        assert_eq!(sample.directional(Side::Yes, OrderAction::Sell), Some(0.40));
        assert_eq!(sample.directional(Side::Yes, OrderAction::Buy), Some(0.44));
        assert_eq!(sample.directional(Side::No, OrderAction::Sell), Some(0.44));
        assert_eq!(sample.directional(Side::No, OrderAction::Buy), Some(0.40));

        let one_sided = PriceSample { yes_bid: None, ..sample };
        assert_eq!(one_sided.directional(Side::Yes, OrderAction::Sell), Some(0.44));
    }

    #[tokio::test]
    async fn test_disconnected_feed_refreshes_over_rest() {
        let mut venue = MockVenue::new();
        venue
            .expect_get_quote()
            .times(1)
            .returning(|_| Ok(quote(0.41, 0.45)));
        let feed = PriceFeed::new(Arc::new(venue), FeedConfig::default());

        let obs = feed.get_price("KXA", Side::Yes, OrderAction::Sell).await.unwrap();
        assert_eq!(obs.price, 0.41);
        assert!(obs.fresh);
        assert!(feed.cached("KXA").await.is_some());
    }

    #[tokio::test]
    async fn test_stale_sample_triggers_refresh() {
        let mut venue = MockVenue::new();
        venue
            .expect_get_quote()
            .times(1)
            .returning(|_| Ok(quote(0.30, 0.33)));
        let feed = PriceFeed::new(Arc::new(venue), FeedConfig::default());
        feed.connected.store(true, Ordering::SeqCst);
        feed.cache.write().await.insert(
            "KXA".into(),
            PriceSample {
                yes_bid: Some(0.90),
                yes_ask: Some(0.95),
                observed_at: Utc::now() - chrono::Duration::seconds(120),
            },
        );

        let obs = feed.get_price("KXA", Side::Yes, OrderAction::Sell).await.unwrap();
        assert_eq!(obs.price, 0.30);
        assert!(obs.fresh);
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_stale_sample_unfresh() {
        let mut venue = MockVenue::new();
        venue
            .expect_get_quote()
            .returning(|_| Err(crate::api::ApiError::RateLimited));
        let feed = PriceFeed::new(Arc::new(venue), FeedConfig::default());
        feed.cache.write().await.insert(
            "KXA".into(),
            PriceSample {
                yes_bid: Some(0.20),
                yes_ask: Some(0.25),
                observed_at: Utc::now() - chrono::Duration::seconds(300),
            },
        );

        let obs = feed.get_price("KXA", Side::Yes, OrderAction::Sell).await.unwrap();
        assert_eq!(obs.price, 0.20);
        assert!(!obs.fresh);

        assert!(feed.get_price("KXZ", Side::Yes, OrderAction::Sell).await.is_err());
    }

    #[tokio::test]
    async fn test_fresh_connected_cache_skips_rest() {
        let venue = MockVenue::new(); // any REST call would panic
        let feed = PriceFeed::new(Arc::new(venue), FeedConfig::default());
        feed.connected.store(true, Ordering::SeqCst);
        feed.cache.write().await.insert(
            "KXA".into(),
            PriceSample {
                yes_bid: Some(0.52),
                yes_ask: Some(0.55),
                observed_at: Utc::now(),
            },
        );

        let obs = feed.get_price("KXA", Side::No, OrderAction::Sell).await.unwrap();
        assert_eq!(obs.price, 0.55);
        assert!(obs.fresh);
    }

    /// Scripted connector: each connect pops the next outcome
    struct ScriptedConnector {
        outcomes: std::sync::Mutex<VecDeque<Result<Vec<StreamEvent>, FeedError>>>,
        attempts: std::sync::Mutex<Vec<tokio::time::Instant>>,
        subscribed: Arc<std::sync::Mutex<Vec<Vec<String>>>>,
    }

    struct ScriptedSession {
        events: VecDeque<StreamEvent>,
        subscribed: Arc<std::sync::Mutex<Vec<Vec<String>>>>,
    }

    #[async_trait]
    impl StreamConnector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn StreamSession>, FeedError> {
            self.attempts.lock().unwrap().push(tokio::time::Instant::now());
            let next = self.outcomes.lock().unwrap().pop_front();
            match next {
                Some(Ok(events)) => Ok(Box::new(ScriptedSession {
                    events: events.into(),
                    subscribed: self.subscribed.clone(),
                })),
                Some(Err(e)) => Err(e),
                None => Err(FeedError::Connect("script exhausted".into())),
            }
        }
    }

    #[async_trait]
    impl StreamSession for ScriptedSession {
        async fn subscribe(&mut self, markets: &[String]) -> Result<(), FeedError> {
            self.subscribed.lock().unwrap().push(markets.to_vec());
            Ok(())
        }

        async fn unsubscribe(&mut self, _markets: &[String]) -> Result<(), FeedError> {
            Ok(())
        }

        async fn next_event(&mut self) -> Option<Result<StreamEvent, FeedError>> {
            match self.events.pop_front() {
                Some(event) => Some(Ok(event)),
                None => None,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_doubles_and_resubscribes() {
        let mut venue = MockVenue::new();
        venue.expect_get_quote().returning(|_| Ok(quote(0.5, 0.52)));

        let config = FeedConfig {
            reconnect_initial: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(20),
            ..FeedConfig::default()
        };
        let feed = Arc::new(PriceFeed::new(Arc::new(venue), config));
        feed.subscribe("KXA").await;

        let subscribed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let connector = Arc::new(ScriptedConnector {
            outcomes: std::sync::Mutex::new(VecDeque::from(vec![
                Err(FeedError::Connect("refused".into())),
                Err(FeedError::Connect("refused".into())),
                Err(FeedError::Connect("refused".into())),
                Err(FeedError::Connect("refused".into())),
                Ok(vec![StreamEvent::Quote(QuoteUpdate {
                    market_id: "KXA".into(),
                    yes_bid: Some(0.61),
                    yes_ask: Some(0.63),
                })]),
                Err(FeedError::Auth("revoked".into())),
            ])),
            attempts: std::sync::Mutex::new(Vec::new()),
            subscribed: subscribed.clone(),
        });

        let result = feed.run(connector.clone(), CancellationToken::new()).await;
        assert_eq!(result, Err(FeedError::Auth("revoked".into())));

        let attempts = connector.attempts.lock().unwrap().clone();
        let gaps: Vec<u64> = attempts
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs())
            .collect();
        // 5, 10, 20, capped 20, then reset to 5 after the successful session
        assert_eq!(gaps, vec![5, 10, 20, 20, 5]);

        assert_eq!(subscribed.lock().unwrap().clone(), vec![vec!["KXA".to_string()]]);
        assert_eq!(feed.messages_received(), 1);
        assert_eq!(feed.reconnect_count(), 5);
        assert!(!feed.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let venue = MockVenue::new();
        let feed = Arc::new(PriceFeed::new(Arc::new(venue), FeedConfig::default()));
        let connector = Arc::new(ScriptedConnector {
            outcomes: std::sync::Mutex::new(VecDeque::new()),
            attempts: std::sync::Mutex::new(Vec::new()),
            subscribed: Arc::new(std::sync::Mutex::new(Vec::new())),
        });

        let cancel = CancellationToken::new();
        let handle = {
            let feed = feed.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { feed.run(connector, cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_subscribe_is_ref_counted() {
        let feed = PriceFeed::new(Arc::new(MockVenue::new()), FeedConfig::default());
        feed.subscribe("KXA").await;
        feed.subscribe("KXA").await;
        assert_eq!(feed.ref_count("KXA").await, 2);

        feed.unsubscribe("KXA").await;
        assert_eq!(feed.active_markets().await, vec!["KXA".to_string()]);
        feed.unsubscribe("KXA").await;
        feed.unsubscribe("KXA").await;
        assert!(feed.active_markets().await.is_empty());
    }
}
