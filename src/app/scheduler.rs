//! Task scheduler
//! Independently timed tasks over one shared position store and price feed

use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::Venue;
use crate::config::Config;
use crate::trading::{
    EntryExecutor, EntryResult, ExitCycleReport, ExitMonitor, ExitTaskOutput, FillTracker,
    MetricsSnapshot, PositionJournal, PositionStore, Reconciler, SharedStats, Strategy,
};
use crate::websocket::connector::StreamConnector;
use crate::websocket::PriceFeed;

/// Task cadences
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub exit_interval: Duration,
    pub reconcile_interval: Duration,
    pub strategy_interval: Duration,
    pub metrics_interval: Duration,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            exit_interval: Duration::from_millis(config.trading.exit_check_interval_ms),
            reconcile_interval: Duration::from_secs(config.trading.reconcile_interval_secs),
            strategy_interval: Duration::from_secs(config.trading.strategy_interval_secs),
            metrics_interval: Duration::from_secs(config.trading.metrics_interval_secs),
        }
    }
}

/// Owns the engine components and the tasks driving them
pub struct Scheduler {
    store: Arc<PositionStore>,
    feed: Arc<PriceFeed>,
    exit_monitor: Arc<ExitMonitor>,
    reconciler: Arc<Reconciler>,
    entry: Arc<EntryExecutor>,
    strategy: Arc<dyn Strategy>,
    stats: SharedStats,
    journal: Option<PositionJournal>,
    stats_path: Option<PathBuf>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    metrics_tx: Arc<watch::Sender<MetricsSnapshot>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Wire every component from configuration
    pub fn new(
        config: &Config,
        venue: Arc<dyn Venue>,
        store: Arc<PositionStore>,
        strategy: Arc<dyn Strategy>,
        stats: SharedStats,
    ) -> Self {
        let feed = Arc::new(PriceFeed::new(venue.clone(), config.feed_config()));
        let tracker = Arc::new(FillTracker::new(
            venue.clone(),
            Duration::from_millis(config.trading.fill_initial_wait_ms),
            Duration::from_millis(config.trading.fill_poll_interval_ms),
            stats.clone(),
        ));
        let exit_monitor = Arc::new(ExitMonitor::new(
            store.clone(),
            feed.clone(),
            tracker.clone(),
            config.exit_config(),
            stats.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            venue.clone(),
            store.clone(),
            feed.clone(),
            config.trading.inconsistency_alert_cycles,
            stats.clone(),
        ));
        let entry = Arc::new(EntryExecutor::new(
            venue,
            store.clone(),
            feed.clone(),
            tracker,
            config.entry_config(),
        ));
        let (metrics_tx, _) = watch::channel(MetricsSnapshot::default());

        Self {
            store,
            feed,
            exit_monitor,
            reconciler,
            entry,
            strategy,
            stats,
            journal: None,
            stats_path: None,
            config: SchedulerConfig::from(config),
            cancel: CancellationToken::new(),
            metrics_tx: Arc::new(metrics_tx),
            tasks: Vec::new(),
        }
    }

    /// Persist positions through this journal on every metrics tick and at shutdown
    pub fn with_journal(mut self, journal: PositionJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_stats_path(mut self, path: PathBuf) -> Self {
        self.stats_path = Some(path);
        self
    }

    pub fn store(&self) -> Arc<PositionStore> {
        self.store.clone()
    }

    pub fn feed(&self) -> Arc<PriceFeed> {
        self.feed.clone()
    }

    pub fn exit_monitor(&self) -> Arc<ExitMonitor> {
        self.exit_monitor.clone()
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }

    /// Latest metrics snapshot, updated by the metrics task
    pub fn metrics(&self) -> watch::Receiver<MetricsSnapshot> {
        self.metrics_tx.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribe the feed to every market the store already holds
    pub async fn resume_subscriptions(&self) {
        for position in self.store.positions().await {
            self.feed.subscribe(&position.market_id).await;
        }
    }

    /// Spawn the feed and every periodic task
    pub fn start(&mut self, connector: Arc<dyn StreamConnector>) {
        info!(
            "🚀 Scheduler starting (exit {:?}, reconcile {:?}, strategy {:?}, metrics {:?})",
            self.config.exit_interval,
            self.config.reconcile_interval,
            self.config.strategy_interval,
            self.config.metrics_interval
        );

        let feed = self.feed.clone();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = feed.run(connector, cancel).await {
                error!("❌ Price feed stopped: {}; exits fall back to REST quotes", e);
            }
        }));

        let monitor = self.exit_monitor.clone();
        let cancel = self.cancel.clone();
        let period = self.config.exit_interval;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut exits = JoinSet::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = monitor.dispatch_cycle(&mut exits).await;
                        if report.triggered > 0 {
                            info!("Exit cycle: {:?}", report);
                        }
                    }
                    Some(joined) = exits.join_next(), if !exits.is_empty() => finish_exit(joined),
                }
            }
            // outcomes must land in the store before the journal is written
            while let Some(joined) = exits.join_next().await {
                finish_exit(joined);
            }
            debug!("exit task stopped");
        }));

        let reconciler = self.reconciler.clone();
        self.spawn_periodic("reconcile", self.config.reconcile_interval, move || {
            let reconciler = reconciler.clone();
            async move {
                let report = reconciler.run_cycle().await;
                debug!("Reconcile cycle: {:?}", report);
            }
        });

        let strategy = self.strategy.clone();
        let entry = self.entry.clone();
        self.spawn_periodic("strategy", self.config.strategy_interval, move || {
            let strategy = strategy.clone();
            let entry = entry.clone();
            async move { run_strategy_cycle(strategy.as_ref(), entry.as_ref()).await }
        });

        let metrics = MetricsPublisher {
            store: self.store.clone(),
            reconciler: self.reconciler.clone(),
            stats: self.stats.clone(),
            journal: self.journal.clone(),
            stats_path: self.stats_path.clone(),
            tx: self.metrics_tx.clone(),
        };
        let metrics = Arc::new(metrics);
        self.spawn_periodic("metrics", self.config.metrics_interval, move || {
            let metrics = metrics.clone();
            async move { metrics.publish().await }
        });
    }

    fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut work: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => work().await,
                }
            }
            debug!("{} task stopped", name);
        }));
    }

    /// Publish metrics and persist once, outside the timer
    pub async fn publish_metrics(&self) {
        MetricsPublisher {
            store: self.store.clone(),
            reconciler: self.reconciler.clone(),
            stats: self.stats.clone(),
            journal: self.journal.clone(),
            stats_path: self.stats_path.clone(),
            tx: self.metrics_tx.clone(),
        }
        .publish()
        .await
    }

    /// Cancel and join every task, then persist
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        info!("🛑 Shutting down scheduler");
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Task ended abnormally: {}", e);
            }
        }

        if let Some(journal) = &self.journal {
            journal.save(&self.store.snapshot().await)?;
            info!("💾 Journal saved to {}", journal.path().display());
        }
        if let Some(path) = &self.stats_path {
            self.stats.lock().await.save_to_file(path)?;
        }
        Ok(())
    }
}

fn finish_exit(joined: Result<ExitTaskOutput, JoinError>) {
    match joined {
        Ok((key, result)) => {
            let mut report = ExitCycleReport::default();
            report.record(&key, result);
            debug!("Exit for {} finished: {:?}", key, report);
        }
        Err(e) => warn!("Exit task ended abnormally: {}", e),
    }
}

async fn run_strategy_cycle(strategy: &dyn Strategy, entry: &EntryExecutor) {
    for market in strategy.markets().await {
        let Some(proposal) = strategy.propose_trade(&market) else {
            continue;
        };
        match entry.execute(&proposal).await {
            Ok(EntryResult::Opened { filled }) | Ok(EntryResult::Merged { filled }) => {
                info!("✅ Entered {} {} x{}", proposal.market_id, proposal.side, filled);
            }
            Ok(EntryResult::Unfilled) => {}
            Ok(EntryResult::Skipped(reason)) => {
                debug!("Entry for {} skipped: {}", proposal.market_id, reason);
            }
            Err(e) => {
                warn!("[{}] Entry for {} failed: {}", e.category(), proposal.market_id, e);
            }
        }
    }
}

struct MetricsPublisher {
    store: Arc<PositionStore>,
    reconciler: Arc<Reconciler>,
    stats: SharedStats,
    journal: Option<PositionJournal>,
    stats_path: Option<PathBuf>,
    tx: Arc<watch::Sender<MetricsSnapshot>>,
}

impl MetricsPublisher {
    async fn publish(&self) {
        let (realized_pnl, win_count, loss_count) = self.store.totals().await;
        let snapshot = MetricsSnapshot {
            positions: self.store.positions().await,
            realized_pnl,
            win_count,
            loss_count,
            flagged: self.reconciler.flagged().await,
            updated_at: Some(Utc::now()),
        };
        info!(
            "📈 {} open positions, stake {}, realized ${:.2} ({}W/{}L), {} flagged",
            snapshot.positions.len(),
            snapshot.open_stake(),
            realized_pnl,
            win_count,
            loss_count,
            snapshot.flagged.len()
        );
        self.tx.send_replace(snapshot);

        let stats = self.stats.lock().await;
        info!("{}", stats.summary());
        if let Some(path) = &self.stats_path {
            if let Err(e) = stats.save_to_file(path) {
                error!("Failed to save stats: {}", e);
            }
        }
        drop(stats);

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.save(&self.store.snapshot().await) {
                error!("Failed to save journal: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Side;
    use crate::trading::{PaperVenue, TradingStats};
    use crate::websocket::connector::StreamSession;
    use crate::websocket::FeedError;
    use async_trait::async_trait;

    struct RefusingConnector;

    #[async_trait]
    impl StreamConnector for RefusingConnector {
        async fn connect(&self) -> Result<Box<dyn StreamSession>, FeedError> {
            Err(FeedError::Auth("no credentials".into()))
        }
    }

    #[tokio::test]
    async fn test_publish_metrics_and_shutdown_persists() {
        let dir = tempfile::tempdir().unwrap();
        let journal = PositionJournal::new(dir.path().join("positions.json"));
        let venue = Arc::new(PaperVenue::new());
        venue.set_holding("KXA", Side::Yes, 10).await;
        let store = Arc::new(PositionStore::new(true));
        store
            .open_or_merge("KXA", Side::Yes, 10, 0.5, Some(0.4), None, None)
            .await;

        let mut scheduler = Scheduler::new(
            &Config::default(),
            venue,
            store,
            Arc::new(crate::trading::IdleStrategy),
            TradingStats::shared(),
        )
        .with_journal(journal.clone())
        .with_stats_path(dir.path().join("stats.json"));

        let metrics = scheduler.metrics();
        scheduler.publish_metrics().await;
        assert_eq!(metrics.borrow().open_stake(), 10);
        assert!(metrics.borrow().updated_at.is_some());

        scheduler.start(Arc::new(RefusingConnector));
        scheduler.shutdown().await.unwrap();

        let restored = journal.load().unwrap();
        assert_eq!(restored.positions.len(), 1);
        assert!(dir.path().join("stats.json").exists());
    }
}
