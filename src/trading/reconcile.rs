//! Reconciliation against the venue's live holdings
//! Corrects drift from untracked fills and finalizes settled positions

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::{OrderAction, Venue};
use crate::trading::position::PositionKey;
use crate::trading::stats::SharedStats;
use crate::trading::store::{PositionStore, ReconcileAction};
use crate::websocket::PriceFeed;

/// Per-cycle counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Live positions could not be fetched; local state kept
    pub skipped: bool,
    pub checked: usize,
    pub settled: usize,
    pub reduced: usize,
    pub released: usize,
    pub inconsistent: usize,
    /// Filled locally while the venue snapshot was in flight
    pub deferred: usize,
}

#[derive(Default)]
struct InconsistencyTracker {
    counts: HashMap<PositionKey, u32>,
    flagged: HashSet<PositionKey>,
}

/// Low-frequency reconciliation task
pub struct Reconciler {
    venue: Arc<dyn Venue>,
    store: Arc<PositionStore>,
    feed: Arc<PriceFeed>,
    alert_cycles: u32,
    stats: SharedStats,
    inconsistencies: Mutex<InconsistencyTracker>,
}

impl Reconciler {
    pub fn new(
        venue: Arc<dyn Venue>,
        store: Arc<PositionStore>,
        feed: Arc<PriceFeed>,
        alert_cycles: u32,
        stats: SharedStats,
    ) -> Self {
        Self {
            venue,
            store,
            feed,
            alert_cycles: alert_cycles.max(1),
            stats,
            inconsistencies: Mutex::new(InconsistencyTracker::default()),
        }
    }

    /// Compare every live position with the venue and converge
    pub async fn run_cycle(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let snapshot_epoch = self.store.epoch().await;
        let live = match self.venue.get_live_positions().await {
            Ok(live) => live,
            Err(e) => {
                warn!("⚠️ Could not fetch live positions ({}); keeping local state", e);
                self.stats.lock().await.record_error();
                report.skipped = true;
                return report;
            }
        };

        let mut live_qty: HashMap<PositionKey, u64> = HashMap::new();
        for lp in live {
            *live_qty
                .entry(PositionKey::new(lp.market_id, lp.side))
                .or_insert(0) += lp.quantity;
        }

        for position in self.store.positions().await {
            report.checked += 1;
            let key = position.key();
            let live = live_qty.get(&key).copied().unwrap_or(0);
            let fallback = self
                .feed
                .cached_price(&position.market_id, position.side, OrderAction::Sell)
                .await;

            match self
                .store
                .apply_live_quantity(&key, live, fallback, snapshot_epoch)
                .await
            {
                ReconcileAction::Settled { quantity, price, pnl } => {
                    info!(
                        "🗑️ {} no longer held on venue; settled {} @ {:.2} (PnL ${:.2})",
                        key, quantity, price, pnl
                    );
                    report.settled += 1;
                    self.stats.lock().await.record_reconcile_correction();
                    self.feed.unsubscribe(&key.market_id).await;
                    self.clear_inconsistency(&key).await;
                }
                ReconcileAction::Reduced { filled, live, pnl } => {
                    info!(
                        "📊 Fill detected via reconciliation: {} - {} filled, {} remaining (PnL ${:.2})",
                        key, filled, live, pnl
                    );
                    report.reduced += 1;
                    self.stats.lock().await.record_reconcile_correction();
                    self.clear_inconsistency(&key).await;
                }
                ReconcileAction::ReleasedStaleExit => {
                    report.released += 1;
                    self.clear_inconsistency(&key).await;
                }
                ReconcileAction::Consistent => {
                    self.clear_inconsistency(&key).await;
                }
                ReconcileAction::Inconsistent { local, live } => {
                    report.inconsistent += 1;
                    self.stats.lock().await.record_inconsistency();
                    self.record_inconsistency(&key, local, live).await;
                }
                ReconcileAction::Deferred => {
                    debug!("{} filled during the holdings fetch; next cycle", key);
                    report.deferred += 1;
                }
                ReconcileAction::Missing => {
                    debug!("{} resolved while reconciling", key);
                }
            }
        }

        report
    }

    async fn record_inconsistency(&self, key: &PositionKey, local: u64, live: u64) {
        let mut tracker = self.inconsistencies.lock().await;
        let count = tracker.counts.entry(key.clone()).or_insert(0);
        *count += 1;
        let count = *count;

        if count >= self.alert_cycles {
            if tracker.flagged.insert(key.clone()) || count % self.alert_cycles == 0 {
                warn!(
                    operator_attention = true,
                    market = %key.market_id,
                    side = %key.side,
                    local,
                    live,
                    cycles = count,
                    "🚨 Venue holds more than tracked locally; stake left unchanged"
                );
            }
        } else {
            warn!(
                "Venue quantity {} exceeds local stake {} for {} ({}/{})",
                live, local, key, count, self.alert_cycles
            );
        }
    }

    async fn clear_inconsistency(&self, key: &PositionKey) {
        let mut tracker = self.inconsistencies.lock().await;
        tracker.counts.remove(key);
        if tracker.flagged.remove(key) {
            info!("{} consistent again, flag cleared", key);
        }
    }

    /// Positions currently flagged for operator attention
    pub async fn flagged(&self) -> Vec<PositionKey> {
        let mut flagged: Vec<PositionKey> = self
            .inconsistencies
            .lock()
            .await
            .flagged
            .iter()
            .cloned()
            .collect();
        flagged.sort();
        flagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, LivePosition, MockVenue, Side};
    use crate::trading::stats::TradingStats;
    use crate::websocket::FeedConfig;
    use std::sync::atomic::{AtomicU64, Ordering};

    async fn setup(venue: MockVenue, alert_cycles: u32) -> (Reconciler, Arc<PositionStore>, Arc<PriceFeed>) {
        let venue: Arc<dyn Venue> = Arc::new(venue);
        let store = Arc::new(PositionStore::new(true));
        let feed = Arc::new(PriceFeed::new(venue.clone(), FeedConfig::default()));
        for (market, side, stake) in [("KXA", Side::Yes, 100u64), ("KXB", Side::No, 10)] {
            store.open_or_merge(market, side, stake, 0.5, None, None, None).await;
            feed.subscribe(market).await;
        }
        let reconciler = Reconciler::new(venue, store.clone(), feed.clone(), alert_cycles, TradingStats::shared());
        (reconciler, store, feed)
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_cycle() {
        let mut venue = MockVenue::new();
        venue
            .expect_get_live_positions()
            .returning(|| Err(ApiError::Api { status: 502, message: "bad gateway".into() }));
        let (reconciler, store, _) = setup(venue, 3).await;

        let report = reconciler.run_cycle().await;
        assert!(report.skipped);
        assert_eq!(store.positions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_converges_and_settles() {
        let mut venue = MockVenue::new();
        venue.expect_get_live_positions().returning(|| {
            Ok(vec![LivePosition {
                market_id: "KXA".into(),
                side: Side::Yes,
                quantity: 60,
            }])
        });
        let (reconciler, store, feed) = setup(venue, 3).await;

        let report = reconciler.run_cycle().await;
        assert_eq!(report.reduced, 1);
        assert_eq!(report.settled, 1);

        let key = PositionKey::new("KXA", Side::Yes);
        assert_eq!(store.get(&key).await.unwrap().stake, 60);
        let fills = store.partial_fills(&key).await;
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].qty, 40);

        assert!(store.get(&PositionKey::new("KXB", Side::No)).await.is_none());
        assert_eq!(feed.active_markets().await, vec!["KXA".to_string()]);
    }

    #[tokio::test]
    async fn test_inconsistency_flags_after_threshold_and_clears() {
        let round = Arc::new(AtomicU64::new(0));
        let counter = round.clone();
        let mut venue = MockVenue::new();
        venue.expect_get_live_positions().returning(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let kxa = if n < 3 { 150 } else { 100 };
            Ok(vec![
                LivePosition { market_id: "KXA".into(), side: Side::Yes, quantity: kxa },
                LivePosition { market_id: "KXB".into(), side: Side::No, quantity: 10 },
            ])
        });
        let (reconciler, store, _) = setup(venue, 3).await;
        let key = PositionKey::new("KXA", Side::Yes);

        reconciler.run_cycle().await;
        reconciler.run_cycle().await;
        assert!(reconciler.flagged().await.is_empty());

        let report = reconciler.run_cycle().await;
        assert_eq!(report.inconsistent, 1);
        assert_eq!(reconciler.flagged().await, vec![key.clone()]);
        assert_eq!(store.get(&key).await.unwrap().stake, 100);

        reconciler.run_cycle().await;
        assert!(reconciler.flagged().await.is_empty());
    }

    /// Venue that answers with holdings from before an entry lands mid-request
    struct RacingVenue {
        store: Arc<PositionStore>,
    }

    #[async_trait::async_trait]
    impl Venue for RacingVenue {
        async fn submit_order(&self, _: crate::api::OrderRequest) -> Result<crate::api::OrderAck, ApiError> {
            Err(ApiError::Malformed("not used".into()))
        }

        async fn get_order_status(&self, _: &str) -> Result<crate::api::OrderSnapshot, ApiError> {
            Err(ApiError::Malformed("not used".into()))
        }

        async fn get_live_positions(&self) -> Result<Vec<LivePosition>, ApiError> {
            let before = vec![LivePosition {
                market_id: "KXA".into(),
                side: Side::Yes,
                quantity: 10,
            }];
            self.store
                .open_or_merge("KXA", Side::Yes, 10, 0.6, None, None, None)
                .await;
            self.store
                .open_or_merge("KXNEW", Side::Yes, 4, 0.3, None, None, None)
                .await;
            Ok(before)
        }

        async fn get_quote(&self, market_id: &str) -> Result<crate::api::Quote, ApiError> {
            Err(ApiError::Api { status: 404, message: market_id.to_string() })
        }

        async fn cancel_order(&self, _: &str) -> Result<(), ApiError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_entry_during_fetch_is_not_undone() {
        let store = Arc::new(PositionStore::new(true));
        store.open_or_merge("KXA", Side::Yes, 10, 0.5, None, None, None).await;
        let venue: Arc<dyn Venue> = Arc::new(RacingVenue { store: store.clone() });
        let feed = Arc::new(PriceFeed::new(venue.clone(), FeedConfig::default()));
        feed.subscribe("KXA").await;
        feed.subscribe("KXNEW").await;
        let reconciler = Reconciler::new(venue, store.clone(), feed.clone(), 3, TradingStats::shared());

        let report = reconciler.run_cycle().await;
        assert_eq!(report.deferred, 2);
        assert_eq!((report.reduced, report.settled), (0, 0));

        let merged = store.get(&PositionKey::new("KXA", Side::Yes)).await.unwrap();
        assert_eq!(merged.stake, 20);
        assert!(merged.partial_fills.is_empty());
        assert!(store.get(&PositionKey::new("KXNEW", Side::Yes)).await.is_some());
        assert_eq!(store.totals().await, (0.0, 0, 0));
        assert_eq!(feed.active_markets().await, vec!["KXA".to_string(), "KXNEW".to_string()]);
    }
}
