//! Stop-loss / take-profit exit monitor
//!
//! Every cycle evaluates each open, non-closing position against its thresholds using
//! a fresh directional price, claims the exit through the store, submits a sell for the
//! full stake and applies whatever the bounded fill wait observed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::api::{OrderAction, OrderRequest};
use crate::trading::errors::TradingError;
use crate::trading::order_tracker::{FillStatus, FillTracker};
use crate::trading::position::{ExitReason, Position, PositionKey, Side};
use crate::trading::stats::SharedStats;
use crate::trading::store::{ExitApplied, ExitTicket, PositionStore};
use crate::websocket::PriceFeed;

/// What to do with an exit order that did not fully fill in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnfilledExitPolicy {
    /// Leave it resting; reconciliation picks up late fills
    #[default]
    LeaveForReconciliation,
    /// Cancel the resting remainder right after the wait
    CancelRemainder,
}

/// Decide whether `price` crosses a threshold.
///
/// YES positions stop out at or below `stop_loss` and take profit at or above
/// `take_profit`; NO positions are mirrored. Stop-loss wins if both cross.
pub fn check_exit(position: &Position, price: f64) -> Option<ExitReason> {
    let (stop_hit, profit_hit) = match position.side {
        Side::Yes => (
            position.stop_loss.map_or(false, |sl| price <= sl),
            position.take_profit.map_or(false, |tp| price >= tp),
        ),
        Side::No => (
            position.stop_loss.map_or(false, |sl| price >= sl),
            position.take_profit.map_or(false, |tp| price <= tp),
        ),
    };

    if stop_hit {
        Some(ExitReason::StopLoss)
    } else if profit_hit {
        Some(ExitReason::TakeProfit)
    } else {
        None
    }
}

/// Per-cycle counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitCycleReport {
    pub checked: usize,
    pub triggered: usize,
    pub settled: usize,
    pub reduced: usize,
    pub unfilled: usize,
    pub skipped: usize,
}

impl ExitCycleReport {
    /// Count one finished exit
    pub fn record(&mut self, key: &PositionKey, result: Result<ExitApplied, TradingError>) {
        match result {
            Ok(applied) => {
                self.triggered += 1;
                match applied {
                    ExitApplied::Settled { .. } => self.settled += 1,
                    ExitApplied::Reduced { .. } => self.reduced += 1,
                    ExitApplied::Unchanged => self.unfilled += 1,
                    ExitApplied::Stale => {}
                }
            }
            Err(TradingError::ExitNotStarted { .. }) => {
                debug!("Exit for {} already in flight", key);
            }
            Err(e) => {
                warn!("[{}] Exit for {} failed: {}", e.category(), key, e);
                self.skipped += 1;
            }
        }
    }
}

/// A finished exit task
pub type ExitTaskOutput = (PositionKey, Result<ExitApplied, TradingError>);

struct ExitSignal {
    key: PositionKey,
    price: f64,
    reason: ExitReason,
}

#[derive(Debug, Clone)]
pub struct ExitMonitorConfig {
    pub exit_timeout: Duration,
    pub unfilled_policy: UnfilledExitPolicy,
}

impl Default for ExitMonitorConfig {
    fn default() -> Self {
        Self {
            exit_timeout: Duration::from_secs(5),
            unfilled_policy: UnfilledExitPolicy::LeaveForReconciliation,
        }
    }
}

/// High-frequency exit monitor
pub struct ExitMonitor {
    store: Arc<PositionStore>,
    feed: Arc<PriceFeed>,
    tracker: Arc<FillTracker>,
    config: ExitMonitorConfig,
    stats: SharedStats,
}

impl ExitMonitor {
    pub fn new(
        store: Arc<PositionStore>,
        feed: Arc<PriceFeed>,
        tracker: Arc<FillTracker>,
        config: ExitMonitorConfig,
        stats: SharedStats,
    ) -> Self {
        Self {
            store,
            feed,
            tracker,
            config,
            stats,
        }
    }

    /// One evaluation pass over every monitorable position, waiting for every exit
    /// it triggers
    pub async fn run_cycle(&self) -> ExitCycleReport {
        let mut report = ExitCycleReport::default();
        let signals = self.evaluate(&mut report).await;

        let exits = signals.into_iter().map(|signal| async move {
            let result = self
                .exit_position(&signal.key, signal.price, signal.reason)
                .await;
            (signal.key, result)
        });
        for (key, result) in futures::future::join_all(exits).await {
            report.record(&key, result);
        }

        report
    }

    /// Evaluate and hand each triggered exit to its own task in `exits`.
    ///
    /// Returns without waiting on fills; `triggered` counts the exits spawned. Results
    /// come back through the join set.
    pub async fn dispatch_cycle(
        self: &Arc<Self>,
        exits: &mut JoinSet<ExitTaskOutput>,
    ) -> ExitCycleReport {
        let mut report = ExitCycleReport::default();
        for signal in self.evaluate(&mut report).await {
            report.triggered += 1;
            let monitor = Arc::clone(self);
            exits.spawn(async move {
                let result = monitor
                    .exit_position(&signal.key, signal.price, signal.reason)
                    .await;
                (signal.key, result)
            });
        }
        report
    }

    async fn evaluate(&self, report: &mut ExitCycleReport) -> Vec<ExitSignal> {
        let mut signals = Vec::new();

        for position in self.store.monitorable().await {
            report.checked += 1;
            let key = position.key();

            let observation = match self
                .feed
                .get_price(&position.market_id, position.side, OrderAction::Sell)
                .await
            {
                Ok(obs) => obs,
                Err(e) => {
                    debug!("No price for {}: {}", key, e);
                    report.skipped += 1;
                    continue;
                }
            };

            if !observation.fresh {
                debug!("Skipping {}: price not fresh", key);
                report.skipped += 1;
                continue;
            }

            if let Some(reason) = check_exit(&position, observation.price) {
                info!(
                    "📤 EXIT SIGNAL for {}: {} at {:.2} (SL {:?}, TP {:?})",
                    key, reason, observation.price, position.stop_loss, position.take_profit
                );
                signals.push(ExitSignal {
                    key,
                    price: observation.price,
                    reason,
                });
            }
        }

        signals
    }

    /// Operator-initiated exit at the current bid
    pub async fn exit_now(&self, key: &PositionKey) -> Result<ExitApplied, TradingError> {
        let observation = self
            .feed
            .get_price(&key.market_id, key.side, OrderAction::Sell)
            .await?;
        self.exit_position(key, observation.price, ExitReason::Manual)
            .await
    }

    /// Claim, submit, wait, apply
    pub async fn exit_position(
        &self,
        key: &PositionKey,
        price: f64,
        reason: ExitReason,
    ) -> Result<ExitApplied, TradingError> {
        let mut ticket = self
            .store
            .try_begin_exit(key, price, reason)
            .await
            .ok_or_else(|| TradingError::ExitNotStarted {
                key: key.to_string(),
                reason: "already closing or not open".to_string(),
            })?;
        self.stats.lock().await.record_exit_triggered();

        let order = OrderRequest {
            client_order_id: ticket.order_id.clone(),
            market_id: key.market_id.clone(),
            side: key.side,
            action: OrderAction::Sell,
            quantity: ticket.quantity,
            price,
        };

        let ack = match self.tracker.submit(order).await {
            Ok(ack) => ack,
            Err(e) if e.outcome_unknown() => {
                warn!(
                    "Exit submission for {} may have reached the venue ({}); holding claim for reconciliation",
                    key, e
                );
                self.store.detach_exit(&ticket).await;
                return Err(e.into());
            }
            Err(e) => {
                self.store.release_exit(&ticket).await;
                return Err(e.into());
            }
        };

        if !self.store.record_exit_order(&mut ticket, &ack.order_id).await {
            info!("Exit {} for {} resolved during submission", ack.order_id, key);
        }

        let outcome = self
            .tracker
            .wait_for_outcome(&ack.order_id, ticket.quantity, self.config.exit_timeout, true)
            .await;

        if self.config.unfilled_policy == UnfilledExitPolicy::CancelRemainder
            && matches!(outcome.status, FillStatus::Partial | FillStatus::Timeout)
        {
            self.cancel_remainder(&ticket).await;
        }

        let applied = self
            .store
            .apply_exit_outcome(&ticket, outcome.filled_quantity)
            .await;

        match &applied {
            ExitApplied::Settled { filled, pnl } => {
                info!("💰 Exit filled {} x{} PnL ${:.2}", key, filled, pnl);
                self.feed.unsubscribe(&key.market_id).await;
            }
            ExitApplied::Reduced { filled, remaining, pnl } => {
                info!(
                    "📊 Partial exit {}: {} filled, {} remaining, PnL ${:.2}",
                    key, filled, remaining, pnl
                );
            }
            ExitApplied::Unchanged => {
                info!("⏳ Exit for {} not filled ({:?}), will re-evaluate", key, outcome.status);
            }
            ExitApplied::Stale => {
                debug!("Exit outcome for {} superseded by reconciliation", key);
            }
        }

        Ok(applied)
    }

    async fn cancel_remainder(&self, ticket: &ExitTicket) {
        if let Err(e) = self.tracker.cancel(&ticket.order_id).await {
            warn!("Cancel of exit remainder {} failed: {}", ticket.order_id, e);
        }
    }
}
