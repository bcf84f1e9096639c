//! Order fill tracking
//! Bounded wait for an order's fill outcome, shared by entry and exit flows

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::api::{ApiError, OrderAck, OrderRequest, OrderState, Venue};
use crate::trading::stats::SharedStats;

/// Order fill status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    Filled,
    Partial,
    Unfilled,
    Timeout,
    Cancelled,
}

/// What a bounded wait observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillOutcome {
    pub status: FillStatus,
    pub filled_quantity: u64,
}

impl FillOutcome {
    fn new(status: FillStatus, filled_quantity: u64) -> Self {
        Self {
            status,
            filled_quantity,
        }
    }
}

/// Submits orders and waits for their outcome. Never cancels on its own.
pub struct FillTracker {
    venue: Arc<dyn Venue>,
    initial_wait: Duration,
    poll_interval: Duration,
    stats: SharedStats,
}

impl FillTracker {
    pub fn new(
        venue: Arc<dyn Venue>,
        initial_wait: Duration,
        poll_interval: Duration,
        stats: SharedStats,
    ) -> Self {
        Self {
            venue,
            initial_wait,
            poll_interval,
            stats,
        }
    }

    /// Submit an order
    pub async fn submit(&self, order: OrderRequest) -> Result<OrderAck, ApiError> {
        let quantity = order.quantity;
        info!(
            "📤 {} {} {} x{} @ {:.2}",
            order.action.as_str(),
            order.market_id,
            order.side,
            quantity,
            order.price
        );

        match self.venue.submit_order(order).await {
            Ok(ack) => {
                self.stats.lock().await.record_order_placed(quantity);
                Ok(ack)
            }
            Err(e) => {
                self.stats.lock().await.record_error();
                Err(e)
            }
        }
    }

    pub async fn cancel(&self, order_id: &str) -> Result<(), ApiError> {
        self.venue.cancel_order(order_id).await?;
        self.stats.lock().await.record_order_cancelled();
        Ok(())
    }

    /// Wait for the fill outcome of `order_id`.
    ///
    /// Short initial wait, one status check, then polls every `poll_interval` until
    /// `timeout`. Status-check errors count as "not resolved yet".
    pub async fn wait_for_outcome(
        &self,
        order_id: &str,
        expected_quantity: u64,
        timeout: Duration,
        allow_partial: bool,
    ) -> FillOutcome {
        let outcome = self
            .poll_outcome(order_id, expected_quantity, timeout, allow_partial)
            .await;

        let mut stats = self.stats.lock().await;
        match outcome.status {
            FillStatus::Filled => stats.record_order_filled(),
            FillStatus::Partial => stats.record_order_partial(),
            FillStatus::Timeout => stats.record_order_timeout(),
            FillStatus::Cancelled | FillStatus::Unfilled => {}
        }
        outcome
    }

    async fn poll_outcome(
        &self,
        order_id: &str,
        expected_quantity: u64,
        timeout: Duration,
        allow_partial: bool,
    ) -> FillOutcome {
        let deadline = Instant::now() + timeout;
        sleep(self.initial_wait.min(timeout)).await;

        let mut last_filled = 0u64;
        loop {
            match self.venue.get_order_status(order_id).await {
                Ok(snapshot) => {
                    let filled = snapshot.filled_count.min(expected_quantity);
                    last_filled = last_filled.max(filled);

                    if expected_quantity > 0 && filled >= expected_quantity {
                        return FillOutcome::new(FillStatus::Filled, filled);
                    }
                    match snapshot.status {
                        OrderState::Executed => {
                            // executed with no count reported means the whole order
                            let filled = if filled == 0 { expected_quantity } else { filled };
                            return FillOutcome::new(FillStatus::Filled, filled);
                        }
                        OrderState::Canceled => {
                            info!("Order {} cancelled by venue ({} filled)", order_id, filled);
                            return FillOutcome::new(FillStatus::Cancelled, filled);
                        }
                        OrderState::Rejected | OrderState::Expired => {
                            let status = if filled > 0 {
                                FillStatus::Partial
                            } else {
                                FillStatus::Unfilled
                            };
                            return FillOutcome::new(status, filled);
                        }
                        _ => {}
                    }
                    if allow_partial && filled > 0 {
                        return FillOutcome::new(FillStatus::Partial, filled);
                    }
                    debug!(
                        "Order {} pending: filled={} remaining={}",
                        order_id, snapshot.filled_count, snapshot.remaining_count
                    );
                }
                Err(e) => {
                    warn!("Status check for {} failed (will retry): {}", order_id, e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }

        if last_filled > 0 {
            FillOutcome::new(FillStatus::Partial, last_filled)
        } else {
            info!("⏱️ Order {} unresolved after {:?}", order_id, timeout);
            FillOutcome::new(FillStatus::Timeout, 0)
        }
    }
}
