//! Entry execution
//! Proposal -> capped buy -> bounded wait -> position only once something filled

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{OrderAction, OrderRequest, Venue};
use crate::trading::errors::TradingError;
use crate::trading::order_tracker::{FillStatus, FillTracker};
use crate::trading::position::PositionKey;
use crate::trading::store::{EntryApplied, PositionStore};
use crate::trading::strategy::TradeProposal;
use crate::utils::retry::{retry_with_backoff, RetryConfig};
use crate::websocket::PriceFeed;

/// Result of one entry attempt
#[derive(Debug, Clone, PartialEq)]
pub enum EntryResult {
    /// New position created and subscribed
    Opened { filled: u64 },
    /// Fill merged into an existing position
    Merged { filled: u64 },
    /// Order placed but nothing filled
    Unfilled,
    /// Nothing submitted
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct EntryConfig {
    pub fill_timeout: Duration,
    /// Cap on contracts held per market, counting what the venue already holds
    pub max_contracts_per_market: Option<u64>,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            fill_timeout: Duration::from_secs(30),
            max_contracts_per_market: None,
        }
    }
}

pub struct EntryExecutor {
    venue: Arc<dyn Venue>,
    store: Arc<PositionStore>,
    feed: Arc<PriceFeed>,
    tracker: Arc<FillTracker>,
    config: EntryConfig,
}

impl EntryExecutor {
    pub fn new(
        venue: Arc<dyn Venue>,
        store: Arc<PositionStore>,
        feed: Arc<PriceFeed>,
        tracker: Arc<FillTracker>,
        config: EntryConfig,
    ) -> Self {
        Self {
            venue,
            store,
            feed,
            tracker,
            config,
        }
    }

    pub async fn execute(&self, proposal: &TradeProposal) -> Result<EntryResult, TradingError> {
        let key = PositionKey::new(proposal.market_id.clone(), proposal.side);

        if self.store.is_closing(&key).await {
            debug!("Skipping entry for {}: exit in progress", key);
            return Ok(EntryResult::Skipped("exit in progress".into()));
        }

        proposal
            .validate()
            .map_err(|reason| TradingError::InvalidProposal {
                market_id: proposal.market_id.clone(),
                reason,
            })?;

        let quantity = self.capped_quantity(proposal).await;
        if quantity == 0 {
            info!("Entry for {} skipped: already at max contracts", key);
            return Ok(EntryResult::Skipped("at max contracts".into()));
        }

        let order = OrderRequest::limit(
            &proposal.market_id,
            proposal.side,
            OrderAction::Buy,
            quantity,
            proposal.price,
        );
        let ack = self.tracker.submit(order).await?;

        let outcome = self
            .tracker
            .wait_for_outcome(&ack.order_id, quantity, self.config.fill_timeout, true)
            .await;

        let mut filled = outcome.filled_quantity;
        if outcome.status != FillStatus::Filled {
            filled = filled.max(self.cancel_remainder(&ack.order_id).await);
        }
        let filled = filled.min(quantity);

        if filled == 0 {
            info!("⏳ Entry {} for {} not filled ({:?})", ack.order_id, key, outcome.status);
            return Ok(EntryResult::Unfilled);
        }

        let applied = self
            .store
            .open_or_merge(
                &proposal.market_id,
                proposal.side,
                filled,
                proposal.price,
                proposal.stop_loss,
                proposal.take_profit,
                proposal.event_ticker.clone(),
            )
            .await;

        match applied {
            EntryApplied::Opened => {
                self.feed.subscribe(&proposal.market_id).await;
                Ok(EntryResult::Opened { filled })
            }
            EntryApplied::Merged => Ok(EntryResult::Merged { filled }),
        }
    }

    /// Proposal quantity reduced by what the venue already holds for the market
    async fn capped_quantity(&self, proposal: &TradeProposal) -> u64 {
        let Some(max) = self.config.max_contracts_per_market else {
            return proposal.quantity;
        };

        let held: u64 = match self.venue.get_live_positions().await {
            Ok(live) => live
                .iter()
                .filter(|lp| lp.market_id == proposal.market_id)
                .map(|lp| lp.quantity)
                .sum(),
            Err(e) => {
                warn!(
                    "Could not read holdings for {} ({}); using proposal size",
                    proposal.market_id, e
                );
                0
            }
        };

        let capped = proposal.quantity.min(max.saturating_sub(held));
        if capped < proposal.quantity {
            info!(
                "Capping {} entry {} -> {} (held {}, max {})",
                proposal.market_id, proposal.quantity, capped, held, max
            );
        }
        capped
    }

    /// Cancel whatever rests and return the final filled count
    async fn cancel_remainder(&self, order_id: &str) -> u64 {
        let cancelled = retry_with_backoff("cancel entry", RetryConfig::new(2, 200), || {
            self.tracker.cancel(order_id)
        })
        .await;
        if let Err(e) = cancelled {
            warn!("Cancel of entry {} failed: {}", order_id, e);
        }
        let status = retry_with_backoff("final entry status", RetryConfig::new(2, 200), || {
            self.venue.get_order_status(order_id)
        })
        .await;
        match status {
            Ok(snapshot) => snapshot.filled_count,
            Err(e) => {
                warn!("Final status for {} unavailable: {}", order_id, e);
                0
            }
        }
    }
}
