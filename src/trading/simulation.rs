//! Paper trading venue
//! In-memory orders and holdings for safe mode and tests. No order ever leaves the process.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::api::{
    ApiError, LivePosition, OrderAck, OrderAction, OrderRequest, OrderSnapshot, OrderState, Quote,
    Side, Venue,
};

/// How the next submitted order fills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaperFill {
    /// Fills completely on submission
    #[default]
    Full,
    /// Fills this many, the rest rests
    Partial(u64),
    /// Rests with nothing filled
    None,
    /// Rejected at submission
    Reject,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    filled: u64,
    status: OrderState,
}

#[derive(Default)]
struct PaperState {
    orders: HashMap<String, PaperOrder>,
    holdings: HashMap<(String, Side), u64>,
    quotes: HashMap<String, Quote>,
    script: VecDeque<PaperFill>,
    submitted: Vec<OrderRequest>,
    fail_positions: bool,
    fail_quotes: bool,
    next_id: u64,
}

impl PaperState {
    fn apply_fill(&mut self, request: &OrderRequest, quantity: u64) {
        if quantity == 0 {
            return;
        }
        let held = self
            .holdings
            .entry((request.market_id.clone(), request.side))
            .or_insert(0);
        match request.action {
            OrderAction::Buy => *held += quantity,
            OrderAction::Sell => *held = held.saturating_sub(quantity),
        }
    }
}

/// Simulated venue
pub struct PaperVenue {
    state: Mutex<PaperState>,
    /// Where quotes come from when none were set locally
    quote_source: Option<Arc<dyn Venue>>,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState::default()),
            quote_source: None,
        }
    }

    /// Paper orders against real market data
    pub fn with_quote_source(source: Arc<dyn Venue>) -> Self {
        Self {
            state: Mutex::new(PaperState::default()),
            quote_source: Some(source),
        }
    }

    pub async fn set_quote(&self, market_id: &str, yes_bid: Option<f64>, yes_ask: Option<f64>) {
        self.state.lock().await.quotes.insert(
            market_id.to_string(),
            Quote {
                market_id: market_id.to_string(),
                yes_bid,
                yes_ask,
            },
        );
    }

    /// Overwrite venue holdings, as if something traded outside this process
    pub async fn set_holding(&self, market_id: &str, side: Side, quantity: u64) {
        self.state
            .lock()
            .await
            .holdings
            .insert((market_id.to_string(), side), quantity);
    }

    pub async fn holding(&self, market_id: &str, side: Side) -> u64 {
        self.state
            .lock()
            .await
            .holdings
            .get(&(market_id.to_string(), side))
            .copied()
            .unwrap_or(0)
    }

    /// Queue the fill behaviour of the next submission
    pub async fn push_fill(&self, fill: PaperFill) {
        self.state.lock().await.script.push_back(fill);
    }

    pub async fn fail_positions(&self, fail: bool) {
        self.state.lock().await.fail_positions = fail;
    }

    /// Make quote lookups fail, as during a REST outage
    pub async fn fail_quotes(&self, fail: bool) {
        self.state.lock().await.fail_quotes = fail;
    }

    /// Fill more of a resting order
    pub async fn fill_resting(&self, order_id: &str, quantity: u64) -> Result<u64, ApiError> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ApiError::Api {
                status: 404,
                message: format!("order {} not found", order_id),
            })?;
        if order.status != OrderState::Resting {
            return Ok(0);
        }

        let added = quantity.min(order.request.quantity - order.filled);
        order.filled += added;
        if order.filled == order.request.quantity {
            order.status = OrderState::Executed;
        }
        let request = order.request.clone();
        state.apply_fill(&request, added);
        Ok(added)
    }

    /// Every order submitted so far
    pub async fn submitted(&self) -> Vec<OrderRequest> {
        self.state.lock().await.submitted.clone()
    }
}

impl Default for PaperVenue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Venue for PaperVenue {
    async fn submit_order(&self, order: OrderRequest) -> Result<OrderAck, ApiError> {
        let mut state = self.state.lock().await;
        let fill = state.script.pop_front().unwrap_or_default();
        state.submitted.push(order.clone());

        if fill == PaperFill::Reject {
            return Err(ApiError::Api {
                status: 400,
                message: "paper order rejected".into(),
            });
        }

        state.next_id += 1;
        let order_id = format!("paper-{}", state.next_id);
        let filled = match fill {
            PaperFill::Full => order.quantity,
            PaperFill::Partial(n) => n.min(order.quantity),
            PaperFill::None | PaperFill::Reject => 0,
        };
        let status = if filled == order.quantity {
            OrderState::Executed
        } else {
            OrderState::Resting
        };

        info!(
            "[PAPER] {} {} {} x{} @ {:.2} -> {} filled ({})",
            order.action.as_str(),
            order.market_id,
            order.side,
            order.quantity,
            order.price,
            filled,
            order_id
        );

        state.apply_fill(&order, filled);
        let ack = OrderAck {
            order_id: order_id.clone(),
            client_order_id: Some(order.client_order_id.clone()),
            status,
        };
        state.orders.insert(
            order_id,
            PaperOrder {
                request: order,
                filled,
                status,
            },
        );
        Ok(ack)
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderSnapshot, ApiError> {
        let state = self.state.lock().await;
        let order = state.orders.get(order_id).ok_or_else(|| ApiError::Api {
            status: 404,
            message: format!("order {} not found", order_id),
        })?;
        let remaining = if order.status.is_terminal() {
            0
        } else {
            order.request.quantity - order.filled
        };
        Ok(OrderSnapshot {
            order_id: order_id.to_string(),
            filled_count: order.filled,
            remaining_count: remaining,
            status: order.status,
        })
    }

    async fn get_live_positions(&self) -> Result<Vec<LivePosition>, ApiError> {
        let state = self.state.lock().await;
        if state.fail_positions {
            return Err(ApiError::Api {
                status: 503,
                message: "paper positions unavailable".into(),
            });
        }
        let mut live: Vec<LivePosition> = state
            .holdings
            .iter()
            .filter(|(_, qty)| **qty > 0)
            .map(|((market_id, side), qty)| LivePosition {
                market_id: market_id.clone(),
                side: *side,
                quantity: *qty,
            })
            .collect();
        live.sort_by(|a, b| (&a.market_id, a.side).cmp(&(&b.market_id, b.side)));
        Ok(live)
    }

    async fn get_quote(&self, market_id: &str) -> Result<Quote, ApiError> {
        {
            let state = self.state.lock().await;
            if state.fail_quotes {
                return Err(ApiError::Api {
                    status: 503,
                    message: "paper quotes unavailable".into(),
                });
            }
            if let Some(quote) = state.quotes.get(market_id) {
                return Ok(quote.clone());
            }
        }
        match &self.quote_source {
            Some(source) => source.get_quote(market_id).await,
            None => Err(ApiError::Api {
                status: 404,
                message: format!("no paper quote for {}", market_id),
            }),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        let order = state.orders.get_mut(order_id).ok_or_else(|| ApiError::Api {
            status: 404,
            message: format!("order {} not found", order_id),
        })?;
        if !order.status.is_terminal() {
            order.status = OrderState::Canceled;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn buy(qty: u64) -> OrderRequest {
        OrderRequest::limit("KXA", Side::Yes, OrderAction::Buy, qty, 0.5)
    }

    #[tokio::test]
    async fn test_full_fill_updates_holdings() {
        let venue = PaperVenue::new();
        let ack = venue.submit_order(buy(10)).await.unwrap();
        assert_eq!(ack.status, OrderState::Executed);
        assert_eq!(venue.holding("KXA", Side::Yes).await, 10);

        let sell = OrderRequest::limit("KXA", Side::Yes, OrderAction::Sell, 4, 0.6);
        venue.submit_order(sell).await.unwrap();
        assert_eq!(venue.holding("KXA", Side::Yes).await, 6);
    }

    #[tokio::test]
    async fn test_partial_then_fill_resting() {
        let venue = PaperVenue::new();
        venue.push_fill(PaperFill::Partial(3)).await;
        let ack = venue.submit_order(buy(10)).await.unwrap();

        let snap = venue.get_order_status(&ack.order_id).await.unwrap();
        assert_eq!((snap.filled_count, snap.remaining_count), (3, 7));
        assert_eq!(snap.status, OrderState::Resting);

        assert_eq!(venue.fill_resting(&ack.order_id, 20).await.unwrap(), 7);
        let snap = venue.get_order_status(&ack.order_id).await.unwrap();
        assert_eq!(snap.status, OrderState::Executed);
        assert_eq!(venue.holding("KXA", Side::Yes).await, 10);
    }

    #[tokio::test]
    async fn test_cancel_and_reject() {
        let venue = PaperVenue::new();
        venue.push_fill(PaperFill::None).await;
        venue.push_fill(PaperFill::Reject).await;

        let ack = venue.submit_order(buy(5)).await.unwrap();
        venue.cancel_order(&ack.order_id).await.unwrap();
        let snap = venue.get_order_status(&ack.order_id).await.unwrap();
        assert_eq!(snap.status, OrderState::Canceled);
        assert_eq!(snap.remaining_count, 0);

        assert!(venue.submit_order(buy(5)).await.is_err());
        assert_eq!(venue.submitted().await.len(), 2);
    }

    #[tokio::test]
    async fn test_quotes_and_position_failures() {
        let venue = PaperVenue::new();
        assert!(venue.get_quote("KXA").await.is_err());
        venue.set_quote("KXA", Some(0.4), Some(0.45)).await;
        assert_eq!(venue.get_quote("KXA").await.unwrap().yes_bid, Some(0.4));

        venue.fail_positions(true).await;
        assert!(venue.get_live_positions().await.is_err());
    }

    #[tokio::test]
    async fn test_quote_source_fallback() {
        let source = Arc::new(PaperVenue::new());
        source.set_quote("KXB", Some(0.2), Some(0.25)).await;
        let venue = PaperVenue::with_quote_source(source);
        assert_eq!(venue.get_quote("KXB").await.unwrap().yes_ask, Some(0.25));
    }
}
