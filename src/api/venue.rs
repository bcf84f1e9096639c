//! Venue abstraction
//! Everything the engine needs from the exchange: orders, holdings and quotes

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api::ApiError;

/// Contract side. All prices in the engine are on the YES probability scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    /// PnL direction on the YES scale
    pub fn direction(&self) -> f64 {
        match self {
            Side::Yes => 1.0,
            Side::No => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" | "a" => Ok(Side::Yes),
            "no" | "b" => Ok(Side::No),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

/// Buy opens exposure, sell closes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Buy => "buy",
            OrderAction::Sell => "sell",
        }
    }
}

/// Order request. `price` is on the YES scale; venue clients convert for NO orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub market_id: String,
    pub side: Side,
    pub action: OrderAction,
    pub quantity: u64,
    pub price: f64,
}

impl OrderRequest {
    /// Limit order with a fresh client order id
    pub fn limit(market_id: &str, side: Side, action: OrderAction, quantity: u64, price: f64) -> Self {
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            market_id: market_id.to_string(),
            side,
            action,
            quantity,
            price,
        }
    }

    /// Price of the order's own contract (what the venue wire format expects)
    pub fn contract_price(&self) -> f64 {
        match self.side {
            Side::Yes => self.price,
            Side::No => 1.0 - self.price,
        }
    }
}

/// Venue order state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Resting,
    Executed,
    Canceled,
    Rejected,
    Expired,
    Unknown,
}

impl OrderState {
    /// Map a venue status string onto a state
    pub fn parse(status: &str) -> Self {
        let s = status.trim().to_ascii_lowercase();
        match s.as_str() {
            "pending" => OrderState::Pending,
            "resting" | "open" | "active" => OrderState::Resting,
            "executed" | "filled" | "closed" => OrderState::Executed,
            "canceled" | "cancelled" | "closed_cancelled" => OrderState::Canceled,
            "rejected" => OrderState::Rejected,
            "expired" => OrderState::Expired,
            _ if s.contains("executed") || s.contains("filled") => OrderState::Executed,
            _ => OrderState::Unknown,
        }
    }

    /// No further fills will happen
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Executed | OrderState::Canceled | OrderState::Rejected | OrderState::Expired
        )
    }
}

/// Acknowledgement returned by order submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub status: OrderState,
}

/// Observed state of a venue order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub filled_count: u64,
    pub remaining_count: u64,
    pub status: OrderState,
}

/// Venue-held quantity for one (market, side)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePosition {
    pub market_id: String,
    pub side: Side,
    pub quantity: u64,
}

/// Top of book on the YES scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub market_id: String,
    pub yes_bid: Option<f64>,
    pub yes_ask: Option<f64>,
}

/// Venue client used by every engine task
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Venue: Send + Sync {
    /// Submit an order
    async fn submit_order(&self, order: OrderRequest) -> Result<OrderAck, ApiError>;

    /// Fetch current order status
    async fn get_order_status(&self, order_id: &str) -> Result<OrderSnapshot, ApiError>;

    /// Authoritative holdings (non-zero only)
    async fn get_live_positions(&self) -> Result<Vec<LivePosition>, ApiError>;

    /// REST top-of-book snapshot
    async fn get_quote(&self, market_id: &str) -> Result<Quote, ApiError>;

    /// Cancel a resting order
    async fn cancel_order(&self, order_id: &str) -> Result<(), ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_state_parse() {
        assert_eq!(OrderState::parse("executed"), OrderState::Executed);
        assert_eq!(OrderState::parse("FILLED"), OrderState::Executed);
        assert_eq!(OrderState::parse("cancelled"), OrderState::Canceled);
        assert_eq!(OrderState::parse("resting"), OrderState::Resting);
        assert_eq!(OrderState::parse("http_500"), OrderState::Unknown);
        assert!(OrderState::Expired.is_terminal());
        assert!(!OrderState::Resting.is_terminal());
    }

    #[test]
    fn test_no_side_contract_price() {
        let order = OrderRequest::limit("KXTEST-1", Side::No, OrderAction::Sell, 5, 0.30);
        assert!((order.contract_price() - 0.70).abs() < 1e-9);

        let order = OrderRequest::limit("KXTEST-1", Side::Yes, OrderAction::Buy, 5, 0.30);
        assert!((order.contract_price() - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_side_parse_and_direction() {
        assert_eq!("YES".parse::<Side>().unwrap(), Side::Yes);
        assert_eq!("b".parse::<Side>().unwrap(), Side::No);
        assert!("maybe".parse::<Side>().is_err());
        assert_eq!(Side::No.direction(), -1.0);
    }

    #[tokio::test]
    async fn test_mock_venue_submit() {
        let mut venue = MockVenue::new();
        venue.expect_submit_order().returning(|order| {
            Ok(OrderAck {
                order_id: "ord-1".to_string(),
                client_order_id: Some(order.client_order_id),
                status: OrderState::Resting,
            })
        });

        let ack = venue
            .submit_order(OrderRequest::limit("KXTEST-1", Side::Yes, OrderAction::Buy, 1, 0.5))
            .await
            .unwrap();
        assert_eq!(ack.order_id, "ord-1");
        assert_eq!(ack.status, OrderState::Resting);
    }
}
