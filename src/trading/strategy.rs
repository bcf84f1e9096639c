//! Strategy seam
//! The strategy decides what to trade; the engine decides how positions live and die.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::api::Side;

/// Market data handed to the strategy each tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub market_id: String,
    #[serde(default)]
    pub event_ticker: Option<String>,
    pub yes_bid: Option<f64>,
    pub yes_ask: Option<f64>,
}

/// An entry the strategy wants to take. Prices on the YES scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeProposal {
    pub market_id: String,
    pub side: Side,
    pub price: f64,
    pub quantity: u64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub event_ticker: Option<String>,
}

impl TradeProposal {
    /// Reject proposals the engine cannot act on
    pub fn validate(&self) -> Result<(), String> {
        if self.market_id.is_empty() {
            return Err("empty market id".into());
        }
        if self.quantity == 0 {
            return Err("zero quantity".into());
        }
        if !(self.price > 0.0 && self.price < 1.0) {
            return Err(format!("price {} outside (0, 1)", self.price));
        }
        for (name, level) in [("stop_loss", self.stop_loss), ("take_profit", self.take_profit)] {
            if let Some(level) = level {
                if !(0.0..=1.0).contains(&level) {
                    return Err(format!("{} {} outside [0, 1]", name, level));
                }
            }
        }
        Ok(())
    }
}

/// External strategy collaborator
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Markets to evaluate this tick
    async fn markets(&self) -> Vec<MarketData>;

    fn propose_trade(&self, market: &MarketData) -> Option<TradeProposal>;
}

/// Proposes nothing; the engine only manages restored positions
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleStrategy;

#[async_trait]
impl Strategy for IdleStrategy {
    async fn markets(&self) -> Vec<MarketData> {
        Vec::new()
    }

    fn propose_trade(&self, _market: &MarketData) -> Option<TradeProposal> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal() -> TradeProposal {
        TradeProposal {
            market_id: "KXA".into(),
            side: Side::Yes,
            price: 0.5,
            quantity: 10,
            stop_loss: Some(0.4),
            take_profit: Some(0.7),
            event_ticker: None,
        }
    }

    #[test]
    fn test_validate() {
        assert!(proposal().validate().is_ok());

        let mut p = proposal();
        p.quantity = 0;
        assert!(p.validate().is_err());

        let mut p = proposal();
        p.price = 1.0;
        assert!(p.validate().is_err());

        let mut p = proposal();
        p.stop_loss = Some(-0.1);
        assert!(p.validate().is_err());
    }

    #[tokio::test]
    async fn test_idle_strategy_proposes_nothing() {
        let strategy = IdleStrategy;
        assert!(strategy.markets().await.is_empty());
        let data = MarketData {
            market_id: "KXA".into(),
            event_ticker: None,
            yes_bid: Some(0.4),
            yes_ask: Some(0.45),
        };
        assert!(strategy.propose_trade(&data).is_none());
    }
}
