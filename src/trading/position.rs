//! Position record and lifecycle phase

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use crate::api::Side;

/// Why an exit was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
    #[default]
    None,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::Manual => "manual",
            ExitReason::None => "none",
        };
        f.write_str(s)
    }
}

/// One realized slice of an exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialFill {
    pub qty: u64,
    pub price: f64,
    pub order_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Identity of a position: one market side
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub market_id: String,
    pub side: Side,
}

impl PositionKey {
    pub fn new(market_id: impl Into<String>, side: Side) -> Self {
        Self {
            market_id: market_id.into(),
            side,
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.market_id, self.side)
    }
}

/// Lifecycle phase derived from the position's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionPhase {
    PendingEntry,
    Open,
    ExitPending,
    Settled,
}

/// A held or exiting stake in one market side.
///
/// Prices (`entry_price`, `stop_loss`, `take_profit`, `last_exit_price`) are on the
/// YES probability scale regardless of `side`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub market_id: String,
    pub side: Side,
    #[serde(default)]
    pub event_ticker: Option<String>,
    pub entry_price: f64,
    pub stake: u64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,

    #[serde(default)]
    pub closing_in_progress: bool,
    #[serde(default)]
    pub closing_order_id: Option<String>,
    #[serde(default)]
    pub original_stake_on_exit: Option<u64>,
    #[serde(default)]
    pub last_exit_price: Option<f64>,
    #[serde(default)]
    pub exit_reason: ExitReason,
    #[serde(default)]
    pub exit_order_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub settled: bool,
    #[serde(default)]
    pub settled_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub partial_fills: Vec<PartialFill>,
    #[serde(default)]
    pub realized_pnl: f64,
    pub entry_time: DateTime<Utc>,
}

impl Position {
    /// Create an open position from a confirmed entry fill
    pub fn new(
        market_id: &str,
        side: Side,
        entry_price: f64,
        stake: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Self {
        Self {
            market_id: market_id.to_string(),
            side,
            event_ticker: None,
            entry_price,
            stake,
            stop_loss,
            take_profit,
            closing_in_progress: false,
            closing_order_id: None,
            original_stake_on_exit: None,
            last_exit_price: None,
            exit_reason: ExitReason::None,
            exit_order_time: None,
            settled: false,
            settled_time: None,
            partial_fills: Vec::new(),
            realized_pnl: 0.0,
            entry_time: Utc::now(),
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.market_id.clone(), self.side)
    }

    pub fn phase(&self) -> PositionPhase {
        if self.settled {
            PositionPhase::Settled
        } else if self.closing_in_progress {
            PositionPhase::ExitPending
        } else if self.stake == 0 {
            PositionPhase::PendingEntry
        } else {
            PositionPhase::Open
        }
    }

    /// Eligible for stop-loss / take-profit evaluation
    pub fn is_monitorable(&self) -> bool {
        !self.settled && !self.closing_in_progress && self.stake > 0
    }

    /// Add an entry fill, keeping a quantity-weighted average entry price
    pub fn merge_fill(&mut self, quantity: u64, price: f64) {
        if quantity == 0 {
            return;
        }
        let total = self.stake + quantity;
        let value = self.stake as f64 * self.entry_price + quantity as f64 * price;
        self.entry_price = value / total as f64;
        self.stake = total;
    }

    /// Drop the in-flight exit markers
    pub(crate) fn clear_exit(&mut self) {
        self.closing_in_progress = false;
        self.closing_order_id = None;
        self.original_stake_on_exit = None;
    }

    pub(crate) fn mark_settled(&mut self) {
        self.clear_exit();
        self.stake = 0;
        self.settled = true;
        self.settled_time = Some(Utc::now());
    }

    /// Structural invariants; `Err` names the first violation
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.settled && self.stake != 0 {
            return Err(format!("{} settled with stake {}", self.key(), self.stake));
        }
        if self.closing_in_progress && self.closing_order_id.is_none() {
            return Err(format!("{} closing without an order id", self.key()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        let mut pos = Position::new("KXA", Side::Yes, 0.5, 100, Some(0.4), Some(0.7));
        assert_eq!(pos.phase(), PositionPhase::Open);

        pos.closing_in_progress = true;
        pos.closing_order_id = Some("c-1".into());
        assert_eq!(pos.phase(), PositionPhase::ExitPending);
        assert!(!pos.is_monitorable());

        pos.clear_exit();
        assert_eq!(pos.phase(), PositionPhase::Open);

        pos.mark_settled();
        assert_eq!(pos.phase(), PositionPhase::Settled);
        assert_eq!(pos.stake, 0);
        assert!(pos.check_invariants().is_ok());
    }

    #[test]
    fn test_merge_fill_weighted_average() {
        let mut pos = Position::new("KXA", Side::Yes, 0.40, 10, None, None);
        pos.merge_fill(30, 0.60);
        assert_eq!(pos.stake, 40);
        assert!((pos.entry_price - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_invariant_violation_reported() {
        let mut pos = Position::new("KXA", Side::No, 0.5, 5, None, None);
        pos.closing_in_progress = true;
        assert!(pos.check_invariants().is_err());

        pos.closing_in_progress = false;
        pos.settled = true;
        assert!(pos.check_invariants().is_err());
    }

    #[test]
    fn test_deserialize_minimal_record() {
        let json = r#"{
            "market_id": "KXA",
            "side": "no",
            "entry_price": 0.35,
            "stake": 12,
            "entry_time": "2024-05-01T12:00:00Z"
        }"#;
        let pos: Position = serde_json::from_str(json).unwrap();
        assert_eq!(pos.side, Side::No);
        assert_eq!(pos.exit_reason, ExitReason::None);
        assert!(pos.partial_fills.is_empty());
    }
}
