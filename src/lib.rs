//! Kalshi Pro - position lifecycle and reconciliation engine for Kalshi
//!
//! Features:
//! - Stop-loss / take-profit exits with partial-fill-aware outcomes
//! - WebSocket price feed with REST fallback
//! - Reconciliation against venue holdings
//! - JSON position journal with restart recovery
//! - Paper venue for safe mode

pub mod api;
pub mod app;
pub mod config;
pub mod trading;
pub mod utils;
pub mod websocket;

// Re-export commonly used types
pub use api::{KalshiClient, OrderAction, OrderRequest, Side, Venue};
pub use app::Scheduler;
pub use config::{ApiConfig, Config, StorageConfig, TradingConfig, WebSocketConfig};
pub use trading::{
    ExitMonitor, ExitReason, FillStatus, FillTracker, MetricsSnapshot, PaperVenue, Position,
    PositionJournal, PositionKey, PositionStore, Reconciler, Strategy, TradeProposal,
    TradingStats,
};
pub use utils::{rate_limiter, retry};
pub use websocket::{FeedError, PriceFeed};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KalshiProError {
    #[error("API error: {0}")]
    Api(#[from] api::ApiError),
    #[error("Feed error: {0}")]
    Feed(#[from] websocket::FeedError),
    #[error("Trading error: {0}")]
    Trading(#[from] trading::TradingError),
}

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
