//! Trading module
//! Position lifecycle, fill tracking, exits, reconciliation and persistence

pub mod entry;
pub mod errors;
pub mod exit_manager;
pub mod fees;
pub mod journal;
pub mod order_tracker;
pub mod position;
pub mod reconcile;
pub mod simulation;
pub mod stats;
pub mod store;
pub mod strategy;

pub use entry::{EntryConfig, EntryExecutor, EntryResult};
pub use errors::TradingError;
pub use exit_manager::{
    check_exit, ExitCycleReport, ExitMonitor, ExitMonitorConfig, ExitTaskOutput,
    UnfilledExitPolicy,
};
pub use fees::{kalshi_fee, realized_pnl};
pub use journal::{JournalState, PositionJournal};
pub use order_tracker::{FillOutcome, FillStatus, FillTracker};
pub use position::{ExitReason, PartialFill, Position, PositionKey, PositionPhase};
pub use reconcile::{ReconcileReport, Reconciler};
pub use simulation::{PaperFill, PaperVenue};
pub use stats::{MetricsSnapshot, SharedStats, TradingStats};
pub use store::{ClosedTrade, EntryApplied, ExitApplied, ExitTicket, PositionStore, ReconcileAction};
pub use strategy::{IdleStrategy, MarketData, Strategy, TradeProposal};
