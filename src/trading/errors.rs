//! Engine error types

use thiserror::Error;

use crate::api::ApiError;
use crate::websocket::FeedError;

/// Trading errors with detailed classification
#[derive(Error, Debug)]
pub enum TradingError {
    /// Venue call failed
    #[error("Venue error: {0}")]
    Venue(#[from] ApiError),

    /// Price lookup failed
    #[error("Price unavailable: {0}")]
    Price(#[from] FeedError),

    /// Proposal rejected before submission
    #[error("Invalid proposal for {market_id}: {reason}")]
    InvalidProposal { market_id: String, reason: String },

    /// Position not in the store
    #[error("Position not found: {key}")]
    PositionNotFound { key: String },

    /// Exit already in flight or position not eligible
    #[error("Exit not started for {key}: {reason}")]
    ExitNotStarted { key: String, reason: String },

    /// Local state disagrees with the venue
    #[error("Inconsistent state for {key}: local={local}, live={live}")]
    Inconsistent { key: String, local: u64, live: u64 },

    /// Journal read/write failed
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl TradingError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            TradingError::Venue(e) => e.is_retryable(),
            TradingError::Price(e) => !e.is_fatal(),
            TradingError::ExitNotStarted { .. } => true,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TradingError::Venue(e) if e.is_auth() => "AUTH",
            TradingError::Venue(ApiError::RateLimited) => "RATE_LIMIT",
            TradingError::Venue(_) => "API",
            TradingError::Price(_) => "PRICE",
            TradingError::InvalidProposal { .. } => "PROPOSAL",
            TradingError::PositionNotFound { .. } => "POSITION",
            TradingError::ExitNotStarted { .. } => "EXIT",
            TradingError::Inconsistent { .. } => "INCONSISTENT",
            TradingError::Persistence(_) => "PERSISTENCE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_and_retry() {
        let err = TradingError::from(ApiError::Unauthorized("status 401".into()));
        assert_eq!(err.category(), "AUTH");
        assert!(!err.is_retryable());

        let err = TradingError::from(ApiError::RateLimited);
        assert_eq!(err.category(), "RATE_LIMIT");
        assert!(err.is_retryable());

        let err = TradingError::InvalidProposal {
            market_id: "KXA".into(),
            reason: "quantity is zero".into(),
        };
        assert_eq!(err.category(), "PROPOSAL");
        assert!(!err.is_retryable());
    }
}
