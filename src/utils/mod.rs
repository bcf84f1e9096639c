//! Utility modules

pub mod retry;
pub mod rate_limiter;

pub use retry::{retry, retry_with_backoff, Backoff, RetryConfig};
pub use rate_limiter::RateLimiter;
