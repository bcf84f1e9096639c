//! Rate limiting protection for venue REST calls

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Enforces a minimum spacing between consecutive API calls
pub struct RateLimiter {
    last_call: Mutex<Option<Instant>>,
    min_delay: Duration,
}

impl RateLimiter {
    /// Create new rate limiter
    pub fn new(min_delay_ms: u64) -> Self {
        Self {
            last_call: Mutex::new(None),
            min_delay: Duration::from_millis(min_delay_ms),
        }
    }

    /// Create default rate limiter (100ms spacing, ~10 req/s)
    pub fn new_default() -> Self {
        Self::new(100)
    }

    /// Wait if needed before making API call
    pub async fn wait(&self) {
        let mut last = self.last_call.lock().await;

        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_delay {
                sleep(self.min_delay - elapsed).await;
            }
        }

        *last = Some(Instant::now());
    }

    /// Reset the rate limiter
    pub async fn reset(&self) {
        *self.last_call.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_spaces_calls() {
        let limiter = RateLimiter::new(20);

        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;

        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_rate_limiter_reset() {
        let limiter = RateLimiter::new(1000); // 1s delay

        limiter.wait().await;
        limiter.reset().await;

        let start = Instant::now();
        limiter.wait().await; // Should not wait after reset

        let elapsed = start.elapsed().as_millis() as u64;
        assert!(elapsed < 100, "Expected no delay after reset");
    }
}
