//! Application initialization
//! Logging setup and venue selection

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{KalshiClient, RequestSigner, StaticHeaderSigner, Venue};
use crate::config::Config;
use crate::trading::PaperVenue;

/// Initialize logging. `RUST_LOG` wins over the configured level.
pub fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(normalize_level(log_level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Map a configured level onto a filter directive
fn normalize_level(level: &str) -> &'static str {
    match level.trim().to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

pub fn init_signer(config: &Config) -> Arc<dyn RequestSigner> {
    Arc::new(StaticHeaderSigner::new(
        config.api.api_key_id.clone(),
        config.api.api_token.clone(),
    ))
}

/// Live Kalshi client, or a paper venue quoting from Kalshi in safe mode
pub fn init_venue(config: &Config, signer: Arc<dyn RequestSigner>) -> anyhow::Result<Arc<dyn Venue>> {
    let client = KalshiClient::new(
        &config.api.base_url,
        signer,
        Duration::from_secs(config.api.request_timeout_secs),
        config.api.min_request_spacing_ms,
    )
    .map_err(|e| anyhow::anyhow!("Failed to create Kalshi client: {}", e))?;

    if config.trading.live {
        warn!("💸 LIVE MODE - orders will be sent to {}", config.api.base_url);
        Ok(Arc::new(client))
    } else {
        info!("🎮 Safe mode - paper orders, live quotes");
        Ok(Arc::new(PaperVenue::with_quote_source(Arc::new(client))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_level() {
        assert_eq!(normalize_level("DEBUG"), "debug");
        assert_eq!(normalize_level("warning"), "warn");
        assert_eq!(normalize_level("verbose"), "info");
    }

    #[test]
    fn test_safe_mode_uses_paper_venue() {
        let config = Config::default();
        let signer = init_signer(&config);
        assert!(init_venue(&config, signer).is_ok());
    }
}
