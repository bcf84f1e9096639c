//! Kalshi Pro - Main entry point
//!
//! Config files: kalshi-pro.toml, kalshi-pro.yaml, config.toml

use anyhow::Result;
use kalshi_pro::app::{init_logging, init_signer, init_venue};
use kalshi_pro::trading::IdleStrategy;
use kalshi_pro::websocket::KalshiStreamConnector;
use kalshi_pro::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let msg = format!("🛑 PANIC at {}: {}", location, info);
        eprintln!("{}", msg);
        let _ = std::fs::write(std::env::temp_dir().join("kalshi-pro-crash.log"), format!("{}\n", msg));
        default_panic(info);
    }));

    let config = load_config();
    init_logging(config.log_level.as_deref().unwrap_or("info"));
    config.validate()?;
    if config.api.api_key_id.is_some() && std::env::var("KALSHI_API_KEY_ID").is_err() {
        warn!("⚠️  API key loaded from config file; prefer KALSHI_API_KEY_ID");
    }

    info!("Starting Kalshi Pro v{}", VERSION);
    info!("  Live orders: {}", config.trading.live);
    info!("  Exit check: {}ms", config.trading.exit_check_interval_ms);
    info!("  Reconcile: {}s", config.trading.reconcile_interval_secs);
    info!("  Unfilled exits: {:?}", config.trading.unfilled_exit_policy);

    let signer = init_signer(&config);
    let venue = init_venue(&config, signer.clone())?;

    let journal = PositionJournal::new(
        config
            .storage
            .journal_path
            .clone()
            .unwrap_or_else(PositionJournal::default_path),
    );
    let state = journal.load()?;
    info!(
        "Restored {} positions, {} closed trades from {}",
        state.positions.len(),
        state.closed.len(),
        journal.path().display()
    );
    let store = Arc::new(PositionStore::from_state(state, config.trading.maker_fees));

    let stats_path = config
        .storage
        .stats_path
        .clone()
        .unwrap_or_else(TradingStats::default_path);
    let stats = Arc::new(tokio::sync::Mutex::new(TradingStats::load_or_new(&stats_path)));

    let mut scheduler = Scheduler::new(&config, venue, store, Arc::new(IdleStrategy), stats)
        .with_journal(journal)
        .with_stats_path(stats_path);
    scheduler.resume_subscriptions().await;

    let connector = Arc::new(KalshiStreamConnector::new(
        &config.api.ws_url,
        signer,
        Duration::from_secs(config.websocket.connect_timeout_secs),
    ));
    scheduler.start(connector);
    info!("Engine running, press Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    scheduler.shutdown().await?;
    info!("Shutdown complete");
    Ok(())
}

/// File config (if any), then environment overrides
fn load_config() -> Config {
    let mut config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            // logging is not up yet
            eprintln!("No config file found ({}), using defaults", e);
            Config::default()
        }
    };
    config.apply_env_overrides();
    config
}
