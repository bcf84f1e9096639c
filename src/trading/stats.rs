//! Trading statistics and the read-only metrics snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::trading::position::{Position, PositionKey};

/// Operator counters, shared between engine tasks
pub type SharedStats = Arc<Mutex<TradingStats>>;

/// Trading statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradingStats {
    pub start_time: String,
    pub orders_placed: u64,
    pub orders_filled: u64,
    pub orders_partial: u64,
    pub orders_cancelled: u64,
    pub orders_timed_out: u64,
    pub exits_triggered: u64,
    pub reconcile_corrections: u64,
    pub inconsistencies: u64,
    pub errors: u64,
    pub total_volume: u64,
    pub last_update: String,
}

impl TradingStats {
    /// Create new stats with current time
    pub fn new() -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            start_time: now.clone(),
            last_update: now,
            ..Default::default()
        }
    }

    pub fn shared() -> SharedStats {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Record order placed
    pub fn record_order_placed(&mut self, quantity: u64) {
        self.orders_placed += 1;
        self.total_volume += quantity;
        self.update_time();
    }

    pub fn record_order_filled(&mut self) {
        self.orders_filled += 1;
        self.update_time();
    }

    pub fn record_order_partial(&mut self) {
        self.orders_partial += 1;
        self.update_time();
    }

    pub fn record_order_cancelled(&mut self) {
        self.orders_cancelled += 1;
        self.update_time();
    }

    /// Record an order that did not resolve before its wait expired
    pub fn record_order_timeout(&mut self) {
        self.orders_timed_out += 1;
        self.update_time();
    }

    pub fn record_exit_triggered(&mut self) {
        self.exits_triggered += 1;
        self.update_time();
    }

    pub fn record_reconcile_correction(&mut self) {
        self.reconcile_corrections += 1;
        self.update_time();
    }

    pub fn record_inconsistency(&mut self) {
        self.inconsistencies += 1;
        self.update_time();
    }

    /// Record error
    pub fn record_error(&mut self) {
        self.errors += 1;
        self.update_time();
    }

    /// Save stats to file with owner-only permissions
    pub fn save_to_file(&self, filepath: &Path) -> anyhow::Result<()> {
        if let Some(parent) = filepath.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(filepath, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = std::fs::metadata(filepath)?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o600);
            std::fs::set_permissions(filepath, permissions)?;
        }

        Ok(())
    }

    pub fn load_from_file(filepath: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(filepath)?;
        let stats: TradingStats = serde_json::from_str(&content)?;
        Ok(stats)
    }

    /// Default stats location under the user data dir
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("kalshi-pro")
            .join("kalshi_stats.json")
    }

    /// Load stats or create new
    pub fn load_or_new(filepath: &Path) -> Self {
        match Self::load_from_file(filepath) {
            Ok(stats) => {
                tracing::info!("Loaded stats from {}", filepath.display());
                stats
            }
            Err(_) => {
                tracing::info!("Creating new stats");
                Self::new()
            }
        }
    }

    /// Get summary
    pub fn summary(&self) -> String {
        format!(
            "📊 Stats: orders placed={}, filled={}, partial={}, cancelled={}, timeouts={}, exits={}, corrections={}, inconsistencies={}, errors={}, volume={}",
            self.orders_placed,
            self.orders_filled,
            self.orders_partial,
            self.orders_cancelled,
            self.orders_timed_out,
            self.exits_triggered,
            self.reconcile_corrections,
            self.inconsistencies,
            self.errors,
            self.total_volume,
        )
    }

    fn update_time(&mut self) {
        self.last_update = Utc::now().to_rfc3339();
    }
}

/// Read-only view published by the metrics task
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub positions: Vec<Position>,
    pub realized_pnl: f64,
    pub win_count: u64,
    pub loss_count: u64,
    /// Positions needing operator attention
    pub flagged: Vec<PositionKey>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MetricsSnapshot {
    pub fn open_stake(&self) -> u64 {
        self.positions.iter().map(|p| p.stake).sum()
    }
}
