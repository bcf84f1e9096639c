//! Configuration management
//! Supports TOML, YAML, JSON config files with environment overrides

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::api::kalshi::KALSHI_API_URL;
use crate::trading::exit_manager::{ExitMonitorConfig, UnfilledExitPolicy};
use crate::trading::entry::EntryConfig;
use crate::websocket::FeedConfig;

pub const KALSHI_WS_URL: &str = "wss://api.elections.kalshi.com/trade-api/ws/v2";

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging level
    pub log_level: Option<String>,
    /// Venue endpoints and credentials
    pub api: ApiConfig,
    /// Task intervals, fill timeouts and exit policy
    pub trading: TradingConfig,
    /// WebSocket settings
    pub websocket: WebSocketConfig,
    /// Journal and stats locations
    pub storage: StorageConfig,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub ws_url: String,
    pub api_key_id: Option<String>,
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
    /// Minimum spacing between REST calls
    pub min_request_spacing_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: KALSHI_API_URL.to_string(),
            ws_url: KALSHI_WS_URL.to_string(),
            api_key_id: None,
            api_token: None,
            request_timeout_secs: 10,
            min_request_spacing_ms: 100,
        }
    }
}

/// Trading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Send real orders (default: false, paper venue)
    pub live: bool,
    /// Exit monitor cadence in ms (default: 2000)
    pub exit_check_interval_ms: u64,
    /// Reconciliation cadence in seconds (default: 10)
    pub reconcile_interval_secs: u64,
    /// Strategy loop cadence in seconds (default: 30)
    pub strategy_interval_secs: u64,
    /// Metrics and persistence cadence in seconds (default: 60)
    pub metrics_interval_secs: u64,
    pub exit_fill_timeout_secs: u64,
    pub entry_fill_timeout_secs: u64,
    pub fill_poll_interval_ms: u64,
    pub fill_initial_wait_ms: u64,
    /// What to do with a resting exit remainder
    pub unfilled_exit_policy: UnfilledExitPolicy,
    /// Consecutive inconsistent cycles before a position is flagged (default: 3)
    pub inconsistency_alert_cycles: u32,
    pub max_contracts_per_market: Option<u64>,
    /// PnL with maker fees (default: true)
    pub maker_fees: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            live: false,
            exit_check_interval_ms: 2000,
            reconcile_interval_secs: 10,
            strategy_interval_secs: 30,
            metrics_interval_secs: 60,
            exit_fill_timeout_secs: 5,
            entry_fill_timeout_secs: 30,
            fill_poll_interval_ms: 1000,
            fill_initial_wait_ms: 300,
            unfilled_exit_policy: UnfilledExitPolicy::default(),
            inconsistency_alert_cycles: 3,
            max_contracts_per_market: None,
            maker_fees: true,
        }
    }
}

/// WebSocket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// Cached prices older than this are refreshed over REST
    pub price_stale_secs: u64,
    pub ping_interval_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 5000,
            max_reconnect_delay_ms: 60000,
            price_stale_secs: 60,
            ping_interval_secs: 10,
            connect_timeout_secs: 10,
        }
    }
}

/// Storage locations; `None` means the platform data dir
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub journal_path: Option<PathBuf>,
    pub stats_path: Option<PathBuf>,
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|s| s.trim().parse().ok())
}

fn env_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    lookup(name).map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)?;

        let config = if path.extension().map(|e| e == "toml").unwrap_or(false) {
            toml::from_str(&content)?
        } else if path.extension().map(|e| e == "yaml" || e == "yml").unwrap_or(false) {
            serde_yaml::from_str(&content)?
        } else if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else if content.trim().starts_with('{') {
            serde_json::from_str(&content)?
        } else if content.contains("---") {
            serde_yaml::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load from default locations
    pub fn load() -> anyhow::Result<Self> {
        let locations = [
            "kalshi-pro.toml",
            "kalshi-pro.yaml",
            "kalshi-pro.yml",
            "kalshi-pro.json",
            "config.toml",
            "config.yaml",
            ".kalshi-pro.toml",
        ];

        for location in &locations {
            if Path::new(location).exists() {
                return Self::from_file(location);
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let config_file = config_dir.join("kalshi-pro/config.toml");
            if config_file.exists() {
                return Self::from_file(config_file);
            }
        }

        anyhow::bail!("No configuration file found. Expected one of: {:?}", locations)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any variable source; set variables win over the file
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("KALSHI_API_KEY_ID") {
            self.api.api_key_id = Some(v);
        }
        if let Some(v) = lookup("KALSHI_API_TOKEN") {
            self.api.api_token = Some(v);
        }
        if let Some(v) = lookup("KALSHI_BASE_URL") {
            self.api.base_url = v;
        }
        if let Some(v) = lookup("KALSHI_WS_URL") {
            self.api.ws_url = v;
        }
        if let Some(v) = env_bool(&lookup, "PLACE_LIVE_KALSHI_ORDERS") {
            self.trading.live = v;
        }
        if let Some(v) = env_parse(&lookup, "STOP_LOSS_CHECK_INTERVAL_MS") {
            self.trading.exit_check_interval_ms = v;
        }
        if let Some(v) = env_parse(&lookup, "RECONCILE_INTERVAL_SECS") {
            self.trading.reconcile_interval_secs = v;
        }
        if let Some(v) = env_parse(&lookup, "STRATEGY_LOOP_INTERVAL_SECS") {
            self.trading.strategy_interval_secs = v;
        }
        if let Some(v) = env_parse(&lookup, "WEBSOCKET_RECONNECT_DELAY_MS") {
            self.websocket.reconnect_delay_ms = v;
        }
        if let Some(v) = env_parse(&lookup, "WEBSOCKET_MAX_RECONNECT_DELAY_MS") {
            self.websocket.max_reconnect_delay_ms = v;
        }
        if let Some(v) = env_parse(&lookup, "WEBSOCKET_PRICE_CACHE_STALE_SECS") {
            self.websocket.price_stale_secs = v;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = Some(v);
        }
    }

    /// Save configuration to file (credentials are redacted)
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();

        let mut safe_config = self.clone();
        safe_config.api.api_key_id = None;
        safe_config.api.api_token = None;

        let content = if path.extension().map(|e| e == "toml").unwrap_or(false) {
            toml::to_string_pretty(&safe_config)?
        } else if path.extension().map(|e| e == "yaml" || e == "yml").unwrap_or(false) {
            serde_yaml::to_string(&safe_config)?
        } else {
            serde_json::to_string_pretty(&safe_config)?
        };

        std::fs::write(path, content)?;
        info!("Configuration saved to: {} (credentials redacted)", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.api.base_url.starts_with("http") {
            anyhow::bail!("api.base_url must be an http(s) URL");
        }
        if !self.api.ws_url.starts_with("ws") {
            anyhow::bail!("api.ws_url must be a ws(s) URL");
        }
        if self.trading.live && self.api.api_key_id.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("Live trading requires KALSHI_API_KEY_ID");
        }

        let t = &self.trading;
        if t.exit_check_interval_ms == 0
            || t.reconcile_interval_secs == 0
            || t.strategy_interval_secs == 0
            || t.metrics_interval_secs == 0
        {
            anyhow::bail!("Task intervals must be positive");
        }
        if t.exit_fill_timeout_secs == 0 || t.entry_fill_timeout_secs == 0 {
            anyhow::bail!("Fill timeouts must be positive");
        }
        if t.fill_poll_interval_ms == 0 {
            anyhow::bail!("fill_poll_interval_ms must be positive");
        }
        if t.inconsistency_alert_cycles == 0 {
            anyhow::bail!("inconsistency_alert_cycles must be at least 1");
        }

        let ws = &self.websocket;
        if ws.reconnect_delay_ms == 0 || ws.reconnect_delay_ms > ws.max_reconnect_delay_ms {
            anyhow::bail!("Reconnect delay must be positive and not exceed the maximum");
        }
        if ws.price_stale_secs == 0 {
            anyhow::bail!("price_stale_secs must be positive");
        }
        Ok(())
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            stale_after: Duration::from_secs(self.websocket.price_stale_secs),
            reconnect_initial: Duration::from_millis(self.websocket.reconnect_delay_ms),
            reconnect_max: Duration::from_millis(self.websocket.max_reconnect_delay_ms),
            ping_interval: Duration::from_secs(self.websocket.ping_interval_secs.max(1)),
        }
    }

    pub fn exit_config(&self) -> ExitMonitorConfig {
        ExitMonitorConfig {
            exit_timeout: Duration::from_secs(self.trading.exit_fill_timeout_secs),
            unfilled_policy: self.trading.unfilled_exit_policy,
        }
    }

    pub fn entry_config(&self) -> EntryConfig {
        EntryConfig {
            fill_timeout: Duration::from_secs(self.trading.entry_fill_timeout_secs),
            max_contracts_per_market: self.trading.max_contracts_per_market,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.trading.live);
        assert_eq!(config.trading.exit_check_interval_ms, 2000);
        assert_eq!(config.trading.reconcile_interval_secs, 10);
        assert_eq!(config.websocket.reconnect_delay_ms, 5000);
        assert_eq!(config.websocket.max_reconnect_delay_ms, 60000);
        assert_eq!(config.trading.unfilled_exit_policy, UnfilledExitPolicy::LeaveForReconciliation);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kalshi-pro.toml");
        std::fs::write(
            &path,
            "[trading]\nreconcile_interval_secs = 20\nunfilled_exit_policy = \"cancel_remainder\"\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.trading.reconcile_interval_secs, 20);
        assert_eq!(config.trading.unfilled_exit_policy, UnfilledExitPolicy::CancelRemainder);
        assert_eq!(config.trading.exit_check_interval_ms, 2000);
        assert_eq!(config.api.base_url, KALSHI_API_URL);
    }

    #[test]
    fn test_env_overrides_win() {
        let vars: HashMap<&str, &str> = [
            ("KALSHI_API_KEY_ID", "key-1"),
            ("PLACE_LIVE_KALSHI_ORDERS", "true"),
            ("STOP_LOSS_CHECK_INTERVAL_MS", "1500"),
            ("WEBSOCKET_PRICE_CACHE_STALE_SECS", "30"),
            ("RECONCILE_INTERVAL_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.api.api_key_id.as_deref(), Some("key-1"));
        assert!(config.trading.live);
        assert_eq!(config.trading.exit_check_interval_ms, 1500);
        assert_eq!(config.websocket.price_stale_secs, 30);
        assert_eq!(config.trading.reconcile_interval_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.trading.live = true;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.websocket.reconnect_delay_ms = 90_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.trading.inconsistency_alert_cycles = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_redacts_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.json");
        let mut config = Config::default();
        config.api.api_key_id = Some("secret-key".into());
        config.api.api_token = Some("secret-token".into());

        config.save_to_file(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("secret-key"));
        assert!(!content.contains("secret-token"));

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.trading.exit_check_interval_ms, 2000);
    }
}
