//! On-disk position journal
//! Lets a restart resume reconciliation instead of losing in-flight exits

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::trading::position::{Position, PositionKey};
use crate::trading::store::ClosedTrade;

pub const JOURNAL_VERSION: u32 = 1;

/// Everything persisted between runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub closed: Vec<ClosedTrade>,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub wins: u64,
    #[serde(default)]
    pub losses: u64,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl JournalState {
    /// Repair records written by older or interrupted runs.
    ///
    /// Exits without an order id are released, settled records move to history and
    /// duplicate (market, side) entries collapse to the one with the larger stake.
    pub fn normalize(mut self) -> Self {
        let mut by_key: HashMap<PositionKey, Position> = HashMap::new();

        for mut pos in std::mem::take(&mut self.positions) {
            if pos.closing_in_progress && pos.closing_order_id.is_none() {
                warn!("Releasing exit without order id for {}", pos.key());
                pos.closing_in_progress = false;
                pos.original_stake_on_exit = None;
            }

            if pos.settled || pos.stake == 0 {
                pos.mark_settled();
                self.closed.push(ClosedTrade {
                    realized_pnl: pos.realized_pnl,
                    closed_at: pos.settled_time.unwrap_or_else(Utc::now),
                    position: pos,
                });
                continue;
            }

            let key = pos.key();
            match by_key.get(&key) {
                Some(existing) if existing.stake >= pos.stake => {
                    warn!("Dropping duplicate journal entry for {} (stake {})", key, pos.stake);
                }
                _ => {
                    by_key.insert(key, pos);
                }
            }
        }

        let mut positions: Vec<Position> = by_key.into_values().collect();
        positions.sort_by(|a, b| a.key().cmp(&b.key()));
        self.positions = positions;
        self
    }
}

/// JSON journal file
#[derive(Debug, Clone)]
pub struct PositionJournal {
    path: PathBuf,
}

impl PositionJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default journal location under the user data dir
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("kalshi-pro")
            .join("positions.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and normalize. A missing file is an empty journal.
    pub fn load(&self) -> anyhow::Result<JournalState> {
        if !self.path.exists() {
            info!("No journal at {}, starting empty", self.path.display());
            return Ok(JournalState::default());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading journal {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(JournalState::default());
        }

        let state: JournalState = serde_json::from_str(&content)
            .with_context(|| format!("parsing journal {}", self.path.display()))?;
        let state = state.normalize();
        info!(
            "📂 Restored {} open positions, {} closed trades from {}",
            state.positions.len(),
            state.closed.len(),
            self.path.display()
        );
        Ok(state)
    }

    /// Write through a temp file and rename, owner-only permissions
    pub fn save(&self, state: &JournalState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut state = state.clone();
        state.version = JOURNAL_VERSION;
        state.saved_at = Some(Utc::now());
        let content = serde_json::to_string_pretty(&state)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("writing journal {}", tmp.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = std::fs::metadata(&tmp)?.permissions();
            permissions.set_mode(0o600);
            std::fs::set_permissions(&tmp, permissions)?;
        }

        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing journal {}", self.path.display()))?;
        Ok(())
    }
}
