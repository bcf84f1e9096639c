//! Position store
//!
//! The single lock-guarded owner of every live position, the realized PnL ledger and
//! the closed-trade history. Every mutation of `stake`, `closing_in_progress` or
//! `settled` goes through this type, and the lock is never held across venue I/O:
//! callers copy what they need, release, do network work, then come back to apply
//! the observed outcome.
//!
//! `try_begin_exit` is the only way to start an exit. It checks and sets
//! `closing_in_progress` under the lock and reserves the order id that every later
//! outcome must present, so an outcome that arrives after reconciliation already
//! resolved the exit is recognised as stale and dropped.
//!
//! Fills applied locally bump a store epoch. Reconciliation reads the epoch before
//! fetching venue holdings and leaves alone any position changed after that point,
//! since the fetched snapshot may predate the fill.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::trading::fees;
use crate::trading::journal::JournalState;
use crate::trading::position::{ExitReason, PartialFill, Position, PositionKey, Side};

/// Closed trades kept in memory and in the journal. Totals live in the ledger.
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

/// A position that left the live store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position: Position,
    pub realized_pnl: f64,
    pub closed_at: DateTime<Utc>,
}

/// Exclusive right to exit one position, handed out by `try_begin_exit`
#[derive(Debug, Clone, PartialEq)]
pub struct ExitTicket {
    pub key: PositionKey,
    /// Client order id until the venue acknowledges, then the venue order id
    pub order_id: String,
    pub quantity: u64,
    pub price: f64,
    pub reason: ExitReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryApplied {
    Opened,
    Merged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExitApplied {
    Settled { filled: u64, pnl: f64 },
    Reduced { filled: u64, remaining: u64, pnl: f64 },
    Unchanged,
    /// The exit was already resolved elsewhere; nothing applied
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAction {
    Settled { quantity: u64, price: f64, pnl: f64 },
    Reduced { filled: u64, live: u64, pnl: f64 },
    Consistent,
    /// Restored exit with no order being tracked in this process
    ReleasedStaleExit,
    Inconsistent { local: u64, live: u64 },
    /// Changed locally after the venue snapshot was requested
    Deferred,
    Missing,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ledger {
    realized_pnl: f64,
    wins: u64,
    losses: u64,
}

impl Ledger {
    fn record(&mut self, pnl: f64) {
        self.realized_pnl += pnl;
        if pnl > 0.0 {
            self.wins += 1;
        } else if pnl < 0.0 {
            self.losses += 1;
        }
    }
}

struct StoreInner {
    positions: HashMap<PositionKey, Position>,
    closed: Vec<ClosedTrade>,
    ledger: Ledger,
    /// Exits with a live waiter in this process, by order id
    in_flight: HashMap<PositionKey, String>,
    epoch: u64,
    /// Epoch of the last locally applied fill per position
    touched: HashMap<PositionKey, u64>,
    history_limit: usize,
}

impl Default for StoreInner {
    fn default() -> Self {
        Self {
            positions: HashMap::new(),
            closed: Vec::new(),
            ledger: Ledger::default(),
            in_flight: HashMap::new(),
            epoch: 0,
            touched: HashMap::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl StoreInner {
    fn touch(&mut self, key: &PositionKey) {
        self.epoch += 1;
        self.touched.insert(key.clone(), self.epoch);
    }

    /// Realize PnL for `qty` contracts of the position at `price` and log the fill
    fn realize(
        &mut self,
        key: &PositionKey,
        qty: u64,
        price: f64,
        order_id: Option<String>,
        maker_fees: bool,
    ) -> f64 {
        let StoreInner { positions, ledger, .. } = self;
        let Some(pos) = positions.get_mut(key) else {
            return 0.0;
        };
        if qty == 0 {
            return 0.0;
        }

        let pnl = fees::realized_pnl(pos.side, pos.entry_price, price, qty, maker_fees);
        pos.realized_pnl += pnl;
        pos.partial_fills.push(PartialFill {
            qty,
            price,
            order_id,
            timestamp: Utc::now(),
        });
        pos.stake = pos.stake.saturating_sub(qty);
        ledger.record(pnl);
        pnl
    }

    fn settle(&mut self, key: &PositionKey) {
        self.in_flight.remove(key);
        self.touched.remove(key);
        if let Some(mut pos) = self.positions.remove(key) {
            pos.mark_settled();
            info!(
                "✅ Settled {} (realized PnL ${:.2})",
                key, pos.realized_pnl
            );
            self.closed.push(ClosedTrade {
                realized_pnl: pos.realized_pnl,
                position: pos,
                closed_at: Utc::now(),
            });
            self.trim_history();
        }
    }

    fn trim_history(&mut self) {
        let excess = self.closed.len().saturating_sub(self.history_limit);
        if excess > 0 {
            self.closed.drain(..excess);
        }
    }
}

/// Shared position store
pub struct PositionStore {
    inner: Mutex<StoreInner>,
    maker_fees: bool,
}

impl Default for PositionStore {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PositionStore {
    pub fn new(maker_fees: bool) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            maker_fees,
        }
    }

    /// Rebuild from a persisted journal. Restored exits have no waiter; reconciliation
    /// resolves or releases them.
    pub fn from_state(state: JournalState, maker_fees: bool) -> Self {
        let mut inner = StoreInner {
            closed: state.closed,
            ledger: Ledger {
                realized_pnl: state.realized_pnl,
                wins: state.wins,
                losses: state.losses,
            },
            ..Default::default()
        };
        for pos in state.positions.into_iter().filter(|p| !p.settled) {
            inner.positions.insert(pos.key(), pos);
        }
        inner.trim_history();
        Self {
            inner: Mutex::new(inner),
            maker_fees,
        }
    }

    /// Keep at most `limit` closed trades, oldest dropped first
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        let inner = self.inner.get_mut();
        inner.history_limit = limit;
        inner.trim_history();
        self
    }

    /// Record a confirmed entry fill, merging into an existing position on the same side
    pub async fn open_or_merge(
        &self,
        market_id: &str,
        side: Side,
        quantity: u64,
        price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        event_ticker: Option<String>,
    ) -> EntryApplied {
        let key = PositionKey::new(market_id, side);
        let mut inner = self.inner.lock().await;
        inner.touch(&key);

        match inner.positions.get_mut(&key) {
            Some(pos) => {
                pos.merge_fill(quantity, price);
                if stop_loss.is_some() {
                    pos.stop_loss = stop_loss;
                }
                if take_profit.is_some() {
                    pos.take_profit = take_profit;
                }
                info!(
                    "➕ Merged {} @ {:.2} into {} (stake {}, avg {:.3})",
                    quantity, price, key, pos.stake, pos.entry_price
                );
                EntryApplied::Merged
            }
            None => {
                let mut pos = Position::new(market_id, side, price, quantity, stop_loss, take_profit);
                pos.event_ticker = event_ticker;
                info!("🆕 Opened {} x{} @ {:.2}", key, quantity, price);
                inner.positions.insert(key, pos);
                EntryApplied::Opened
            }
        }
    }

    /// Atomically claim the exit for a position.
    ///
    /// Returns `None` when the position is missing, settled, empty, or already exiting.
    pub async fn try_begin_exit(
        &self,
        key: &PositionKey,
        price: f64,
        reason: ExitReason,
    ) -> Option<ExitTicket> {
        let mut inner = self.inner.lock().await;
        let pos = inner.positions.get_mut(key)?;
        if pos.closing_in_progress || pos.settled || pos.stake == 0 {
            return None;
        }

        let order_id = uuid::Uuid::new_v4().to_string();
        pos.closing_in_progress = true;
        pos.closing_order_id = Some(order_id.clone());
        pos.original_stake_on_exit = Some(pos.stake);
        pos.last_exit_price = Some(price);
        pos.exit_reason = reason;
        pos.exit_order_time = Some(Utc::now());

        let ticket = ExitTicket {
            key: key.clone(),
            order_id: order_id.clone(),
            quantity: pos.stake,
            price,
            reason,
        };
        inner.in_flight.insert(key.clone(), order_id);
        Some(ticket)
    }

    /// Swap the reserved client id for the venue order id.
    /// Returns false if the exit was resolved while the order was being submitted.
    pub async fn record_exit_order(&self, ticket: &mut ExitTicket, venue_order_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(pos) = inner.positions.get_mut(&ticket.key) else {
            return false;
        };
        if pos.closing_order_id.as_deref() != Some(ticket.order_id.as_str()) {
            return false;
        }

        pos.closing_order_id = Some(venue_order_id.to_string());
        inner
            .in_flight
            .insert(ticket.key.clone(), venue_order_id.to_string());
        ticket.order_id = venue_order_id.to_string();
        true
    }

    /// Give the exit back without touching stake (submission failed)
    pub async fn release_exit(&self, ticket: &ExitTicket) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.in_flight.get(&ticket.key) == Some(&ticket.order_id) {
            inner.in_flight.remove(&ticket.key);
        }
        match inner.positions.get_mut(&ticket.key) {
            Some(pos) if pos.closing_order_id.as_deref() == Some(ticket.order_id.as_str()) => {
                pos.clear_exit();
                true
            }
            _ => false,
        }
    }

    /// Stop waiting on an exit whose submission outcome is unknown. The claim stays,
    /// so no second exit is sent; reconciliation resolves or releases it.
    pub async fn detach_exit(&self, ticket: &ExitTicket) {
        let mut inner = self.inner.lock().await;
        if inner.in_flight.get(&ticket.key) == Some(&ticket.order_id) {
            inner.in_flight.remove(&ticket.key);
        }
    }

    /// Apply an observed exit fill
    pub async fn apply_exit_outcome(&self, ticket: &ExitTicket, filled: u64) -> ExitApplied {
        let mut inner = self.inner.lock().await;
        if inner.in_flight.get(&ticket.key) == Some(&ticket.order_id) {
            inner.in_flight.remove(&ticket.key);
        }

        let stake = match inner.positions.get(&ticket.key) {
            Some(pos) if pos.closing_order_id.as_deref() == Some(ticket.order_id.as_str()) => {
                pos.stake
            }
            _ => {
                debug!("Ignoring stale exit outcome for {} ({})", ticket.key, ticket.order_id);
                return ExitApplied::Stale;
            }
        };

        let filled = filled.min(stake);
        if filled == 0 {
            if let Some(pos) = inner.positions.get_mut(&ticket.key) {
                pos.clear_exit();
            }
            return ExitApplied::Unchanged;
        }

        let pnl = inner.realize(
            &ticket.key,
            filled,
            ticket.price,
            Some(ticket.order_id.clone()),
            self.maker_fees,
        );
        inner.touch(&ticket.key);
        let remaining = stake - filled;

        if remaining == 0 {
            inner.settle(&ticket.key);
            ExitApplied::Settled { filled, pnl }
        } else {
            if let Some(pos) = inner.positions.get_mut(&ticket.key) {
                pos.clear_exit();
            }
            ExitApplied::Reduced {
                filled,
                remaining,
                pnl,
            }
        }
    }

    /// Current fill epoch. Read it before requesting venue holdings.
    pub async fn epoch(&self) -> u64 {
        self.inner.lock().await.epoch
    }

    /// Converge one position toward the venue's live quantity. Stake is never increased.
    ///
    /// `snapshot_epoch` is the epoch read before the holdings were fetched; a position
    /// with a fill applied after it is `Deferred` to the next cycle.
    pub async fn apply_live_quantity(
        &self,
        key: &PositionKey,
        live: u64,
        fallback_price: Option<f64>,
        snapshot_epoch: u64,
    ) -> ReconcileAction {
        let mut inner = self.inner.lock().await;
        if inner.touched.get(key).is_some_and(|&at| at > snapshot_epoch) {
            return ReconcileAction::Deferred;
        }
        let (stake, price, order_id, closing) = match inner.positions.get(key) {
            Some(pos) if !pos.settled => (
                pos.stake,
                pos.last_exit_price
                    .or(fallback_price)
                    .unwrap_or(pos.entry_price),
                pos.closing_order_id.clone(),
                pos.closing_in_progress,
            ),
            _ => return ReconcileAction::Missing,
        };

        if live == 0 {
            let pnl = inner.realize(key, stake, price, order_id, self.maker_fees);
            inner.settle(key);
            return ReconcileAction::Settled {
                quantity: stake,
                price,
                pnl,
            };
        }

        if live < stake {
            let filled = stake - live;
            let pnl = inner.realize(key, filled, price, order_id, self.maker_fees);
            inner.in_flight.remove(key);
            if let Some(pos) = inner.positions.get_mut(key) {
                pos.stake = live;
                pos.clear_exit();
            }
            return ReconcileAction::Reduced { filled, live, pnl };
        }

        if live == stake {
            if closing && !inner.in_flight.contains_key(key) {
                if let Some(pos) = inner.positions.get_mut(key) {
                    pos.clear_exit();
                }
                warn!("Released restored exit for {} (no fill observed)", key);
                return ReconcileAction::ReleasedStaleExit;
            }
            return ReconcileAction::Consistent;
        }

        ReconcileAction::Inconsistent { local: stake, live }
    }

    pub async fn get(&self, key: &PositionKey) -> Option<Position> {
        self.inner.lock().await.positions.get(key).cloned()
    }

    /// All live (non-settled) positions, ordered by key
    pub async fn positions(&self) -> Vec<Position> {
        let inner = self.inner.lock().await;
        let mut positions: Vec<Position> = inner.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.key().cmp(&b.key()));
        positions
    }

    /// Positions the exit monitor should evaluate
    pub async fn monitorable(&self) -> Vec<Position> {
        let mut positions = self.positions().await;
        positions.retain(|p| p.is_monitorable());
        positions
    }

    /// Distinct markets referenced by live positions
    pub async fn active_markets(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut markets: Vec<String> = inner
            .positions
            .values()
            .filter(|p| !p.settled)
            .map(|p| p.market_id.clone())
            .collect();
        markets.sort();
        markets.dedup();
        markets
    }

    pub async fn is_closing(&self, key: &PositionKey) -> bool {
        self.inner
            .lock()
            .await
            .positions
            .get(key)
            .map(|p| p.closing_in_progress)
            .unwrap_or(false)
    }

    /// Audit trail of exit fills, from the live position or its most recent closed record
    pub async fn partial_fills(&self, key: &PositionKey) -> Vec<PartialFill> {
        let inner = self.inner.lock().await;
        if let Some(pos) = inner.positions.get(key) {
            return pos.partial_fills.clone();
        }
        inner
            .closed
            .iter()
            .rev()
            .find(|t| &t.position.key() == key)
            .map(|t| t.position.partial_fills.clone())
            .unwrap_or_default()
    }

    pub async fn closed_trades(&self) -> Vec<ClosedTrade> {
        self.inner.lock().await.closed.clone()
    }

    /// (realized_pnl, wins, losses)
    pub async fn totals(&self) -> (f64, u64, u64) {
        let ledger = self.inner.lock().await.ledger;
        (ledger.realized_pnl, ledger.wins, ledger.losses)
    }

    /// Serializable copy of everything the journal needs
    pub async fn snapshot(&self) -> JournalState {
        let inner = self.inner.lock().await;
        let mut positions: Vec<Position> = inner.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.key().cmp(&b.key()));
        JournalState {
            positions,
            closed: inner.closed.clone(),
            realized_pnl: inner.ledger.realized_pnl,
            wins: inner.ledger.wins,
            losses: inner.ledger.losses,
            ..JournalState::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    async fn store_with(stake: u64) -> (PositionStore, PositionKey) {
        let store = PositionStore::new(true);
        store
            .open_or_merge("KXA", Side::Yes, stake, 0.50, Some(0.40), Some(0.70), None)
            .await;
        (store, PositionKey::new("KXA", Side::Yes))
    }

    #[tokio::test]
    async fn test_begin_exit_is_exclusive() {
        let (store, key) = store_with(100).await;

        let ticket = store.try_begin_exit(&key, 0.39, ExitReason::StopLoss).await;
        assert!(ticket.is_some());
        assert!(store.try_begin_exit(&key, 0.39, ExitReason::StopLoss).await.is_none());

        let pos = store.get(&key).await.unwrap();
        assert!(pos.closing_in_progress);
        assert_eq!(pos.original_stake_on_exit, Some(100));
        assert_eq!(pos.closing_order_id, ticket.map(|t| t.order_id));
        assert!(pos.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_begin_exit_single_winner() {
        let (store, key) = store_with(10).await;
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.try_begin_exit(&key, 0.3, ExitReason::StopLoss).await.is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_partial_exit_reduces_and_reopens() {
        let (store, key) = store_with(100).await;
        let ticket = store.try_begin_exit(&key, 0.60, ExitReason::TakeProfit).await.unwrap();

        let applied = store.apply_exit_outcome(&ticket, 50).await;
        assert!(matches!(applied, ExitApplied::Reduced { filled: 50, remaining: 50, .. }));

        let pos = store.get(&key).await.unwrap();
        assert_eq!(pos.stake, 50);
        assert!(!pos.closing_in_progress);
        assert!(pos.closing_order_id.is_none());
        assert_eq!(pos.partial_fills.len(), 1);
        assert_eq!(pos.partial_fills[0].qty, 50);
        assert!(pos.is_monitorable());
    }

    #[tokio::test]
    async fn test_full_exit_settles_into_history() {
        let (store, key) = store_with(20).await;
        let ticket = store.try_begin_exit(&key, 0.60, ExitReason::TakeProfit).await.unwrap();

        let applied = store.apply_exit_outcome(&ticket, 20).await;
        assert!(matches!(applied, ExitApplied::Settled { filled: 20, .. }));
        assert!(store.get(&key).await.is_none());

        let closed = store.closed_trades().await;
        assert_eq!(closed.len(), 1);
        assert!(closed[0].position.settled);
        assert_eq!(closed[0].position.stake, 0);

        // (0.60 - 0.50 - 0.01 - 0.01) * 20
        let (pnl, wins, losses) = store.totals().await;
        assert!((pnl - 1.6).abs() < 1e-9);
        assert_eq!((wins, losses), (1, 0));
        assert_eq!(store.partial_fills(&key).await.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_fill_releases_without_pnl() {
        let (store, key) = store_with(100).await;
        let ticket = store.try_begin_exit(&key, 0.39, ExitReason::StopLoss).await.unwrap();

        assert_eq!(store.apply_exit_outcome(&ticket, 0).await, ExitApplied::Unchanged);
        let pos = store.get(&key).await.unwrap();
        assert_eq!(pos.stake, 100);
        assert!(!pos.closing_in_progress);
        assert_eq!(store.totals().await, (0.0, 0, 0));
    }

    #[tokio::test]
    async fn test_outcome_after_reconciliation_is_stale() {
        let (store, key) = store_with(100).await;
        let ticket = store.try_begin_exit(&key, 0.60, ExitReason::TakeProfit).await.unwrap();

        let action = store.apply_live_quantity(&key, 60, None, store.epoch().await).await;
        assert!(matches!(action, ReconcileAction::Reduced { filled: 40, live: 60, .. }));

        // the waiter's view of the same fill must not be applied twice
        assert_eq!(store.apply_exit_outcome(&ticket, 40).await, ExitApplied::Stale);
        let pos = store.get(&key).await.unwrap();
        assert_eq!(pos.stake, 60);
        assert_eq!(pos.partial_fills.len(), 1);
    }

    #[tokio::test]
    async fn test_record_exit_order_swaps_id() {
        let (store, key) = store_with(5).await;
        let mut ticket = store.try_begin_exit(&key, 0.3, ExitReason::StopLoss).await.unwrap();

        assert!(store.record_exit_order(&mut ticket, "venue-1").await);
        assert_eq!(ticket.order_id, "venue-1");
        assert_eq!(
            store.get(&key).await.unwrap().closing_order_id.as_deref(),
            Some("venue-1")
        );

        assert!(store.release_exit(&ticket).await);
        assert!(!store.get(&key).await.unwrap().closing_in_progress);
    }

    #[tokio::test]
    async fn test_fill_after_snapshot_is_deferred() {
        let (store, key) = store_with(10).await;
        let before = store.epoch().await;

        // entry merged while the venue snapshot (still showing 10) was in flight
        store
            .open_or_merge("KXA", Side::Yes, 10, 0.52, None, None, None)
            .await;
        store
            .open_or_merge("KXNEW", Side::No, 5, 0.30, None, None, None)
            .await;

        assert_eq!(
            store.apply_live_quantity(&key, 10, None, before).await,
            ReconcileAction::Deferred
        );
        let fresh = PositionKey::new("KXNEW", Side::No);
        assert_eq!(
            store.apply_live_quantity(&fresh, 0, None, before).await,
            ReconcileAction::Deferred
        );
        assert_eq!(store.get(&key).await.unwrap().stake, 20);
        assert_eq!(store.get(&fresh).await.unwrap().stake, 5);
        assert_eq!(store.totals().await, (0.0, 0, 0));

        // next cycle sees a snapshot taken after the fills
        let after = store.epoch().await;
        assert_eq!(
            store.apply_live_quantity(&key, 20, None, after).await,
            ReconcileAction::Consistent
        );
    }

    #[tokio::test]
    async fn test_closed_history_is_capped() {
        let store = PositionStore::new(true).with_history_limit(2);
        for market in ["KX1", "KX2", "KX3"] {
            store
                .open_or_merge(market, Side::Yes, 10, 0.50, None, None, None)
                .await;
            let key = PositionKey::new(market, Side::Yes);
            let ticket = store.try_begin_exit(&key, 0.60, ExitReason::Manual).await.unwrap();
            store.apply_exit_outcome(&ticket, 10).await;
        }

        let closed: Vec<String> = store
            .closed_trades()
            .await
            .into_iter()
            .map(|t| t.position.market_id)
            .collect();
        assert_eq!(closed, vec!["KX2".to_string(), "KX3".to_string()]);
        // ledger still counts every trade
        assert_eq!(store.totals().await.1, 3);
    }

    #[tokio::test]
    async fn test_live_quantity_never_increases_stake() {
        let (store, key) = store_with(10).await;
        let action = store.apply_live_quantity(&key, 25, None, store.epoch().await).await;
        assert_eq!(action, ReconcileAction::Inconsistent { local: 10, live: 25 });
        assert_eq!(store.get(&key).await.unwrap().stake, 10);
    }

    #[tokio::test]
    async fn test_vanished_position_settles_at_best_known_price() {
        let (store, key) = store_with(10).await;
        let action = store.apply_live_quantity(&key, 0, Some(0.80), store.epoch().await).await;
        match action {
            ReconcileAction::Settled { quantity, price, .. } => {
                assert_eq!(quantity, 10);
                assert_eq!(price, 0.80);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(store.active_markets().await.is_empty());
    }

    #[tokio::test]
    async fn test_restored_exit_released_when_consistent() {
        let mut pos = Position::new("KXB", Side::No, 0.4, 8, None, None);
        pos.closing_in_progress = true;
        pos.closing_order_id = Some("old-order".into());
        let state = JournalState {
            positions: vec![pos],
            ..JournalState::default()
        };
        let store = PositionStore::from_state(state, true);
        let key = PositionKey::new("KXB", Side::No);

        assert_eq!(
            store.apply_live_quantity(&key, 8, None, store.epoch().await).await,
            ReconcileAction::ReleasedStaleExit
        );
        assert!(store.get(&key).await.unwrap().is_monitorable());
    }

    #[tokio::test]
    async fn test_merge_keeps_weighted_entry() {
        let (store, key) = store_with(10).await;
        let applied = store
            .open_or_merge("KXA", Side::Yes, 10, 0.70, None, None, None)
            .await;
        assert_eq!(applied, EntryApplied::Merged);
        let pos = store.get(&key).await.unwrap();
        assert_eq!(pos.stake, 20);
        assert!((pos.entry_price - 0.60).abs() < 1e-9);
        assert_eq!(pos.stop_loss, Some(0.40));
    }
}
