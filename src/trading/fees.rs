//! Kalshi fee schedule and fee-aware PnL

use crate::api::Side;

/// Maker fee rate
pub const MAKER_FEE_RATE: f64 = 0.0175;
/// Taker fee rate
pub const TAKER_FEE_RATE: f64 = 0.07;

/// Fee in dollars for `contracts` at `price`, rounded up to the cent.
/// `p * (1 - p)` is symmetric so YES and NO contract prices give the same fee.
pub fn kalshi_fee(contracts: u64, price: f64, maker: bool) -> f64 {
    let rate = if maker { MAKER_FEE_RATE } else { TAKER_FEE_RATE };
    let p = price.clamp(0.0, 1.0);
    let raw = rate * contracts as f64 * p * (1.0 - p) * 100.0;
    // float noise must not bump an exact cent to the next one
    (raw - 1e-9).ceil().max(0.0) / 100.0
}

pub fn fee_per_contract(price: f64, maker: bool) -> f64 {
    kalshi_fee(1, price, maker)
}

/// Realized PnL for closing `quantity` contracts bought at `entry` and sold at `exit`.
/// Both prices on the YES scale; the side sets the direction.
pub fn realized_pnl(side: Side, entry: f64, exit: f64, quantity: u64, maker: bool) -> f64 {
    let per_contract = (exit - entry) * side.direction()
        - fee_per_contract(exit, maker)
        - fee_per_contract(entry, maker);
    per_contract * quantity as f64
}
