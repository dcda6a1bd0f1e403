// =============================================================================
// Position bookkeeping — merge/reduce/close state machine
// =============================================================================
//
// A position is keyed by symbol. Fills on the same side merge into it with a
// quantity-weighted average entry price; fills on the opposite side reduce
// it, deleting the position once its size reaches zero. There is no partial
// take-profit status in this bookkeeping layer — `exit_plan` builds that
// behaviour on top by submitting synthetic reduce-only fills.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    fn from_fill_side(side: &str) -> Self {
        if side.eq_ignore_ascii_case("buy") {
            PositionSide::Long
        } else {
            PositionSide::Short
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub leverage: f64,
    pub opened_at: DateTime<Utc>,
    /// Realized P&L booked against this symbol over the position's life.
    /// Reset to zero on open, accumulated on every reducing fill.
    pub realized_pnl: f64,
}

impl Position {
    fn recompute_unrealized(&mut self) {
        let (pnl, denom) = match self.side {
            PositionSide::Long => (
                (self.current_price - self.entry_price) * self.size,
                self.entry_price * self.size,
            ),
            PositionSide::Short => (
                (self.entry_price - self.current_price) * self.size,
                self.entry_price * self.size,
            ),
        };
        self.unrealized_pnl = pnl;
        self.unrealized_pnl_pct = if denom != 0.0 { pnl.abs() / denom * 100.0 } else { 0.0 };
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FillOutcome {
    pub realized_pnl: f64,
    pub closed: bool,
}

/// Thread-safe map of open positions, one per symbol.
pub struct PositionManager {
    open: RwLock<HashMap<String, Position>>,
    closed: RwLock<Vec<Position>>,
    default_leverage: f64,
}

impl PositionManager {
    pub fn new() -> Self {
        Self::with_leverage(1.0)
    }

    pub fn with_leverage(default_leverage: f64) -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
            default_leverage,
        }
    }

    /// Apply a fill per the merge/reduce/close rules. Returns the realized
    /// P&L booked by this fill (zero unless it reduced or closed a
    /// position) and whether the position was fully closed.
    pub fn on_fill(&self, symbol: &str, side: &str, quantity: f64, price: f64) -> FillOutcome {
        let fill_side = PositionSide::from_fill_side(side);
        let mut open = self.open.write();

        match open.get_mut(symbol) {
            None => {
                open.insert(
                    symbol.to_string(),
                    Position {
                        symbol: symbol.to_string(),
                        side: fill_side,
                        size: quantity,
                        entry_price: price,
                        current_price: price,
                        unrealized_pnl: 0.0,
                        unrealized_pnl_pct: 0.0,
                        leverage: self.default_leverage,
                        opened_at: Utc::now(),
                        realized_pnl: 0.0,
                    },
                );
                info!(symbol, ?fill_side, quantity, price, "position opened");
                FillOutcome {
                    realized_pnl: 0.0,
                    closed: false,
                }
            }
            Some(pos) if pos.side == fill_side => {
                let new_size = pos.size + quantity;
                pos.entry_price = (pos.entry_price * pos.size + price * quantity) / new_size;
                pos.size = new_size;
                pos.recompute_unrealized();
                debug!(symbol, new_size, new_entry = pos.entry_price, "position merged");
                FillOutcome {
                    realized_pnl: 0.0,
                    closed: false,
                }
            }
            Some(pos) => {
                let direction = match pos.side {
                    PositionSide::Long => 1.0,
                    PositionSide::Short => -1.0,
                };
                if quantity >= pos.size {
                    let realized = direction * (price - pos.entry_price) * pos.size;
                    let mut closed_pos = open.remove(symbol).expect("just matched");
                    closed_pos.current_price = price;
                    closed_pos.size = 0.0;
                    closed_pos.realized_pnl += realized;
                    self.closed.write().push(closed_pos);
                    info!(symbol, realized_pnl = realized, "position closed");
                    FillOutcome {
                        realized_pnl: realized,
                        closed: true,
                    }
                } else {
                    let realized = direction * (price - pos.entry_price) * quantity;
                    pos.size -= quantity;
                    pos.realized_pnl += realized;
                    pos.recompute_unrealized();
                    debug!(symbol, remaining = pos.size, realized_pnl = realized, "position reduced");
                    FillOutcome {
                        realized_pnl: realized,
                        closed: false,
                    }
                }
            }
        }
    }

    /// Recompute unrealized P&L for the position matching `symbol`, if any.
    pub fn on_price(&self, symbol: &str, price: f64) {
        if let Some(pos) = self.open.write().get_mut(symbol) {
            pos.current_price = price;
            pos.recompute_unrealized();
        }
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.open.read().get(symbol).cloned()
    }

    pub fn get_open_positions(&self) -> Vec<Position> {
        self.open.read().values().cloned().collect()
    }

    pub fn get_closed_positions(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }

    pub fn total_exposure(&self) -> f64 {
        self.open
            .read()
            .values()
            .map(|p| p.size * p.current_price)
            .sum()
    }

    pub fn symbol_exposure(&self, symbol: &str) -> f64 {
        self.open
            .read()
            .get(symbol)
            .map(|p| p.size * p.current_price)
            .unwrap_or(0.0)
    }
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open_count = self.open.read().len();
        let closed_count = self.closed.read().len();
        f.debug_struct("PositionManager")
            .field("open_positions", &open_count)
            .field("closed_positions", &closed_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_with_no_existing_position_opens_long() {
        let pm = PositionManager::new();
        pm.on_fill("BTCUSDT", "buy", 1.0, 100.0);
        let pos = pm.get("BTCUSDT").unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        assert_eq!(pos.size, 1.0);
        assert_eq!(pos.entry_price, 100.0);
    }

    #[test]
    fn same_side_fill_merges_with_weighted_average_entry() {
        let pm = PositionManager::new();
        pm.on_fill("BTCUSDT", "buy", 1.0, 100.0);
        pm.on_fill("BTCUSDT", "buy", 1.0, 200.0);
        let pos = pm.get("BTCUSDT").unwrap();
        assert_eq!(pos.size, 2.0);
        assert!((pos.entry_price - 150.0).abs() < 1e-9);
    }

    #[test]
    fn opposite_side_partial_reduces_size_without_changing_entry() {
        let pm = PositionManager::new();
        pm.on_fill("BTCUSDT", "buy", 2.0, 100.0);
        let outcome = pm.on_fill("BTCUSDT", "sell", 0.5, 120.0);
        let pos = pm.get("BTCUSDT").unwrap();
        assert_eq!(pos.size, 1.5);
        assert_eq!(pos.entry_price, 100.0);
        assert!((outcome.realized_pnl - 10.0).abs() < 1e-9);
        assert!(!outcome.closed);
    }

    #[test]
    fn opposite_side_full_size_closes_position() {
        let pm = PositionManager::new();
        pm.on_fill("BTCUSDT", "buy", 1.0, 100.0);
        let outcome = pm.on_fill("BTCUSDT", "sell", 1.0, 110.0);
        assert!(outcome.closed);
        assert!(pm.get("BTCUSDT").is_none());
        assert_eq!(pm.get_closed_positions(1).len(), 1);
    }

    #[test]
    fn opposite_side_overfill_closes_position() {
        let pm = PositionManager::new();
        pm.on_fill("BTCUSDT", "buy", 1.0, 100.0);
        let outcome = pm.on_fill("BTCUSDT", "sell", 5.0, 110.0);
        assert!(outcome.closed);
        assert!(pm.get("BTCUSDT").is_none());
    }

    #[test]
    fn on_price_updates_unrealized_pnl_for_long() {
        let pm = PositionManager::new();
        pm.on_fill("BTCUSDT", "buy", 2.0, 100.0);
        pm.on_price("BTCUSDT", 110.0);
        let pos = pm.get("BTCUSDT").unwrap();
        assert!((pos.unrealized_pnl - 20.0).abs() < 1e-9);
        assert!((pos.unrealized_pnl_pct - 10.0).abs() < 1e-9);
    }

    #[test]
    fn on_price_updates_unrealized_pnl_for_short() {
        let pm = PositionManager::new();
        pm.on_fill("BTCUSDT", "sell", 2.0, 100.0);
        pm.on_price("BTCUSDT", 90.0);
        let pos = pm.get("BTCUSDT").unwrap();
        assert!((pos.unrealized_pnl - 20.0).abs() < 1e-9);
    }
}
