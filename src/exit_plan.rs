// =============================================================================
// Exit Plan — TP1/TP2/stop-loss/trailing-stop ladder as a price-feed consumer
// =============================================================================
//
// This sits above the core position book: it never touches `Position`
// directly. It watches `on_price` ticks and, when a barrier triggers,
// returns an `ExitAction` describing a synthetic reduce-only fill for the
// caller to route through the same `on_fill` path a real fill would take.
// Keeping the ladder here lets `position_engine` stay a plain merge/reduce
// ledger instead of baking a specific exit strategy into it.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

use crate::position_engine::PositionSide;

const TRAILING_STOP_PCT: f64 = 0.005;
const TP1_CLOSE_FRACTION: f64 = 0.60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit1,
    TakeProfit2,
    TrailingStop,
}

#[derive(Debug, Clone, Copy)]
pub struct ExitAction {
    pub reason: ExitReason,
    pub close_fraction: f64,
    pub price: f64,
}

#[derive(Debug, Clone)]
struct ExitPlan {
    side: PositionSide,
    stop_loss: f64,
    take_profit_1: f64,
    take_profit_2: f64,
    tp1_filled: bool,
    highest_price: f64,
    lowest_price: f64,
    trailing_stop: Option<f64>,
}

/// Keyed by symbol. One plan per open position; `register` overwrites and
/// `clear` removes once the underlying position is gone.
pub struct ExitPlanManager {
    plans: RwLock<HashMap<String, ExitPlan>>,
}

impl ExitPlanManager {
    pub fn new() -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        symbol: &str,
        side: PositionSide,
        entry_price: f64,
        stop_loss: f64,
        take_profit_1: f64,
        take_profit_2: f64,
    ) {
        self.plans.write().insert(
            symbol.to_string(),
            ExitPlan {
                side,
                stop_loss,
                take_profit_1,
                take_profit_2,
                tp1_filled: false,
                highest_price: entry_price,
                lowest_price: entry_price,
                trailing_stop: None,
            },
        );
    }

    pub fn clear(&self, symbol: &str) {
        self.plans.write().remove(symbol);
    }

    /// Evaluate the ladder for one price tick. Priority: stop-loss, then
    /// TP2 (full close), then TP1 (partial close, once), then trailing
    /// stop. At most one action fires per tick.
    pub fn on_price(&self, symbol: &str, price: f64) -> Option<ExitAction> {
        let mut plans = self.plans.write();
        let plan = plans.get_mut(symbol)?;

        plan.highest_price = plan.highest_price.max(price);
        plan.lowest_price = plan.lowest_price.min(price);

        let favorable_excursion = match plan.side {
            PositionSide::Long => plan.highest_price,
            PositionSide::Short => plan.lowest_price,
        };
        plan.trailing_stop = Some(match plan.side {
            PositionSide::Long => favorable_excursion * (1.0 - TRAILING_STOP_PCT),
            PositionSide::Short => favorable_excursion * (1.0 + TRAILING_STOP_PCT),
        });

        let stop_hit = match plan.side {
            PositionSide::Long => price <= plan.stop_loss,
            PositionSide::Short => price >= plan.stop_loss,
        };
        if stop_hit {
            info!(symbol, price, "stop-loss triggered");
            return Some(ExitAction {
                reason: ExitReason::StopLoss,
                close_fraction: 1.0,
                price,
            });
        }

        let tp2_hit = match plan.side {
            PositionSide::Long => price >= plan.take_profit_2,
            PositionSide::Short => price <= plan.take_profit_2,
        };
        if tp2_hit {
            info!(symbol, price, "take-profit 2 triggered");
            return Some(ExitAction {
                reason: ExitReason::TakeProfit2,
                close_fraction: 1.0,
                price,
            });
        }

        if !plan.tp1_filled {
            let tp1_hit = match plan.side {
                PositionSide::Long => price >= plan.take_profit_1,
                PositionSide::Short => price <= plan.take_profit_1,
            };
            if tp1_hit {
                plan.tp1_filled = true;
                info!(symbol, price, "take-profit 1 triggered");
                return Some(ExitAction {
                    reason: ExitReason::TakeProfit1,
                    close_fraction: TP1_CLOSE_FRACTION,
                    price,
                });
            }
        }

        if let Some(trailing) = plan.trailing_stop {
            let trailing_hit = match plan.side {
                PositionSide::Long => price <= trailing,
                PositionSide::Short => price >= trailing,
            };
            if trailing_hit && plan.tp1_filled {
                info!(symbol, price, trailing, "trailing stop triggered");
                return Some(ExitAction {
                    reason: ExitReason::TrailingStop,
                    close_fraction: 1.0,
                    price,
                });
            }
        }

        None
    }
}

impl Default for ExitPlanManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_loss_triggers_full_close_for_long() {
        let mgr = ExitPlanManager::new();
        mgr.register("BTCUSDT", PositionSide::Long, 100.0, 95.0, 110.0, 120.0);
        let action = mgr.on_price("BTCUSDT", 94.0).unwrap();
        assert_eq!(action.reason, ExitReason::StopLoss);
        assert_eq!(action.close_fraction, 1.0);
    }

    #[test]
    fn take_profit_1_partially_closes_once() {
        let mgr = ExitPlanManager::new();
        mgr.register("BTCUSDT", PositionSide::Long, 100.0, 95.0, 110.0, 120.0);
        let action = mgr.on_price("BTCUSDT", 111.0).unwrap();
        assert_eq!(action.reason, ExitReason::TakeProfit1);
        assert!((action.close_fraction - 0.60).abs() < 1e-9);

        // Already filled: a second touch of tp1 shouldn't refire.
        let second = mgr.on_price("BTCUSDT", 111.5);
        assert!(second.is_none() || second.unwrap().reason != ExitReason::TakeProfit1);
    }

    #[test]
    fn take_profit_2_closes_fully_for_short() {
        let mgr = ExitPlanManager::new();
        mgr.register("ETHUSDT", PositionSide::Short, 100.0, 105.0, 90.0, 80.0);
        let action = mgr.on_price("ETHUSDT", 79.0).unwrap();
        assert_eq!(action.reason, ExitReason::TakeProfit2);
    }

    #[test]
    fn trailing_stop_only_arms_after_tp1() {
        let mgr = ExitPlanManager::new();
        mgr.register("BTCUSDT", PositionSide::Long, 100.0, 95.0, 110.0, 130.0);
        mgr.on_price("BTCUSDT", 111.0); // fills TP1
        mgr.on_price("BTCUSDT", 115.0); // raises trailing stop
        let action = mgr.on_price("BTCUSDT", 114.0 * (1.0 - TRAILING_STOP_PCT) - 0.01);
        assert!(action.is_some());
        assert_eq!(action.unwrap().reason, ExitReason::TrailingStop);
    }

    #[test]
    fn clear_removes_plan() {
        let mgr = ExitPlanManager::new();
        mgr.register("BTCUSDT", PositionSide::Long, 100.0, 95.0, 110.0, 120.0);
        mgr.clear("BTCUSDT");
        assert!(mgr.on_price("BTCUSDT", 50.0).is_none());
    }
}
