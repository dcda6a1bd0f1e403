// =============================================================================
// Risk Manager — position admission, portfolio metrics, trading circuit breaker
// =============================================================================
//
// `RiskEngine` owns the portfolio-level view: it wraps a `PositionManager`
// for per-symbol bookkeeping and layers an 8-item admission check, rolling
// risk metrics over the realized-return series, and a trading circuit
// breaker that is independent of the data orchestrator's circuit breaker in
// `orchestrator.rs`. Admission is advisory at the engine boundary: callers
// ask `can_open` before routing an order, then report fills through
// `on_fill` so the position book and return series stay in sync.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::errors::RiskRejectionReason;
use crate::event_bus::{EventBus, EventKind};
use crate::position_engine::{FillOutcome, Position, PositionManager};

const RETURNS_WINDOW: usize = 500;
const EQUITY_WINDOW: usize = 2000;
const TRADING_PERIODS_PER_YEAR: f64 = 365.0 * 24.0 * 12.0; // 5-minute bars

#[derive(Debug, Clone, Copy)]
pub struct RiskLimits {
    pub max_position_size: f64,
    pub max_total_exposure: f64,
    pub max_symbol_exposure: f64,
    pub max_daily_drawdown_pct: f64,
    pub max_total_drawdown_pct: f64,
    pub max_leverage: f64,
    pub max_correlated_fraction: f64,
    pub min_liquidity_volume: f64,
    pub circuit_threshold: f64,
    pub circuit_duration: chrono::Duration,
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("balance", &*self.balance.read())
            .field("breaker_open", &self.is_breaker_open())
            .finish()
    }
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size: 10_000.0,
            max_total_exposure: 100_000.0,
            max_symbol_exposure: 25_000.0,
            max_daily_drawdown_pct: 0.05,
            max_total_drawdown_pct: 0.20,
            max_leverage: 5.0,
            max_correlated_fraction: 0.70,
            min_liquidity_volume: 50_000.0,
            circuit_threshold: 0.10,
            circuit_duration: chrono::Duration::minutes(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RiskMetrics {
    pub var_95: f64,
    pub var_99: f64,
    pub expected_shortfall: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub max_drawdown_pct: f64,
    pub correlation_risk: f64,
    pub liquidity_risk: f64,
    pub concentration_risk: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub score: f64,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskStats {
    pub balance: f64,
    pub total_pnl: f64,
    pub daily_pnl: f64,
    pub open_positions: usize,
    pub total_exposure: f64,
    pub breaker_open: bool,
    pub trades_today: u64,
}

struct Returns {
    realized: VecDeque<f64>,
    equity_curve: VecDeque<f64>,
    peak_equity: f64,
}

impl Returns {
    fn new(starting_equity: f64) -> Self {
        let mut equity_curve = VecDeque::with_capacity(EQUITY_WINDOW);
        equity_curve.push_back(starting_equity);
        Self {
            realized: VecDeque::with_capacity(RETURNS_WINDOW),
            equity_curve,
            peak_equity: starting_equity,
        }
    }

    fn push_realized(&mut self, pnl_pct: f64) {
        self.realized.push_back(pnl_pct);
        if self.realized.len() > RETURNS_WINDOW {
            self.realized.pop_front();
        }
    }

    fn push_equity(&mut self, equity: f64) {
        self.equity_curve.push_back(equity);
        if self.equity_curve.len() > EQUITY_WINDOW {
            self.equity_curve.pop_front();
        }
        self.peak_equity = self.peak_equity.max(equity);
    }

    fn max_drawdown_pct(&self) -> f64 {
        let mut peak = self.equity_curve.front().copied().unwrap_or(0.0);
        let mut worst = 0.0_f64;
        for &equity in &self.equity_curve {
            peak = peak.max(equity);
            if peak > 0.0 {
                let dd = (peak - equity) / peak;
                worst = worst.max(dd);
            }
        }
        worst
    }
}

struct Breaker {
    open: AtomicBool,
    opened_at: RwLock<Option<DateTime<Utc>>>,
}

pub struct RiskEngine {
    limits: RiskLimits,
    positions: Arc<PositionManager>,
    balance: RwLock<f64>,
    starting_balance: f64,
    total_pnl: RwLock<f64>,
    daily_pnl: RwLock<f64>,
    trades_today: RwLock<u64>,
    returns: RwLock<Returns>,
    breaker: Breaker,
    event_bus: Option<Arc<EventBus>>,
}

impl RiskEngine {
    pub fn new(starting_balance: f64, limits: RiskLimits) -> Self {
        Self {
            limits,
            positions: Arc::new(PositionManager::new()),
            balance: RwLock::new(starting_balance),
            starting_balance,
            total_pnl: RwLock::new(0.0),
            daily_pnl: RwLock::new(0.0),
            trades_today: RwLock::new(0),
            returns: RwLock::new(Returns::new(starting_balance)),
            breaker: Breaker {
                open: AtomicBool::new(false),
                opened_at: RwLock::new(None),
            },
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn positions(&self) -> &Arc<PositionManager> {
        &self.positions
    }

    /// Check every admission limit for a prospective open. Each failure
    /// mode maps 1:1 onto a `RiskRejectionReason` variant.
    pub fn can_open(
        &self,
        symbol: &str,
        quantity: f64,
        price: f64,
        reference_volume: f64,
    ) -> Result<(), RiskRejectionReason> {
        if self.is_breaker_open() {
            return Err(RiskRejectionReason::TotalDrawdown);
        }

        let notional = quantity * price;

        if notional > self.limits.max_position_size {
            return Err(RiskRejectionReason::PositionSize);
        }

        let total_exposure = self.positions.total_exposure() + notional;
        if total_exposure > self.limits.max_total_exposure {
            return Err(RiskRejectionReason::TotalExposure);
        }

        let symbol_exposure = self.positions.symbol_exposure(symbol) + notional;
        if symbol_exposure > self.limits.max_symbol_exposure {
            return Err(RiskRejectionReason::SymbolExposure);
        }

        let daily_pnl_pct = *self.daily_pnl.read() / self.starting_balance.max(1e-9);
        if daily_pnl_pct < -self.limits.max_daily_drawdown_pct {
            return Err(RiskRejectionReason::DailyDrawdown);
        }

        if self.returns.read().max_drawdown_pct() > self.limits.max_total_drawdown_pct {
            return Err(RiskRejectionReason::TotalDrawdown);
        }

        let leverage = notional / self.balance.read().max(1e-9);
        if leverage > self.limits.max_leverage {
            return Err(RiskRejectionReason::Leverage);
        }

        if reference_volume < self.limits.min_liquidity_volume {
            return Err(RiskRejectionReason::Volatility);
        }

        let open_positions = self.positions.get_open_positions();
        if !open_positions.is_empty() {
            let same_side_count = open_positions
                .iter()
                .filter(|p| p.side == open_positions[0].side)
                .count();
            let fraction = same_side_count as f64 / open_positions.len() as f64;
            if fraction > self.limits.max_correlated_fraction && open_positions.len() >= 3 {
                return Err(RiskRejectionReason::Correlation);
            }
        }

        Ok(())
    }

    /// Confidence-scaled fraction of the symbol's remaining exposure budget.
    pub fn recommended_size(&self, symbol: &str, price: f64, confidence: f64) -> f64 {
        let confidence = confidence.clamp(0.0, 1.0);
        let remaining_symbol = (self.limits.max_symbol_exposure - self.positions.symbol_exposure(symbol)).max(0.0);
        let remaining_total = (self.limits.max_total_exposure - self.positions.total_exposure()).max(0.0);
        let budget = remaining_symbol.min(remaining_total).min(self.limits.max_position_size);
        if price <= 0.0 {
            return 0.0;
        }
        (budget * confidence) / price
    }

    pub fn on_fill(&self, symbol: &str, side: &str, quantity: f64, price: f64) -> FillOutcome {
        let outcome = self.positions.on_fill(symbol, side, quantity, price);
        *self.trades_today.write() += 1;

        if outcome.realized_pnl != 0.0 {
            *self.total_pnl.write() += outcome.realized_pnl;
            *self.daily_pnl.write() += outcome.realized_pnl;

            let mut balance = self.balance.write();
            *balance += outcome.realized_pnl;
            let new_balance = *balance;
            drop(balance);

            let pnl_pct = outcome.realized_pnl / self.starting_balance.max(1e-9);
            let mut returns = self.returns.write();
            returns.push_realized(pnl_pct);
            returns.push_equity(new_balance);
            drop(returns);

            self.evaluate_breaker();
        }

        outcome
    }

    pub fn on_price(&self, symbol: &str, price: f64) {
        self.positions.on_price(symbol, price);
    }

    /// Mark-to-market refresh: recompute unrealized P&L for every open
    /// position against `prices` and push an equity-curve sample.
    pub fn update_portfolio(&self, prices: &[(&str, f64)]) {
        for (symbol, price) in prices {
            self.positions.on_price(symbol, *price);
        }
        let unrealized: f64 = self
            .positions
            .get_open_positions()
            .iter()
            .map(|p| p.unrealized_pnl)
            .sum();
        let equity = *self.balance.read() + unrealized;
        self.returns.write().push_equity(equity);
    }

    fn evaluate_breaker(&self) {
        let total_pnl = *self.total_pnl.read();
        let balance = *self.balance.read();

        if !self.breaker.open.load(Ordering::Relaxed) {
            if total_pnl < -self.limits.circuit_threshold * self.starting_balance.max(1e-9) {
                self.breaker.open.store(true, Ordering::Relaxed);
                *self.breaker.opened_at.write() = Some(Utc::now());
                warn!(total_pnl, balance, "trading circuit breaker opened");
                if let Some(bus) = &self.event_bus {
                    bus.publish(
                        EventKind::RiskLimitBreach,
                        json!({ "reason": "total_drawdown", "total_pnl": total_pnl }),
                    );
                }
            }
        } else if let Some(opened_at) = *self.breaker.opened_at.read() {
            if Utc::now() - opened_at > self.limits.circuit_duration {
                self.breaker.open.store(false, Ordering::Relaxed);
                *self.breaker.opened_at.write() = None;
                info!("trading circuit breaker auto-closed");
            }
        }
    }

    pub fn is_breaker_open(&self) -> bool {
        self.breaker.open.load(Ordering::Relaxed)
    }

    pub fn assess(&self, symbol: &str, proposed_notional: f64) -> RiskAssessment {
        let metrics = self.metrics();
        let mut warnings = Vec::new();
        let mut recommendations = Vec::new();

        if metrics.max_drawdown_pct > self.limits.max_total_drawdown_pct * 0.75 {
            warnings.push(format!(
                "drawdown at {:.1}% of limit",
                metrics.max_drawdown_pct / self.limits.max_total_drawdown_pct * 100.0
            ));
            recommendations.push("reduce position sizing until drawdown recovers".to_string());
        }

        if metrics.concentration_risk > 0.5 {
            warnings.push(format!("{symbol} concentration at {:.0}% of exposure", metrics.concentration_risk * 100.0));
            recommendations.push("diversify across additional symbols".to_string());
        }

        if metrics.correlation_risk > self.limits.max_correlated_fraction {
            warnings.push("open positions are heavily one-sided".to_string());
        }

        let exposure_after = self.positions.total_exposure() + proposed_notional;
        let exposure_fraction = exposure_after / self.limits.max_total_exposure.max(1e-9);

        let score = (metrics.max_drawdown_pct / self.limits.max_total_drawdown_pct.max(1e-9) * 40.0
            + metrics.concentration_risk * 30.0
            + exposure_fraction * 30.0)
            .clamp(0.0, 100.0);

        let level = if self.is_breaker_open() || score > 85.0 {
            RiskLevel::Critical
        } else if score > 60.0 {
            RiskLevel::High
        } else if score > 30.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        RiskAssessment {
            level,
            score,
            warnings,
            recommendations,
        }
    }

    pub fn metrics(&self) -> RiskMetrics {
        let returns = self.returns.read();
        let samples: Vec<f64> = returns.realized.iter().copied().collect();
        let max_drawdown_pct = returns.max_drawdown_pct();
        drop(returns);

        let (var_95, var_99, expected_shortfall) = value_at_risk(&samples);
        let (sharpe_ratio, sortino_ratio) = sharpe_and_sortino(&samples);
        let mean_return = mean(&samples);
        let calmar_ratio = if max_drawdown_pct > 1e-9 {
            (mean_return * TRADING_PERIODS_PER_YEAR) / max_drawdown_pct
        } else {
            0.0
        };

        let open_positions = self.positions.get_open_positions();
        let correlation_risk = correlation_risk(&open_positions);
        let concentration_risk = concentration_risk(&open_positions);
        let liquidity_risk = (self.positions.total_exposure() / self.limits.max_total_exposure.max(1e-9)).clamp(0.0, 1.0);

        RiskMetrics {
            var_95,
            var_99,
            expected_shortfall,
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
            max_drawdown_pct,
            correlation_risk,
            liquidity_risk,
            concentration_risk,
        }
    }

    pub fn stats(&self) -> RiskStats {
        RiskStats {
            balance: *self.balance.read(),
            total_pnl: *self.total_pnl.read(),
            daily_pnl: *self.daily_pnl.read(),
            open_positions: self.positions.get_open_positions().len(),
            total_exposure: self.positions.total_exposure(),
            breaker_open: self.is_breaker_open(),
            trades_today: *self.trades_today.read(),
        }
    }

    pub fn reset_daily(&self) {
        *self.daily_pnl.write() = 0.0;
        *self.trades_today.write() = 0;
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

fn std_dev(samples: &[f64], mean_value: f64) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let variance = samples.iter().map(|v| (v - mean_value).powi(2)).sum::<f64>() / (samples.len() - 1) as f64;
    variance.sqrt()
}

/// Historical-simulation VaR/ES: sort returns ascending, read off the
/// percentile, average everything at or below it for expected shortfall.
fn value_at_risk(samples: &[f64]) -> (f64, f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let idx_95 = ((1.0 - 0.95) * sorted.len() as f64).floor() as usize;
    let idx_99 = ((1.0 - 0.99) * sorted.len() as f64).floor() as usize;
    let idx_95 = idx_95.min(sorted.len() - 1);
    let idx_99 = idx_99.min(sorted.len() - 1);

    let var_95 = -sorted[idx_95];
    let var_99 = -sorted[idx_99];

    let tail = &sorted[..=idx_95];
    let expected_shortfall = -mean(tail);

    (var_95.max(0.0), var_99.max(0.0), expected_shortfall.max(0.0))
}

fn sharpe_and_sortino(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let mean_return = mean(samples);
    let sd = std_dev(samples, mean_return);
    let sharpe = if sd > 1e-12 {
        mean_return / sd * TRADING_PERIODS_PER_YEAR.sqrt()
    } else {
        0.0
    };

    let downside: Vec<f64> = samples.iter().copied().filter(|v| *v < 0.0).collect();
    let downside_sd = if downside.len() >= 2 {
        let dmean = mean(&downside);
        std_dev(&downside, dmean)
    } else {
        0.0
    };
    let sortino = if downside_sd > 1e-12 {
        mean_return / downside_sd * TRADING_PERIODS_PER_YEAR.sqrt()
    } else {
        0.0
    };

    (sharpe, sortino)
}

fn correlation_risk(positions: &[Position]) -> f64 {
    if positions.is_empty() {
        return 0.0;
    }
    let long_count = positions.iter().filter(|p| p.side == crate::position_engine::PositionSide::Long).count();
    let fraction = long_count.max(positions.len() - long_count) as f64 / positions.len() as f64;
    fraction
}

fn concentration_risk(positions: &[Position]) -> f64 {
    let total: f64 = positions.iter().map(|p| p.size * p.current_price).sum();
    if total <= 0.0 {
        return 0.0;
    }
    positions
        .iter()
        .map(|p| p.size * p.current_price / total)
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RiskEngine {
        RiskEngine::new(10_000.0, RiskLimits::default())
    }

    #[test]
    fn can_open_rejects_oversized_position() {
        let engine = engine();
        let result = engine.can_open("BTCUSDT", 1000.0, 50.0, 100_000.0);
        assert_eq!(result, Err(RiskRejectionReason::PositionSize));
    }

    #[test]
    fn can_open_rejects_thin_liquidity() {
        let engine = engine();
        let result = engine.can_open("BTCUSDT", 1.0, 100.0, 10.0);
        assert_eq!(result, Err(RiskRejectionReason::Volatility));
    }

    #[test]
    fn can_open_accepts_within_limits() {
        let engine = engine();
        let result = engine.can_open("BTCUSDT", 1.0, 100.0, 100_000.0);
        assert!(result.is_ok());
    }

    #[test]
    fn recommended_size_scales_with_confidence() {
        let engine = engine();
        let low = engine.recommended_size("BTCUSDT", 100.0, 0.2);
        let high = engine.recommended_size("BTCUSDT", 100.0, 0.9);
        assert!(high > low);
    }

    #[test]
    fn large_loss_opens_circuit_breaker() {
        let engine = engine();
        engine.on_fill("BTCUSDT", "buy", 10.0, 100.0);
        engine.on_fill("BTCUSDT", "sell", 10.0, 50.0);
        assert!(engine.is_breaker_open());
        let result = engine.can_open("ETHUSDT", 1.0, 10.0, 100_000.0);
        assert_eq!(result, Err(RiskRejectionReason::TotalDrawdown));
    }

    #[test]
    fn stats_reflect_balance_and_exposure() {
        let engine = engine();
        engine.on_fill("BTCUSDT", "buy", 1.0, 100.0);
        let stats = engine.stats();
        assert_eq!(stats.open_positions, 1);
        assert!((stats.total_exposure - 100.0).abs() < 1e-9);
    }

    #[test]
    fn metrics_are_finite_with_no_history() {
        let engine = engine();
        let metrics = engine.metrics();
        assert_eq!(metrics.var_95, 0.0);
        assert_eq!(metrics.max_drawdown_pct, 0.0);
    }

    #[test]
    fn assess_flags_high_concentration() {
        let engine = engine();
        engine.on_fill("BTCUSDT", "buy", 50.0, 100.0);
        let assessment = engine.assess("BTCUSDT", 100.0);
        assert!(assessment.score >= 0.0);
    }
}
