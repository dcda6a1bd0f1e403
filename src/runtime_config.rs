// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Aurora trading engine.  Every tunable
// parameter lives here so that the engine can be reconfigured at runtime
// without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{AccountMode, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_max_concurrent_positions() -> u32 {
    3
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_max_trades_per_day() -> u32 {
    50
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Aurora engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------

    /// Current trading mode: Live, Paused, or Killed.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Whether running against real funds or simulated: Demo or Live.
    #[serde(default)]
    pub account_mode: AccountMode,

    // --- Symbols & limits ---------------------------------------------------

    /// Symbols the engine is watching and trading.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Maximum number of concurrent open positions.
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,

    /// Maximum cumulative daily loss allowed as a percentage of starting
    /// capital (e.g. 3.0 means 3 %).
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    /// Maximum consecutive losing trades before the circuit breaker trips.
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,

    /// Maximum total trades per day.
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,

    // --- Order routing -------------------------------------------------------

    /// Minimum normalized routing score (0.0-1.0) a venue must clear before
    /// it is eligible to receive an order.
    #[serde(default = "default_min_routing_confidence")]
    pub min_routing_confidence: f64,

    /// Venue latency above this threshold is treated as degraded when
    /// computing the routing score.
    #[serde(default = "default_max_latency_threshold_ms")]
    pub max_latency_threshold_ms: f64,

    /// Venue slippage above this threshold (basis points) is treated as
    /// degraded when computing the routing score.
    #[serde(default = "default_max_slippage_threshold_bps")]
    pub max_slippage_threshold_bps: f64,

    // --- Indicator worker pool -----------------------------------------------

    /// Number of concurrent indicator workers. Clamped to `[4, 16]` by the
    /// engine regardless of what is configured here.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Queue jobs drained per batch by the indicator engine.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-batch deadline before a worker timeout is surfaced.
    #[serde(default = "default_worker_timeout_ms")]
    pub worker_timeout_ms: u64,

    // --- API weight budget ---------------------------------------------------

    /// Maximum request weight consumable per window before callers await.
    #[serde(default = "default_weight_max_per_window")]
    pub weight_max_per_window: u32,

    /// Width of the weight-budget reset window.
    #[serde(default = "default_weight_window_ms")]
    pub weight_window_ms: u64,

    // --- Orchestrator circuit breaker ----------------------------------------

    /// Consecutive cycle failures before the orchestrator breaker opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long the orchestrator breaker stays open before probing half-open.
    #[serde(default = "default_circuit_open_duration_ms")]
    pub circuit_open_duration_ms: u64,

    // --- Cache & fetch sizing -------------------------------------------------

    /// Default L1/L2 cache retention for orchestrator writes.
    #[serde(default = "default_cache_duration_ms")]
    pub cache_duration_ms: i64,

    /// Candles requested per symbol during historical enrichment.
    #[serde(default = "default_klines_limit")]
    pub klines_limit: usize,

    /// Interval between continuous orchestrator cycles.
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,

    // --- Risk limits (fraction of account equity) ----------------------------

    /// Maximum single-position size, as a fraction of account equity.
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,

    /// Maximum aggregate exposure across all open positions.
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: f64,

    /// Maximum exposure concentrated in a single symbol.
    #[serde(default = "default_max_symbol_exposure")]
    pub max_symbol_exposure: f64,

    /// Maximum realized daily drawdown before the trading circuit breaker
    /// considers tripping.
    #[serde(default = "default_max_daily_drawdown")]
    pub max_daily_drawdown: f64,

    /// Maximum realized drawdown from the equity high-water mark.
    #[serde(default = "default_max_total_drawdown")]
    pub max_total_drawdown: f64,

    /// Drawdown fraction that trips the risk engine's trading circuit
    /// breaker.
    #[serde(default = "default_trading_circuit_threshold")]
    pub trading_circuit_threshold: f64,

    /// How long the trading circuit breaker stays open, in minutes.
    #[serde(default = "default_trading_circuit_duration_min")]
    pub trading_circuit_duration_min: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            symbols: default_symbols(),
            max_concurrent_positions: default_max_concurrent_positions(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_trades_per_day: default_max_trades_per_day(),
            min_routing_confidence: default_min_routing_confidence(),
            max_latency_threshold_ms: default_max_latency_threshold_ms(),
            max_slippage_threshold_bps: default_max_slippage_threshold_bps(),
            worker_count: default_worker_count(),
            batch_size: default_batch_size(),
            worker_timeout_ms: default_worker_timeout_ms(),
            weight_max_per_window: default_weight_max_per_window(),
            weight_window_ms: default_weight_window_ms(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_open_duration_ms: default_circuit_open_duration_ms(),
            cache_duration_ms: default_cache_duration_ms(),
            klines_limit: default_klines_limit(),
            update_interval_ms: default_update_interval_ms(),
            max_position_size: default_max_position_size(),
            max_total_exposure: default_max_total_exposure(),
            max_symbol_exposure: default_max_symbol_exposure(),
            max_daily_drawdown: default_max_daily_drawdown(),
            max_total_drawdown: default_max_total_drawdown(),
            trading_circuit_threshold: default_trading_circuit_threshold(),
            trading_circuit_duration_min: default_trading_circuit_duration_min(),
        }
    }
}

fn default_min_routing_confidence() -> f64 {
    0.60
}

fn default_max_latency_threshold_ms() -> f64 {
    500.0
}

fn default_max_slippage_threshold_bps() -> f64 {
    20.0
}

fn default_worker_count() -> usize {
    crate::indicator_engine::default_worker_count()
}

fn default_batch_size() -> usize {
    10
}

fn default_worker_timeout_ms() -> u64 {
    30_000
}

fn default_weight_max_per_window() -> u32 {
    6000
}

fn default_weight_window_ms() -> u64 {
    60_000
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_open_duration_ms() -> u64 {
    60_000
}

fn default_cache_duration_ms() -> i64 {
    300_000
}

fn default_klines_limit() -> usize {
    100
}

fn default_update_interval_ms() -> u64 {
    30_000
}

fn default_max_position_size() -> f64 {
    0.05
}

fn default_max_total_exposure() -> f64 {
    0.80
}

fn default_max_symbol_exposure() -> f64 {
    0.10
}

fn default_max_daily_drawdown() -> f64 {
    0.05
}

fn default_max_total_drawdown() -> f64 {
    0.15
}

fn default_trading_circuit_threshold() -> f64 {
    0.10
}

fn default_trading_circuit_duration_min() -> i64 {
    30
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            trading_mode = %config.trading_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        // Atomic write: write to a temporary sibling file, then rename.
        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.symbols.len(), 5);
        assert_eq!(cfg.symbols[0], "BTCUSDT");
        assert_eq!(cfg.symbols[4], "SOLUSDT");
        assert_eq!(cfg.max_concurrent_positions, 3);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.max_consecutive_losses, 5);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "symbols": ["ETHUSDT"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.max_concurrent_positions, 3);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.max_concurrent_positions, cfg2.max_concurrent_positions);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
    }

    #[test]
    fn default_config_matches_documented_tunables() {
        let cfg = RuntimeConfig::default();
        assert!((cfg.min_routing_confidence - 0.60).abs() < f64::EPSILON);
        assert!((cfg.max_latency_threshold_ms - 500.0).abs() < f64::EPSILON);
        assert!((cfg.max_slippage_threshold_bps - 20.0).abs() < f64::EPSILON);
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.worker_timeout_ms, 30_000);
        assert_eq!(cfg.weight_max_per_window, 6000);
        assert_eq!(cfg.circuit_failure_threshold, 5);
        assert_eq!(cfg.klines_limit, 100);
        assert!((cfg.max_total_exposure - 0.80).abs() < f64::EPSILON);
        assert_eq!(cfg.trading_circuit_duration_min, 30);
    }

    #[test]
    fn enum_mode_assignment_compatible() {
        // Verify that trading_mode and account_mode can be assigned from
        // enum variants, matching the pattern in main.rs.
        let mut cfg = RuntimeConfig::default();
        cfg.trading_mode = TradingMode::Paused;
        cfg.account_mode = AccountMode::Demo;
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
    }
}
