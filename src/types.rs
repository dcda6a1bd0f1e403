// =============================================================================
// Shared types used across the Aurora trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Candle interval. Each timeframe has a fixed duration and a maximum
/// rolling-buffer window beyond which older candles are evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
}

impl Timeframe {
    /// Bar duration in milliseconds.
    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 5 * 60_000,
            Self::M15 => 15 * 60_000,
            Self::H1 => 60 * 60_000,
        }
    }

    /// Maximum number of bars retained in the rolling buffer for this
    /// timeframe.
    pub fn max_window(self) -> usize {
        match self {
            Self::M1 => 500,
            Self::M5 => 500,
            Self::M15 => 500,
            Self::H1 => 168,
        }
    }

    /// The wire string used as a Binance kline interval and cache key
    /// component.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::M1),
            "5m" => Some(Self::M5),
            "15m" => Some(Self::M15),
            "1h" => Some(Self::H1),
            _ => None,
        }
    }

    /// L1 / L2 retention durations (milliseconds) per the multi-tier cache's
    /// per-timeframe policy.
    pub fn l1_retention_ms(self) -> i64 {
        match self {
            Self::M1 => 6 * 3_600_000,
            Self::M5 => 24 * 3_600_000,
            Self::M15 => 3 * 86_400_000,
            Self::H1 => 7 * 86_400_000,
        }
    }

    pub fn l2_retention_ms(self) -> i64 {
        match self {
            Self::M1 => 7 * 86_400_000,
            Self::M5 => 30 * 86_400_000,
            Self::M15 => 90 * 86_400_000,
            Self::H1 => 2 * 365 * 86_400_000,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a [`crate::types::MarketDataPoint`]'s data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Live,
    Cache,
    Fallback,
}

/// Confidence band assigned to a market data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataQuality {
    High,
    Medium,
    Low,
}

/// A single symbol's market snapshot, assembled by the orchestrator once per
/// cycle from a fetch (or cache hit) plus the indicator engine's suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataPoint {
    pub symbol: String,
    pub timestamp_ms: i64,
    pub price: f64,
    pub volume: f64,
    pub change_24h_pct: f64,
    pub indicators: Option<crate::indicator_engine::IndicatorSuite>,
    pub source: DataSource,
    pub quality: DataQuality,
    pub confidence: f64,
    pub data_age_ms: i64,
}
