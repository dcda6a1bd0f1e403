// =============================================================================
// Market Regime Detector
// =============================================================================
//
// Classifies the current market into one of four regimes using a multi-
// factor approach. Each regime carries recommended risk parameters (R:R
// ratio and maximum position size) so that downstream strategy modules can
// adapt automatically.
//
// Detection hierarchy (evaluated top-to-bottom; first match wins):
//
//   1. VOLATILE  — BBW > 5.0 (extreme volatility expansion)
//   2. BREAKOUT  — BBW < 1.5 AND ADX < 20 AND volume-delta above its trailing
//                  average (compression with a building volume surge —
//                  the donor's Squeeze plus a volume-delta gate)
//   3. TRENDING  — ADX > 25 AND Hurst > 0.55 (persistent directional move)
//   4. RANGING   — ADX < 20 AND Hurst < 0.45, or entropy >= 0.95 (noise
//                  folds into low-confidence Ranging rather than its own tag)
//
// If no rule fires, the regime defaults to RANGING with low confidence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::indicators::adx::calculate_adx;
use crate::indicators::atr::calculate_atr;
use crate::indicators::bollinger::calculate_bollinger;
use crate::market_data::Candle;
use crate::regime::entropy::ShannonEntropyFilter;
use crate::regime::hurst::calculate_hurst_exponent;

/// A regime is held for at least this long before a new (lower-confidence)
/// candidate may displace it. See `RegimeDetector::observe`'s replacement
/// rule.
const REGIME_HOLD: Duration = Duration::from_secs(5 * 60);

// =============================================================================
// Types
// =============================================================================

/// High-level market regime classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketRegime {
    /// Strong directional move with persistence.
    Trending,
    /// Sideways chop — mean-reverting price action.
    Ranging,
    /// Extreme volatility expansion — wide swings.
    Volatile,
    /// Compression with a building volume surge — potential breakout imminent.
    Breakout,
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trending => write!(f, "TRENDING"),
            Self::Ranging => write!(f, "RANGING"),
            Self::Volatile => write!(f, "VOLATILE"),
            Self::Breakout => write!(f, "BREAKOUT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolatilityLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationRegime {
    Decorrelated,
    Normal,
    Correlated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiquidityCondition {
    Thin,
    Normal,
    Deep,
}

/// Complete snapshot of the detected regime plus all contributing metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: MarketRegime,
    pub adx: f64,
    pub bbw: f64,
    pub atr: f64,
    pub hurst: f64,
    pub entropy: f64,
    pub confidence: f64,
    pub volatility_level: VolatilityLevel,
    pub correlation_regime: CorrelationRegime,
    pub liquidity_condition: LiquidityCondition,
    pub regime_age_secs: f64,
    pub stability: f64,
    pub recommended_rr: (f64, f64),
    pub max_position_pct: f64,
}

// =============================================================================
// Decision matrix: per-regime risk parameters
// =============================================================================

impl MarketRegime {
    /// Returns the risk-management tuple for this regime:
    /// `(recommended_rr, max_position_pct)`.
    fn risk_params(self) -> ((f64, f64), f64) {
        match self {
            Self::Trending => ((3.0, 1.0), 100.0),
            Self::Ranging => ((1.5, 1.0), 60.0),
            Self::Volatile => ((2.5, 1.0), 40.0),
            Self::Breakout => ((4.0, 1.0), 30.0),
        }
    }
}

// =============================================================================
// RegimeDetector
// =============================================================================

/// Thread-safe regime detector that caches the latest regime state.
pub struct RegimeDetector {
    state: RwLock<Option<RegimeState>>,
    last_change_time: RwLock<Instant>,
}

impl RegimeDetector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(None),
            last_change_time: RwLock::new(Instant::now()),
        })
    }

    /// Run full regime detection on the provided candles and closing prices,
    /// then apply the replacement rule against the currently held regime.
    ///
    /// Replacement rule (§3): the new candidate replaces the current state
    /// iff its confidence exceeds the current confidence, or the current
    /// regime has been held longer than `REGIME_HOLD`. Both the
    /// read-compare and the write happen under one write-lock acquisition
    /// so the decision is atomic with respect to concurrent `observe` calls.
    pub fn detect(&self, candles: &[Candle], closes: &[f64]) -> Option<RegimeState> {
        let adx_value = calculate_adx(candles, 14).unwrap_or(0.0);
        let bb_result = calculate_bollinger(closes, 20, 2.0)?;
        let bbw_value = bb_result.width;
        let atr_value = calculate_atr(candles, 14).unwrap_or(0.0);
        let hurst_value = calculate_hurst_exponent(closes).unwrap_or(0.50);
        let entropy_value = ShannonEntropyFilter::calculate(candles, 50).unwrap_or(0.0);
        let volume_delta_ratio = volume_delta_ratio(candles);

        let (regime, confidence) =
            classify(adx_value, bbw_value, hurst_value, entropy_value, volume_delta_ratio);

        let volatility_level = classify_volatility(bbw_value);
        let correlation_regime = classify_correlation(hurst_value);
        let liquidity_condition = classify_liquidity(candles);

        let (recommended_rr, max_position_pct) = regime.risk_params();

        Some(self.observe(
            regime,
            confidence,
            adx_value,
            bbw_value,
            hurst_value,
            entropy_value,
            volatility_level,
            correlation_regime,
            liquidity_condition,
            recommended_rr,
            max_position_pct,
            atr_value,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn observe(
        &self,
        regime: MarketRegime,
        confidence: f64,
        adx: f64,
        bbw: f64,
        hurst: f64,
        entropy: f64,
        volatility_level: VolatilityLevel,
        correlation_regime: CorrelationRegime,
        liquidity_condition: LiquidityCondition,
        recommended_rr: (f64, f64),
        max_position_pct: f64,
        atr: f64,
    ) -> RegimeState {
        let now = Instant::now();
        let mut state = self.state.write();
        let mut last_change = self.last_change_time.write();

        let held_long_enough = now.duration_since(*last_change) >= REGIME_HOLD;
        let should_replace = match state.as_ref() {
            None => true,
            Some(current) => {
                regime != current.regime && (confidence > current.confidence || held_long_enough)
            }
        };

        let (final_regime, final_confidence, regime_age_secs, stability) = if should_replace {
            if state.as_ref().map(|s| s.regime) != Some(regime) {
                *last_change = now;
            }
            let age = now.duration_since(*last_change).as_secs_f64();
            (regime, confidence, age, confidence)
        } else {
            let current = state.as_ref().expect("non-replacement implies existing state");
            let age = now.duration_since(*last_change).as_secs_f64();
            let stability = (age / REGIME_HOLD.as_secs_f64()).min(1.0).max(current.confidence);
            (current.regime, current.confidence, age, stability)
        };

        let new_state = RegimeState {
            regime: final_regime,
            adx,
            bbw,
            atr,
            hurst,
            entropy,
            confidence: final_confidence,
            volatility_level,
            correlation_regime,
            liquidity_condition,
            regime_age_secs,
            stability,
            recommended_rr: if final_regime == regime {
                recommended_rr
            } else {
                final_regime.risk_params().0
            },
            max_position_pct: if final_regime == regime {
                max_position_pct
            } else {
                final_regime.risk_params().1
            },
        };

        debug!(
            regime = %final_regime,
            adx = format!("{:.2}", adx),
            bbw = format!("{:.2}", bbw),
            hurst = format!("{:.4}", hurst),
            entropy = format!("{:.4}", entropy),
            confidence = format!("{:.2}", final_confidence),
            age_secs = format!("{:.1}", regime_age_secs),
            "Regime observed"
        );

        *state = Some(new_state.clone());
        new_state
    }

    pub fn update(&self, candles: &[Candle]) -> Option<RegimeState> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        self.detect(candles, &closes)
    }

    pub fn current_regime(&self) -> Option<RegimeState> {
        self.state.read().clone()
    }
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self {
            state: RwLock::new(None),
            last_change_time: RwLock::new(Instant::now()),
        }
    }
}

// =============================================================================
// Classification logic
// =============================================================================

fn classify(
    adx: f64,
    bbw: f64,
    hurst: f64,
    entropy: f64,
    volume_delta_ratio: f64,
) -> (MarketRegime, f64) {
    if bbw > 5.0 {
        let confidence = remap(bbw, 5.0, 10.0, 0.65, 1.0);
        return (MarketRegime::Volatile, confidence);
    }

    if bbw < 1.5 && adx < 20.0 && volume_delta_ratio > 1.2 {
        let bbw_conf = remap(bbw, 1.5, 0.5, 0.50, 1.0);
        let volume_conf = remap(volume_delta_ratio, 1.2, 2.5, 0.50, 1.0);
        let confidence = (bbw_conf + volume_conf) / 2.0;
        return (MarketRegime::Breakout, confidence);
    }

    if adx > 25.0 && hurst > 0.55 {
        let adx_conf = remap(adx, 25.0, 50.0, 0.60, 1.0);
        let hurst_conf = remap(hurst, 0.55, 0.80, 0.60, 1.0);
        let confidence = (adx_conf + hurst_conf) / 2.0;
        return (MarketRegime::Trending, confidence);
    }

    // Near-maximum entropy folds into low-confidence Ranging rather than a
    // dedicated tag — the spec's four-regime taxonomy has no noise-only tag.
    if entropy >= 0.95 {
        let confidence = remap(entropy, 0.95, 1.0, 0.20, 0.35);
        return (MarketRegime::Ranging, confidence);
    }

    if adx < 20.0 && hurst < 0.45 {
        let adx_conf = remap(adx, 20.0, 5.0, 0.50, 1.0);
        let hurst_conf = remap(hurst, 0.45, 0.20, 0.50, 1.0);
        let confidence = (adx_conf + hurst_conf) / 2.0;
        return (MarketRegime::Ranging, confidence);
    }

    trace!(
        adx = format!("{:.2}", adx),
        bbw = format!("{:.2}", bbw),
        hurst = format!("{:.4}", hurst),
        entropy = format!("{:.4}", entropy),
        "Regime: no rule matched, defaulting to RANGING"
    );
    (MarketRegime::Ranging, 0.30)
}

fn classify_volatility(bbw: f64) -> VolatilityLevel {
    if bbw > 5.0 {
        VolatilityLevel::High
    } else if bbw < 1.5 {
        VolatilityLevel::Low
    } else {
        VolatilityLevel::Medium
    }
}

fn classify_correlation(hurst: f64) -> CorrelationRegime {
    if hurst > 0.60 {
        CorrelationRegime::Correlated
    } else if hurst < 0.40 {
        CorrelationRegime::Decorrelated
    } else {
        CorrelationRegime::Normal
    }
}

fn classify_liquidity(candles: &[Candle]) -> LiquidityCondition {
    let window = 20.min(candles.len());
    if window == 0 {
        return LiquidityCondition::Normal;
    }
    let avg_volume =
        candles[candles.len() - window..].iter().map(|c| c.volume).sum::<f64>() / window as f64;
    if avg_volume > 5_000_000.0 {
        LiquidityCondition::Deep
    } else if avg_volume < 100_000.0 {
        LiquidityCondition::Thin
    } else {
        LiquidityCondition::Normal
    }
}

/// Ratio of the most recent bar's volume to its trailing SMA(10) — the same
/// volume-delta signal used to gate Breakout classification and to pick the
/// top-50%-by-volume-delta bucket in the orchestrator's priority routing.
fn volume_delta_ratio(candles: &[Candle]) -> f64 {
    let window = 10.min(candles.len().saturating_sub(1));
    if window == 0 {
        return 1.0;
    }
    let avg = candles[candles.len() - 1 - window..candles.len() - 1]
        .iter()
        .map(|c| c.volume)
        .sum::<f64>()
        / window as f64;
    if avg <= 0.0 {
        return 1.0;
    }
    candles.last().map(|c| c.volume).unwrap_or(0.0) / avg
}

/// Linearly remap `value` from `[in_lo, in_hi]` to `[out_lo, out_hi]`, clamped
/// to the output range. Works regardless of whether `in_lo < in_hi` or vice
/// versa.
fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        (value - in_lo) / (in_hi - in_lo)
    };
    let clamped = t.clamp(0.0, 1.0);
    out_lo + clamped * (out_hi - out_lo)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_volatile() {
        let (regime, _) = classify(30.0, 7.0, 0.50, 0.50, 1.0);
        assert_eq!(regime, MarketRegime::Volatile);
    }

    #[test]
    fn test_classify_breakout_requires_volume_delta() {
        let (regime, _) = classify(15.0, 1.0, 0.50, 0.50, 1.0);
        assert_eq!(regime, MarketRegime::Ranging);

        let (regime, _) = classify(15.0, 1.0, 0.50, 0.50, 1.5);
        assert_eq!(regime, MarketRegime::Breakout);
    }

    #[test]
    fn test_classify_trending() {
        let (regime, _) = classify(35.0, 3.0, 0.65, 0.50, 1.0);
        assert_eq!(regime, MarketRegime::Trending);
    }

    #[test]
    fn test_classify_ranging() {
        let (regime, _) = classify(15.0, 3.0, 0.40, 0.50, 1.0);
        assert_eq!(regime, MarketRegime::Ranging);
    }

    #[test]
    fn test_classify_default_ranging() {
        let (regime, conf) = classify(22.0, 3.0, 0.50, 0.50, 1.0);
        assert_eq!(regime, MarketRegime::Ranging);
        assert!((conf - 0.30).abs() < 1e-10);
    }

    #[test]
    fn test_high_entropy_folds_into_low_confidence_ranging() {
        let (regime, conf) = classify(40.0, 3.0, 0.70, 0.97, 1.0);
        assert_eq!(regime, MarketRegime::Ranging);
        assert!(conf < 0.35);
    }

    #[test]
    fn test_risk_params_breakout() {
        let ((rr_reward, rr_risk), max_pos) = MarketRegime::Breakout.risk_params();
        assert!((rr_reward - 4.0).abs() < f64::EPSILON);
        assert!((rr_risk - 1.0).abs() < f64::EPSILON);
        assert!((max_pos - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_risk_params_trending() {
        let ((rr_reward, rr_risk), max_pos) = MarketRegime::Trending.risk_params();
        assert!((rr_reward - 3.0).abs() < f64::EPSILON);
        assert!((rr_risk - 1.0).abs() < f64::EPSILON);
        assert!((max_pos - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_regime_display() {
        assert_eq!(format!("{}", MarketRegime::Trending), "TRENDING");
        assert_eq!(format!("{}", MarketRegime::Breakout), "BREAKOUT");
    }

    #[test]
    fn test_remap() {
        assert!((remap(0.5, 0.0, 1.0, 0.0, 10.0) - 5.0).abs() < 1e-10);
        assert!((remap(2.0, 0.0, 1.0, 0.0, 10.0) - 10.0).abs() < 1e-10);
        assert!((remap(-1.0, 0.0, 1.0, 0.0, 10.0) - 0.0).abs() < 1e-10);
    }

    #[test]
    fn replacement_rule_keeps_higher_confidence_regime() {
        let detector = RegimeDetector::default();
        let first = detector.observe(
            MarketRegime::Trending,
            0.9,
            30.0,
            3.0,
            0.6,
            0.4,
            VolatilityLevel::Medium,
            CorrelationRegime::Normal,
            LiquidityCondition::Normal,
            (3.0, 1.0),
            100.0,
            1.0,
        );
        assert_eq!(first.regime, MarketRegime::Trending);

        let second = detector.observe(
            MarketRegime::Ranging,
            0.3,
            15.0,
            3.0,
            0.4,
            0.4,
            VolatilityLevel::Medium,
            CorrelationRegime::Normal,
            LiquidityCondition::Normal,
            (1.5, 1.0),
            60.0,
            1.0,
        );
        // Lower-confidence candidate does not displace the held regime
        // before REGIME_HOLD has elapsed.
        assert_eq!(second.regime, MarketRegime::Trending);
    }
}
