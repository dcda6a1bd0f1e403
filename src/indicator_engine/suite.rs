// =============================================================================
// Indicator Suite — per-symbol, per-timeframe technical reading
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::indicators::{
    adx, atr, bollinger, ema, macd, order_flow, rsi, stochastic, velocity, vwap, williams_r,
};
use crate::market_data::Candle;
use crate::types::DataQuality;

pub use macd::MacdDivergence;

/// Longest look-back any single indicator in the suite needs (MACD's slow
/// EMA, 26 bars) — the suite is withheld or marked low-quality below this.
pub const MIN_SUITE_PERIOD: usize = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSuite {
    pub rsi7: f64,
    pub rsi14: f64,
    pub rsi21: f64,

    pub atr: f64,
    pub atr_percentile: f64,

    pub vwap: f64,
    pub vwap_deviation: f64,
    pub volume_surge: bool,

    pub velocity: f64,
    pub acceleration: f64,

    pub bollinger_upper: f64,
    pub bollinger_middle: f64,
    pub bollinger_lower: f64,
    pub bollinger_squeeze: bool,
    pub bollinger_percentile: f64,

    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub macd_divergence: MacdDivergence,

    pub williams_r: f64,
    pub stoch_k: f64,
    pub stoch_d: f64,
    pub stoch_convergence: bool,

    pub order_flow_imbalance: i8,
    pub institutional_activity: bool,
    pub retail_activity: bool,

    pub momentum_score: f64,
    pub volatility_score: f64,
    pub volume_score: f64,
    pub overall_score: f64,
    pub signal: Signal,
    pub strength: f64,
    pub confidence: f64,

    pub quality: DataQuality,
}

/// Historical ATR percentile rank: where the most recent ATR falls within
/// the distribution of ATRs computed over the trailing window.
fn atr_percentile(candles: &[Candle], period: usize) -> f64 {
    let lookback = 100.min(candles.len());
    if lookback <= period {
        return 0.5;
    }

    let mut history = Vec::with_capacity(lookback - period);
    for end in (period + 1)..=lookback {
        let window = &candles[candles.len() - end..candles.len() - lookback + end];
        if let Some(v) = atr::calculate_atr(window, period) {
            history.push(v);
        }
    }

    let Some(current) = atr::calculate_atr(&candles[candles.len() - lookback..], period) else {
        return 0.5;
    };
    if history.is_empty() {
        return 0.5;
    }

    let below = history.iter().filter(|&&v| v <= current).count();
    below as f64 / history.len() as f64
}

/// Compute the full indicator suite for a symbol's rolling buffer. Always
/// returns a suite (never `None`) — per SPEC_FULL.md §3/§4.4, a buffer
/// shorter than the longest-period indicator yields a suite flagged
/// `quality: Low` rather than being withheld outright, so callers that want
/// to withhold it can filter on quality themselves.
pub fn compute_suite(candles: &[Candle]) -> IndicatorSuite {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let rsi7 = rsi::current_rsi(&closes, 7).map(|(v, _)| v).unwrap_or(50.0);
    let rsi14 = rsi::current_rsi(&closes, 14).map(|(v, _)| v).unwrap_or(50.0);
    let rsi21 = rsi::current_rsi(&closes, 21).map(|(v, _)| v).unwrap_or(50.0);

    let atr_val = atr::calculate_atr(candles, 14).unwrap_or(0.0);
    let atr_pct = atr_percentile(candles, 14);

    let vwap_result = vwap::calculate_vwap(candles);
    let (vwap_val, vwap_dev, vol_surge) = vwap_result
        .map(|r| (r.vwap, r.deviation, r.volume_surge))
        .unwrap_or((closes.last().copied().unwrap_or(0.0), 0.0, false));

    let velocity_result = velocity::calculate_velocity(&closes);
    let (vel, accel) = velocity_result
        .map(|r| (r.velocity, r.acceleration))
        .unwrap_or((0.0, 0.0));

    let bb = bollinger::calculate_bollinger(&closes, 20, 2.0);
    let (bb_upper, bb_mid, bb_lower, bb_squeeze, bb_pct) = match &bb {
        Some(b) => {
            let squeeze = b.middle != 0.0 && (b.upper - b.lower) / b.middle < 0.10;
            let range = b.upper - b.lower;
            let pct = if range != 0.0 {
                ((closes.last().copied().unwrap_or(b.middle) - b.lower) / range).clamp(0.0, 1.0)
            } else {
                0.5
            };
            (b.upper, b.middle, b.lower, squeeze, pct)
        }
        None => (0.0, 0.0, 0.0, false, 0.5),
    };

    let macd_result = macd::calculate(&closes);

    let wr = williams_r::calculate(candles).unwrap_or(-50.0);
    let stoch = stochastic::calculate(candles);
    let (stoch_k, stoch_d) = stoch.map(|s| (s.k, s.d)).unwrap_or((50.0, 50.0));
    let stoch_convergence = (stoch_k - stoch_d).abs() < 5.0;

    let order_flow_val = order_flow::calculate_order_flow(candles, 10).unwrap_or(0);

    let avg_volume = if candles.len() >= 20 {
        candles[candles.len() - 20..].iter().map(|c| c.volume).sum::<f64>() / 20.0
    } else if !candles.is_empty() {
        candles.iter().map(|c| c.volume).sum::<f64>() / candles.len() as f64
    } else {
        0.0
    };
    let last_volume = candles.last().map(|c| c.volume).unwrap_or(0.0);
    let institutional_activity = avg_volume > 0.0 && last_volume > 3.0 * avg_volume;
    let retail_activity = avg_volume > 0.0 && last_volume < 0.5 * avg_volume;

    let adx_val = adx::calculate_adx(candles, 14);
    let ema_alignment = ema::ema_trend_aligned(&closes);

    let quality = if candles.len() >= MIN_SUITE_PERIOD {
        DataQuality::High
    } else if candles.len() >= 14 {
        DataQuality::Medium
    } else {
        DataQuality::Low
    };

    let mut suite = IndicatorSuite {
        rsi7,
        rsi14,
        rsi21,
        atr: atr_val,
        atr_percentile: atr_pct,
        vwap: vwap_val,
        vwap_deviation: vwap_dev,
        volume_surge: vol_surge,
        velocity: vel,
        acceleration: accel,
        bollinger_upper: bb_upper,
        bollinger_middle: bb_mid,
        bollinger_lower: bb_lower,
        bollinger_squeeze: bb_squeeze,
        bollinger_percentile: bb_pct,
        macd: macd_result.macd,
        macd_signal: macd_result.signal,
        macd_histogram: macd_result.histogram,
        macd_divergence: macd_result.divergence,
        williams_r: wr,
        stoch_k,
        stoch_d,
        stoch_convergence,
        order_flow_imbalance: order_flow_val,
        institutional_activity,
        retail_activity,
        momentum_score: 0.0,
        volatility_score: 0.0,
        volume_score: 0.0,
        overall_score: 0.0,
        signal: Signal::Neutral,
        strength: 0.0,
        confidence: 0.0,
        quality,
    };

    super::composite::score_suite(&mut suite, adx_val, ema_alignment);
    suite
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: usize, base: f64) -> Candle {
        Candle::new(
            i as i64 * 60_000,
            i as i64 * 60_000 + 59_999,
            base,
            base + 1.0,
            base - 1.0,
            base,
            100.0 + i as f64,
            0.0,
            10,
            0.0,
            0.0,
            true,
        )
    }

    #[test]
    fn suite_low_quality_when_data_short() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(i, 100.0 + i as f64)).collect();
        let suite = compute_suite(&candles);
        assert_eq!(suite.quality, DataQuality::Low);
    }

    #[test]
    fn suite_high_quality_when_data_sufficient() {
        let candles: Vec<Candle> = (0..60).map(|i| candle(i, 100.0 + i as f64)).collect();
        let suite = compute_suite(&candles);
        assert_eq!(suite.quality, DataQuality::High);
    }

    #[test]
    fn suite_scores_are_in_range() {
        let candles: Vec<Candle> = (0..100)
            .map(|i| candle(i, 100.0 + (i as f64 * 0.2).sin() * 10.0))
            .collect();
        let suite = compute_suite(&candles);
        assert!((0.0..=100.0).contains(&suite.overall_score));
        assert!((0.0..=100.0).contains(&suite.strength));
        assert!((0.0..=1.0).contains(&suite.confidence));
    }
}
