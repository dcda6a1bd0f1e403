// =============================================================================
// Composite scoring — category-weighted aggregation of the indicator suite
// =============================================================================
//
// Four categories, each normalised to a 0..100 scale where 50 is neutral,
// >50 leans bullish and <50 leans bearish:
//
//   momentum   (0.30) = RSI14 0.20 + RSI7 0.15 + RSI21 0.15 + %K 0.25 + %R 0.25
//   trend      (0.30) = MACD 0.45 + EMA-alignment 0.35 + ADX-strength 0.20
//   volatility (0.20) = Bollinger-percentile 0.6 + ATR-percentile 0.4
//   volume     (0.20) = VWAP-deviation 0.6 + order-flow 0.4
//
// overall = 0.30*momentum + 0.30*trend + 0.20*volatility + 0.20*volume
//
// signal:     overall > 70 => bullish, overall < 30 => bearish, else neutral
// strength:   |overall - 50| * 2
// confidence: 0.7 * agreement + 0.3 * mean_per_indicator_confidence

use super::suite::{IndicatorSuite, Signal};

const MOMENTUM_WEIGHT: f64 = 0.30;
const TREND_WEIGHT: f64 = 0.30;
const VOLATILITY_WEIGHT: f64 = 0.20;
const VOLUME_WEIGHT: f64 = 0.20;

fn clamp01_100(v: f64) -> f64 {
    v.clamp(0.0, 100.0)
}

/// Map a signed deviation into a 0..100 score centered on 50, saturating at
/// +/- `half_range` either side.
fn centered_score(value: f64, half_range: f64) -> f64 {
    if half_range <= 0.0 {
        return 50.0;
    }
    clamp01_100(50.0 + (value / half_range).clamp(-1.0, 1.0) * 50.0)
}

fn momentum_score(suite: &IndicatorSuite) -> f64 {
    let williams_score = suite.williams_r + 100.0; // -100..0 -> 0..100
    let weighted = suite.rsi14 * 0.20
        + suite.rsi7 * 0.15
        + suite.rsi21 * 0.15
        + suite.stoch_k * 0.25
        + williams_score * 0.25;
    clamp01_100(weighted)
}

fn trend_score(suite: &IndicatorSuite, adx: Option<f64>, ema_alignment: Option<(bool, f64)>) -> f64 {
    let macd_component = centered_score(suite.macd_histogram, suite.atr.max(1e-9) * 2.0);

    let ema_component = match ema_alignment {
        Some((bullish, strength)) => {
            let magnitude = (strength * 200.0).min(50.0);
            if bullish {
                50.0 + magnitude
            } else {
                50.0 - magnitude
            }
        }
        None => 50.0,
    };

    let adx_component = match (adx, ema_alignment) {
        (Some(strength), Some((bullish, _))) => {
            let magnitude = strength.clamp(0.0, 100.0) / 2.0;
            if bullish {
                50.0 + magnitude
            } else {
                50.0 - magnitude
            }
        }
        (Some(_), None) => 50.0,
        (None, _) => 50.0,
    };

    clamp01_100(macd_component * 0.45 + ema_component * 0.35 + adx_component * 0.20)
}

fn volatility_score(suite: &IndicatorSuite) -> f64 {
    let bollinger_component = suite.bollinger_percentile * 100.0;
    let atr_component = suite.atr_percentile * 100.0;
    clamp01_100(bollinger_component * 0.6 + atr_component * 0.4)
}

fn volume_score(suite: &IndicatorSuite) -> f64 {
    let vwap_component = centered_score(suite.vwap_deviation, 0.05);
    let flow_component = 50.0 + suite.order_flow_imbalance as f64 * 50.0;
    clamp01_100(vwap_component * 0.6 + flow_component * 0.4)
}

/// Fraction of directional indicators agreeing on the majority side, biased
/// away from indicators reading neutral.
fn agreement(suite: &IndicatorSuite, ema_alignment: Option<(bool, f64)>) -> f64 {
    let mut bullish = 0u32;
    let mut bearish = 0u32;

    let mut vote = |bull: bool| {
        if bull {
            bullish += 1;
        } else {
            bearish += 1;
        }
    };

    if suite.rsi14 > 55.0 {
        vote(true);
    } else if suite.rsi14 < 45.0 {
        vote(false);
    }
    if suite.macd_histogram > 0.0 {
        vote(true);
    } else if suite.macd_histogram < 0.0 {
        vote(false);
    }
    if suite.stoch_k > suite.stoch_d {
        vote(true);
    } else if suite.stoch_k < suite.stoch_d {
        vote(false);
    }
    if suite.williams_r > -50.0 {
        vote(true);
    } else if suite.williams_r < -50.0 {
        vote(false);
    }
    if suite.vwap_deviation > 0.0 {
        vote(true);
    } else if suite.vwap_deviation < 0.0 {
        vote(false);
    }
    if suite.order_flow_imbalance > 0 {
        vote(true);
    } else if suite.order_flow_imbalance < 0 {
        vote(false);
    }
    if let Some((bull, _)) = ema_alignment {
        vote(bull);
    }

    let total = bullish + bearish;
    if total == 0 {
        0.5
    } else {
        bullish.max(bearish) as f64 / total as f64
    }
}

fn mean_per_indicator_confidence(momentum: f64, trend: f64, volatility: f64, volume: f64) -> f64 {
    let terms = [momentum, trend, volatility, volume]
        .map(|v| ((v / 100.0) - 0.5).abs() * 2.0);
    terms.iter().sum::<f64>() / terms.len() as f64
}

/// Fill in the scoring fields of a freshly computed suite.
pub(super) fn score_suite(suite: &mut IndicatorSuite, adx: Option<f64>, ema_alignment: Option<(bool, f64)>) {
    let momentum = momentum_score(suite);
    let trend = trend_score(suite, adx, ema_alignment);
    let volatility = volatility_score(suite);
    let volume = volume_score(suite);

    let overall =
        momentum * MOMENTUM_WEIGHT + trend * TREND_WEIGHT + volatility * VOLATILITY_WEIGHT + volume * VOLUME_WEIGHT;

    let signal = if overall > 70.0 {
        Signal::Bullish
    } else if overall < 30.0 {
        Signal::Bearish
    } else {
        Signal::Neutral
    };

    let strength = (overall - 50.0).abs() * 2.0;

    let agree = agreement(suite, ema_alignment);
    let mean_conf = mean_per_indicator_confidence(momentum, trend, volatility, volume);
    let confidence = (0.7 * agree + 0.3 * mean_conf).clamp(0.0, 1.0);

    suite.momentum_score = momentum;
    suite.volatility_score = volatility;
    suite.volume_score = volume;
    suite.overall_score = overall;
    suite.signal = signal;
    suite.strength = strength;
    suite.confidence = confidence;
}

/// Rank a batch of suites by `overall_score` descending, keeping only those
/// whose confidence clears the given threshold.
pub fn top_n(suites: &[(String, IndicatorSuite)], n: usize, min_confidence: f64) -> Vec<(String, IndicatorSuite)> {
    let mut filtered: Vec<(String, IndicatorSuite)> = suites
        .iter()
        .filter(|(_, s)| s.confidence > min_confidence)
        .cloned()
        .collect();

    filtered.sort_by(|a, b| {
        b.1.overall_score
            .partial_cmp(&a.1.overall_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    filtered.truncate(n);
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator_engine::suite::compute_suite;
    use crate::market_data::Candle;

    fn candles_trending_up(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.5;
                Candle::new(
                    i as i64 * 60_000,
                    i as i64 * 60_000 + 59_999,
                    base,
                    base + 1.0,
                    base - 0.5,
                    base + 0.8,
                    100.0,
                    0.0,
                    10,
                    0.0,
                    0.0,
                    true,
                )
            })
            .collect()
    }

    #[test]
    fn strong_uptrend_is_bullish_leaning() {
        let candles = candles_trending_up(100);
        let suite = compute_suite(&candles);
        assert!(suite.overall_score > 50.0);
    }

    #[test]
    fn top_n_respects_confidence_floor() {
        let candles = candles_trending_up(100);
        let suite = compute_suite(&candles);
        let batch = vec![("BTCUSDT".to_string(), suite)];
        let ranked = top_n(&batch, 5, 1.1);
        assert!(ranked.is_empty());
    }

    #[test]
    fn top_n_sorts_descending() {
        let low = compute_suite(&candles_trending_up(30));
        let high = compute_suite(&candles_trending_up(100));
        let batch = vec![("A".to_string(), low), ("B".to_string(), high)];
        let ranked = top_n(&batch, 2, -1.0);
        assert_eq!(ranked.len(), 2);
        assert!(ranked[0].1.overall_score >= ranked[1].1.overall_score);
    }
}
