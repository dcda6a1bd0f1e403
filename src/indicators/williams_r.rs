// =============================================================================
// Williams %R
// =============================================================================
//
// %R = (highest_high - close) / (highest_high - lowest_low) * -100, over
// `period`. A transform of the same range used by the Stochastic %K,
// rescaled into [-100, 0].

use crate::market_data::Candle;

/// Compute the current Williams %R reading.
pub fn calculate_williams_r(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }

    let window = &candles[candles.len() - period..];
    let highest_high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let lowest_low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    let range = highest_high - lowest_low;
    let close = candles.last()?.close;

    let r = if range == 0.0 {
        -50.0
    } else {
        (highest_high - close) / range * -100.0
    };

    if r.is_finite() {
        Some(r)
    } else {
        None
    }
}

pub fn calculate(candles: &[Candle]) -> Option<f64> {
    calculate_williams_r(candles, 14)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle::new(0, 0, close, high, low, close, 1.0, 0.0, 0, 0.0, 0.0, true)
    }

    #[test]
    fn williams_r_insufficient_data() {
        let candles = vec![candle(101.0, 99.0, 100.0); 5];
        assert!(calculate(&candles).is_none());
    }

    #[test]
    fn williams_r_range() {
        let candles: Vec<Candle> = (0..20)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.2).cos() * 4.0;
                candle(base + 2.0, base - 2.0, base)
            })
            .collect();
        let r = calculate(&candles).unwrap();
        assert!((-100.0..=0.0).contains(&r));
    }

    #[test]
    fn williams_r_at_high_is_zero() {
        let candles: Vec<Candle> = (0..20)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base - 10.0, base)
            })
            .collect();
        let r = calculate(&candles).unwrap();
        assert!(r.abs() < 1e-9);
    }

    #[test]
    fn williams_r_flat_range_is_neutral() {
        let candles = vec![candle(100.0, 100.0, 100.0); 20];
        let r = calculate(&candles).unwrap();
        assert!((r - (-50.0)).abs() < 1e-9);
    }
}
