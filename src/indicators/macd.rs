// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line  = EMA(fast) - EMA(slow)
// Signal     = EMA(signal_period) of the MACD line
// Histogram  = MACD - Signal
//
// Defaults: fast=12, slow=26, signal=9.

use super::ema::calculate_ema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MacdDivergence {
    Bullish,
    Bearish,
    None,
}

#[derive(Debug, Clone, Copy)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
    pub divergence: MacdDivergence,
}

impl MacdResult {
    fn flat() -> Self {
        Self {
            macd: 0.0,
            signal: 0.0,
            histogram: 0.0,
            divergence: MacdDivergence::None,
        }
    }
}

/// Compute the current MACD reading. Per the indicator-suite contract, a
/// buffer shorter than the slow period (26) reports the flat `{0,0,0,none}`
/// reading rather than `None` — MACD is part of the suite that must always
/// be present, just possibly zeroed when starved of data.
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> MacdResult {
    if closes.len() < slow {
        return MacdResult::flat();
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);

    if ema_fast.is_empty() || ema_slow.is_empty() {
        return MacdResult::flat();
    }

    // Align the two series on their tails: ema_fast has more lead-in values
    // than ema_slow since fast < slow, so only the last `ema_slow.len()`
    // fast values have a corresponding slow value.
    let n = ema_slow.len();
    let fast_tail = &ema_fast[ema_fast.len() - n..];

    let macd_series: Vec<f64> = fast_tail
        .iter()
        .zip(ema_slow.iter())
        .map(|(f, s)| f - s)
        .collect();

    if macd_series.len() < signal_period {
        let macd = *macd_series.last().unwrap_or(&0.0);
        return MacdResult {
            macd,
            signal: 0.0,
            histogram: macd,
            divergence: MacdDivergence::None,
        };
    }

    let signal_series = calculate_ema(&macd_series, signal_period);
    let macd = *macd_series.last().unwrap();
    let signal = *signal_series.last().unwrap_or(&0.0);
    let histogram = macd - signal;

    let divergence = if histogram > 0.0 && macd > 0.0 {
        MacdDivergence::Bullish
    } else if histogram < 0.0 && macd < 0.0 {
        MacdDivergence::Bearish
    } else {
        MacdDivergence::None
    };

    MacdResult {
        macd,
        signal,
        histogram,
        divergence,
    }
}

/// Convenience wrapper with the standard 12/26/9 configuration.
pub fn calculate(closes: &[f64]) -> MacdResult {
    calculate_macd(closes, 12, 26, 9)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data_is_flat() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let r = calculate(&closes);
        assert_eq!(r.macd, 0.0);
        assert_eq!(r.signal, 0.0);
        assert_eq!(r.histogram, 0.0);
        assert_eq!(r.divergence, MacdDivergence::None);
    }

    #[test]
    fn macd_uptrend_is_bullish() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let r = calculate(&closes);
        assert!(r.macd > 0.0);
        assert_eq!(r.divergence, MacdDivergence::Bullish);
    }

    #[test]
    fn macd_downtrend_is_bearish() {
        let closes: Vec<f64> = (1..=100).rev().map(|x| x as f64).collect();
        let r = calculate(&closes);
        assert!(r.macd < 0.0);
        assert_eq!(r.divergence, MacdDivergence::Bearish);
    }

    #[test]
    fn macd_flat_series_is_zero() {
        let closes = vec![100.0; 60];
        let r = calculate(&closes);
        assert!((r.macd).abs() < 1e-9);
        assert!((r.histogram).abs() < 1e-9);
    }
}
