// =============================================================================
// Volume Weighted Average Price (VWAP)
// =============================================================================
//
// VWAP = cumulative(typical_price * volume) / cumulative(volume), where
// typical_price = (high + low + close) / 3.
//
// Deviation = (current_price - VWAP) / VWAP.
// Volume surge iff current_volume > 2 * SMA(20, volume).

use crate::market_data::Candle;

#[derive(Debug, Clone, Copy)]
pub struct VwapResult {
    pub vwap: f64,
    pub deviation: f64,
    pub volume_surge: bool,
}

/// Compute VWAP over the entire supplied window, plus deviation of the most
/// recent close from it and a volume-surge flag against a trailing
/// SMA(20, volume).
pub fn calculate_vwap(candles: &[Candle]) -> Option<VwapResult> {
    if candles.is_empty() {
        return None;
    }

    let mut cum_pv = 0.0;
    let mut cum_v = 0.0;
    for c in candles {
        let typical = (c.high + c.low + c.close) / 3.0;
        cum_pv += typical * c.volume;
        cum_v += c.volume;
    }

    if cum_v == 0.0 {
        return None;
    }

    let vwap = cum_pv / cum_v;
    if !vwap.is_finite() || vwap == 0.0 {
        return None;
    }

    let current_price = candles.last()?.close;
    let deviation = (current_price - vwap) / vwap;

    let window = 20.min(candles.len());
    let recent_vol_avg =
        candles[candles.len() - window..].iter().map(|c| c.volume).sum::<f64>() / window as f64;
    let current_volume = candles.last()?.volume;
    let volume_surge = recent_vol_avg > 0.0 && current_volume > 2.0 * recent_vol_avg;

    Some(VwapResult {
        vwap,
        deviation,
        volume_surge,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle::new(0, 0, close, high, low, close, volume, 0.0, 0, 0.0, 0.0, true)
    }

    #[test]
    fn vwap_empty_is_none() {
        assert!(calculate_vwap(&[]).is_none());
    }

    #[test]
    fn vwap_constant_price_equals_price() {
        let candles = vec![candle(101.0, 99.0, 100.0, 10.0); 25];
        let r = calculate_vwap(&candles).unwrap();
        assert!((r.vwap - 100.0).abs() < 1e-6);
        assert!(r.deviation.abs() < 1e-6);
        assert!(!r.volume_surge);
    }

    #[test]
    fn vwap_volume_surge_detected() {
        let mut candles = vec![candle(101.0, 99.0, 100.0, 10.0); 20];
        candles.push(candle(101.0, 99.0, 100.0, 100.0));
        let r = calculate_vwap(&candles).unwrap();
        assert!(r.volume_surge);
    }

    #[test]
    fn vwap_deviation_sign_matches_price_direction() {
        let mut candles = vec![candle(101.0, 99.0, 100.0, 10.0); 20];
        candles.push(candle(121.0, 119.0, 120.0, 10.0));
        let r = calculate_vwap(&candles).unwrap();
        assert!(r.deviation > 0.0);
    }
}
