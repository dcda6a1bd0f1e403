// =============================================================================
// Order-flow approximation
// =============================================================================
//
// Without a real order-book feed, order flow is approximated from candle
// volume: the ratio of current volume to SMA(10, volume) is mapped to
// {-1, 0, +1} using the bar's price direction as the sign.

use crate::market_data::Candle;

/// -1 => net selling pressure, 0 => neutral, +1 => net buying pressure.
pub fn calculate_order_flow(candles: &[Candle], period: usize) -> Option<i8> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let window = &candles[candles.len() - period - 1..candles.len() - 1];
    let avg_volume = window.iter().map(|c| c.volume).sum::<f64>() / period as f64;
    if avg_volume <= 0.0 {
        return None;
    }

    let last = candles.last()?;
    let ratio = last.volume / avg_volume;

    // Below-average volume carries no directional signal regardless of
    // price movement.
    if ratio <= 1.0 {
        return Some(0);
    }

    if last.close > last.open {
        Some(1)
    } else if last.close < last.open {
        Some(-1)
    } else {
        Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, close: f64, volume: f64) -> Candle {
        Candle::new(0, 0, open, open.max(close), open.min(close), close, volume, 0.0, 0, 0.0, 0.0, true)
    }

    #[test]
    fn order_flow_insufficient_data() {
        let candles = vec![candle(100.0, 101.0, 10.0); 5];
        assert!(calculate_order_flow(&candles, 10).is_none());
    }

    #[test]
    fn order_flow_low_volume_is_neutral() {
        let mut candles = vec![candle(100.0, 100.0, 10.0); 10];
        candles.push(candle(100.0, 105.0, 5.0));
        assert_eq!(calculate_order_flow(&candles, 10), Some(0));
    }

    #[test]
    fn order_flow_high_volume_up_bar_is_buying() {
        let mut candles = vec![candle(100.0, 100.0, 10.0); 10];
        candles.push(candle(100.0, 105.0, 50.0));
        assert_eq!(calculate_order_flow(&candles, 10), Some(1));
    }

    #[test]
    fn order_flow_high_volume_down_bar_is_selling() {
        let mut candles = vec![candle(100.0, 100.0, 10.0); 10];
        candles.push(candle(105.0, 100.0, 50.0));
        assert_eq!(calculate_order_flow(&candles, 10), Some(-1));
    }
}
