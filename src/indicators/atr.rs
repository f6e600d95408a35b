// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// ATR measures volatility by decomposing the entire range of a bar.
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the smoothed average of TR using Wilder's method:
//   ATR_0   = SMA of first `period` TR values
//   ATR_t   = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Default period: 14
// =============================================================================

use rust_decimal::Decimal;

use crate::data::Bar;

/// Standard look-back used by the strategy's volatility metadata.
pub const DEFAULT_PERIOD: usize = 14;

/// Compute the most recent ATR value from a slice of bars (oldest first)
/// using Wilder's smoothing method.
///
/// Returns `None` when `period` is zero or there are fewer than
/// `period + 1` bars (each TR needs the previous close).
pub fn calculate_atr(bars: &[Bar], period: usize) -> Option<Decimal> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<Decimal> = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();

        tr_values.push(hl.max(hc).max(lc));
    }

    let period_dec = Decimal::from(period as u64);
    let mut atr: Decimal = tr_values[..period].iter().copied().sum::<Decimal>() / period_dec;

    for &tr in &tr_values[period..] {
        atr = (atr * (period_dec - Decimal::ONE) + tr) / period_dec;
    }

    Some(atr)
}

/// ATR with the standard 14-bar period.
pub fn calculate(bars: &[Bar]) -> Option<Decimal> {
    calculate_atr(bars, DEFAULT_PERIOD)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    /// Build a test bar with the given OHLC values.
    fn bar(i: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Bar {
        Bar {
            symbol: "AAPL".into(),
            timeframe: "1m".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 2, 21, 10, 0, 0).unwrap()
                + chrono::Duration::minutes(i),
            open,
            high,
            low,
            close,
            volume: dec!(100),
        }
    }

    #[test]
    fn atr_period_zero() {
        let bars: Vec<Bar> = (0..20)
            .map(|i| bar(i, dec!(100), dec!(105), dec!(95), dec!(102)))
            .collect();
        assert!(calculate_atr(&bars, 0).is_none());
    }

    #[test]
    fn atr_insufficient_data() {
        // Need period + 1 = 15 bars for period=14, only have 10.
        let bars: Vec<Bar> = (0..10)
            .map(|i| bar(i, dec!(100), dec!(105), dec!(95), dec!(102)))
            .collect();
        assert!(calculate_atr(&bars, 14).is_none());
    }

    #[test]
    fn atr_constant_range() {
        // Constant H-L of 10 with close at midpoint: ATR converges to 10.
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let base = dec!(100) + Decimal::from(i) * dec!(0.1);
                bar(i, base, base + dec!(5), base - dec!(5), base)
            })
            .collect();
        let atr = calculate_atr(&bars, 14).unwrap();
        assert!(
            (atr - dec!(10)).abs() < dec!(1),
            "expected ATR near 10, got {atr}"
        );
    }

    #[test]
    fn atr_true_range_uses_prev_close() {
        // Gap scenario: |H - prevClose| > H - L.
        let bars = vec![
            bar(0, dec!(100), dec!(105), dec!(95), dec!(95)),
            bar(1, dec!(110), dec!(115), dec!(108), dec!(112)), // gap up: |115-95|=20 > 7
            bar(2, dec!(112), dec!(118), dec!(110), dec!(115)),
            bar(3, dec!(115), dec!(120), dec!(113), dec!(118)),
        ];
        let atr = calculate_atr(&bars, 3).unwrap();
        assert!(atr > dec!(7), "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_exact_value_small_window() {
        // period=2 over 3 bars: TRs are exactly 4 and 4, ATR = 4.
        let bars = vec![
            bar(0, dec!(100), dec!(102), dec!(98), dec!(100)),
            bar(1, dec!(100), dec!(102), dec!(98), dec!(100)),
            bar(2, dec!(100), dec!(102), dec!(98), dec!(100)),
        ];
        assert_eq!(calculate_atr(&bars, 2).unwrap(), dec!(4));
    }

    #[test]
    fn default_period_helper_matches_explicit() {
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let base = dec!(100) + Decimal::from(i);
                bar(i, base, base + dec!(3), base - dec!(3), base + dec!(1))
            })
            .collect();
        assert_eq!(calculate(&bars), calculate_atr(&bars, 14));
    }
}
