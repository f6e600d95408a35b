// =============================================================================
// Simple Moving Average over bar closes
// =============================================================================

use rust_decimal::Decimal;

use crate::data::Bar;

/// SMA of the last `period` closes of `bars` (oldest first). `None` when
/// there is not enough history or `period` is zero.
pub fn simple_moving_average(bars: &[Bar], period: usize) -> Option<Decimal> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let sum: Decimal = bars[bars.len() - period..].iter().map(|b| b.close).sum();
    Some(sum / Decimal::from(period as u64))
}

/// SMA of the last `period` closes *excluding* the newest bar — the value
/// the average had one bar ago. Used for crossover detection.
pub fn simple_moving_average_prev(bars: &[Bar], period: usize) -> Option<Decimal> {
    if bars.is_empty() {
        return None;
    }
    simple_moving_average(&bars[..bars.len() - 1], period)
}
