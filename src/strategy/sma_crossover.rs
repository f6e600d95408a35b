// =============================================================================
// Multi-timeframe SMA Crossover — reference strategy
// =============================================================================
//
// Three (fast, slow) SMA pairs evaluated per bar: 5/15, 10/30, 20/50. A
// fast average crossing above its slow average emits a buy, crossing below
// emits a sell — at most one signal per pair per bar.
//
// Metadata:
//   - ATR(14) as the volatility reference captured at entry.
//   - Regime from trend strength = |close - SMA50| / ATR14:
//       strength >= 1.5  -> trending  (confidence 0.5 / 0.7 / 0.9,
//                                      weighted towards the slower pairs)
//       strength <  0.5  -> ranging   (confidence 0.2 / 0.3 / 0.4)
//       otherwise        -> unknown   (confidence 0.5 / 0.6 / 0.7)
//
// Consecutive duplicate signals (same symbol, same pair, same side) are
// suppressed against the `last_signal:{symbol}:{paramTag}` marker in the
// store, so a crossover that stays crossed fires once.
// =============================================================================

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use crate::data::Bar;
use crate::indicators::atr;
use crate::indicators::sma::{simple_moving_average, simple_moving_average_prev};
use crate::store::Store;
use crate::types::Side;

use super::{Regime, Signal, SignalMetadata, Strategy};

pub const STRATEGY_NAME: &str = "sma_crossover_multi";

/// (fast, slow) periods, fastest pair first.
const SMA_PAIRS: [(usize, usize); 3] = [(5, 15), (10, 30), (20, 50)];

/// Trend-strength cut-offs for the regime label.
const TRENDING_STRENGTH: Decimal = dec!(1.5);
const RANGING_STRENGTH: Decimal = dec!(0.5);

/// Per-pair confidence by regime, fastest pair first.
const CONFIDENCE_TRENDING: [f64; 3] = [0.5, 0.7, 0.9];
const CONFIDENCE_RANGING: [f64; 3] = [0.2, 0.3, 0.4];
const CONFIDENCE_UNKNOWN: [f64; 3] = [0.5, 0.6, 0.7];

pub struct SmaCrossoverStrategy {
    store: Arc<Store>,
}

impl SmaCrossoverStrategy {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Regime classification for the newest bar. `None` strength (no SMA50
    /// or no ATR yet) maps to Unknown with zero strength.
    fn classify(history: &[Bar], atr_value: Option<Decimal>) -> (Regime, f64) {
        let close = match history.last() {
            Some(bar) => bar.close,
            None => return (Regime::Unknown, 0.0),
        };
        let sma50 = simple_moving_average(history, 50);
        let strength = match (sma50, atr_value) {
            (Some(sma50), Some(atr)) if atr > Decimal::ZERO => (close - sma50).abs() / atr,
            _ => return (Regime::Unknown, 0.0),
        };

        let regime = if strength >= TRENDING_STRENGTH {
            Regime::Trending
        } else if strength < RANGING_STRENGTH {
            Regime::Ranging
        } else {
            Regime::Unknown
        };

        // Strength is reported normalised against the trending cut-off.
        let normalised = (strength / TRENDING_STRENGTH)
            .to_f64()
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        (regime, normalised)
    }

    fn confidence(regime: Regime, pair_index: usize) -> f64 {
        match regime {
            Regime::Trending => CONFIDENCE_TRENDING[pair_index],
            Regime::Ranging => CONFIDENCE_RANGING[pair_index],
            Regime::Unknown => CONFIDENCE_UNKNOWN[pair_index],
        }
    }

    /// Crossover direction between the previous and current bar, if any.
    fn crossover(history: &[Bar], fast: usize, slow: usize) -> Option<Side> {
        let fast_now = simple_moving_average(history, fast)?;
        let slow_now = simple_moving_average(history, slow)?;
        let fast_prev = simple_moving_average_prev(history, fast)?;
        let slow_prev = simple_moving_average_prev(history, slow)?;

        if fast_prev <= slow_prev && fast_now > slow_now {
            Some(Side::Buy)
        } else if fast_prev >= slow_prev && fast_now < slow_now {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

impl Strategy for SmaCrossoverStrategy {
    fn name(&self) -> &str {
        STRATEGY_NAME
    }

    fn on_bar(&self, symbol: &str, history: &[Bar]) -> Vec<Signal> {
        let newest = match history.last() {
            Some(bar) => bar,
            None => return Vec::new(),
        };

        let atr_value = atr::calculate(history);
        let (regime, regime_strength) = Self::classify(history, atr_value);

        let mut signals = Vec::new();
        for (pair_index, (fast, slow)) in SMA_PAIRS.iter().enumerate() {
            let side = match Self::crossover(history, *fast, *slow) {
                Some(side) => side,
                None => continue,
            };
            let param_tag = format!("sma_{fast}_{slow}");

            // Consecutive duplicate suppression through the store.
            match self.store.last_signal(symbol, &param_tag) {
                Ok(Some(last)) if last == side.as_str() => {
                    debug!(symbol, %param_tag, side = %side, "duplicate signal suppressed");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(symbol, %param_tag, error = %e, "last-signal lookup failed — emitting anyway");
                }
            }
            if let Err(e) = self.store.set_last_signal(symbol, &param_tag, side.as_str()) {
                warn!(symbol, %param_tag, error = %e, "failed to persist last-signal marker");
            }

            debug!(
                symbol,
                %param_tag,
                side = %side,
                regime = %regime,
                close = %newest.close,
                "crossover signal"
            );

            signals.push(Signal {
                symbol: symbol.to_string(),
                side,
                timeframe: newest.timeframe.clone(),
                signal_timestamp: newest.timestamp,
                metadata: SignalMetadata {
                    strategy: STRATEGY_NAME.to_string(),
                    param_tag,
                    price: newest.close,
                    regime,
                    regime_strength,
                    confidence: Self::confidence(regime, pair_index),
                    atr: atr_value.unwrap_or(Decimal::ZERO),
                },
            });
        }
        signals
    }
}
