// =============================================================================
// Strategy contract and signal types
// =============================================================================
//
// A strategy consumes the per-symbol rolling bar window and emits zero or
// more signals per bar. Strategies never touch the broker or the market
// data source; bars arrive through the handler, and any durable private
// state goes through the store.
// =============================================================================

pub mod sma_crossover;

pub use sma_crossover::SmaCrossoverStrategy;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::data::Bar;
use crate::types::Side;

/// Label assigned to recent price behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Trending,
    Ranging,
    Unknown,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trending => write!(f, "trending"),
            Self::Ranging => write!(f, "ranging"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Strategy-attached metadata carried with every signal through the risk
/// gate and into order sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMetadata {
    /// Strategy name; first component of the deterministic order id.
    pub strategy: String,
    /// Parameter tag, e.g. `sma_5_15`.
    pub param_tag: String,
    /// Close of the bar that produced the signal.
    pub price: Decimal,
    pub regime: Regime,
    /// Trend strength normalised into [0, 1].
    pub regime_strength: f64,
    /// Confidence in [0, 1]; the FILTERS tier skips anything below 0.5.
    pub confidence: f64,
    /// ATR(14) at signal time; volatility reference for exits.
    pub atr: Decimal,
}

/// A trade candidate emitted by a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    pub timeframe: String,
    pub signal_timestamp: DateTime<Utc>,
    pub metadata: SignalMetadata,
}

/// Strategy contract: one callback per published bar.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Evaluate the bar window for `symbol` (oldest first, newest bar last)
    /// and return the signals it produces, in emission order.
    fn on_bar(&self, symbol: &str, history: &[Bar]) -> Vec<Signal>;
}
