// =============================================================================
// Data Handler — normalise, persist, publish
// =============================================================================
//
// Thin coordinator over the bars handler, which owns the three jobs for
// every incoming bar:
//
//   1. normalisation — OHLCV validation, UTC timestamps, per-symbol
//      strictly-increasing order (stale and duplicate bars dropped silently)
//   2. persistence — idempotent insert keyed by (symbol, timeframe, ts)
//   3. publication — BarEvent onto the bus
//
// A rolling window of the most recent bars per symbol feeds the strategy;
// it is preloaded from the store at startup so warm-up needs no live bars.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus};
use crate::store::Store;

use super::Bar;

/// Cap on the per-symbol in-memory rolling window.
pub const HISTORY_CAPACITY: usize = 500;

/// What happened to a raw bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarOutcome {
    /// Normalised, persisted, and published.
    Published,
    /// Already seen (same or older timestamp) — dropped silently.
    Duplicate,
    /// Failed OHLCV validation — dropped with a warning.
    Invalid,
}

pub struct DataHandler {
    store: Arc<Store>,
    bus: EventBus,
    timeframe: String,
    histories: RwLock<HashMap<String, VecDeque<Bar>>>,
}

impl DataHandler {
    pub fn new(store: Arc<Store>, bus: EventBus, timeframe: impl Into<String>) -> Self {
        Self {
            store,
            bus,
            timeframe: timeframe.into(),
            histories: RwLock::new(HashMap::new()),
        }
    }

    /// Populate the rolling windows from the store. Returns the number of
    /// bars loaded across all symbols.
    pub fn preload(&self, symbols: &[String]) -> Result<usize> {
        let mut total = 0;
        let mut histories = self.histories.write();
        for symbol in symbols {
            let bars = self
                .store
                .recent_bars(symbol, &self.timeframe, HISTORY_CAPACITY)?;
            total += bars.len();
            histories.insert(symbol.clone(), bars.into_iter().collect());
        }
        info!(symbols = symbols.len(), bars = total, "bar histories preloaded");
        Ok(total)
    }

    /// Ingest one raw bar: validate, dedupe, persist, publish.
    pub fn on_raw_bar(&self, bar: Bar) -> Result<BarOutcome> {
        if bar.timeframe != self.timeframe {
            debug!(
                symbol = %bar.symbol,
                timeframe = %bar.timeframe,
                "bar for unsubscribed timeframe dropped"
            );
            return Ok(BarOutcome::Duplicate);
        }
        if !bar.is_valid() {
            warn!(
                symbol = %bar.symbol,
                ts = %bar.timestamp,
                open = %bar.open,
                high = %bar.high,
                low = %bar.low,
                close = %bar.close,
                "invalid bar dropped"
            );
            return Ok(BarOutcome::Invalid);
        }

        // Per-symbol strict timestamp order: anything at or before the
        // newest seen bar is a duplicate or a late replay.
        {
            let histories = self.histories.read();
            if let Some(window) = histories.get(&bar.symbol) {
                if let Some(last) = window.back() {
                    if bar.timestamp <= last.timestamp {
                        return Ok(BarOutcome::Duplicate);
                    }
                }
            }
        }

        // Idempotent persistence is the authoritative duplicate check (a
        // restart empties the in-memory windows, the store remembers).
        if !self.store.insert_bar(&bar)? {
            return Ok(BarOutcome::Duplicate);
        }

        {
            let mut histories = self.histories.write();
            let window = histories.entry(bar.symbol.clone()).or_default();
            window.push_back(bar.clone());
            while window.len() > HISTORY_CAPACITY {
                window.pop_front();
            }
        }

        self.bus.publish(Event::Bar(bar));
        Ok(BarOutcome::Published)
    }

    /// Snapshot of the rolling window for a symbol, oldest first.
    pub fn history(&self, symbol: &str) -> Vec<Bar> {
        self.histories
            .read()
            .get(symbol)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest_bar(&self, symbol: &str) -> Option<Bar> {
        self.histories
            .read()
            .get(symbol)
            .and_then(|w| w.back().cloned())
    }

    pub fn latest_close(&self, symbol: &str) -> Option<Decimal> {
        self.latest_bar(symbol).map(|b| b.close)
    }
}
