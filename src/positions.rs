// =============================================================================
// Position Tracker — in-memory projection of open lots
// =============================================================================
//
// One entry per symbol. The tracker is a projection: the store's
// position_tracking table is written through on every mutation, and the
// in-memory map is rebuilt from it at startup (rehydration).
//
// Fill application:
//   - opening fill (buy)  -> create the position with entry = average fill
//     price, the ATR captured from the signal, and the trailing stop seeded
//     below entry; a buy into an existing position scales it in with a
//     weighted-average entry.
//   - closing fill (sell) -> decrement quantity; at zero the entity is
//     removed, realised P&L lands in the daily counter, the trade counter
//     increments, and a trade row is written.
//
// pending_exit guards against double-submitted exits: set when an exit
// order goes out, cleared only when that order fails terminally. A fill
// does not clear it — the position is removed instead.
//
// Thread-safety: one mutex across the whole map.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::BrokerOrder;
use crate::data::Bar;
use crate::store::Store;
use crate::types::{Fill, Side};

/// One open lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub symbol: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    /// Volatility reference captured at entry; zero when unknown.
    pub atr_value: Decimal,
    pub trailing_stop_price: Decimal,
    pub pending_exit: bool,
    /// Client order id of the working exit order, if any.
    pub pending_exit_order: Option<String>,
    pub opened_at: DateTime<Utc>,
}

pub struct PositionTracker {
    store: Arc<Store>,
    positions: Mutex<HashMap<String, TrackedPosition>>,
    /// ATR multiple used to seed and ratchet the trailing stop.
    trailing_multiplier: Decimal,
    /// ATR hints for entries in flight, keyed by client order id. Populated
    /// by the order manager at submit time, consumed on the opening fill.
    entry_atr_hints: Mutex<HashMap<String, Decimal>>,
}

impl PositionTracker {
    pub fn new(store: Arc<Store>, trailing_multiplier: Decimal) -> Self {
        Self {
            store,
            positions: Mutex::new(HashMap::new()),
            trailing_multiplier,
            entry_atr_hints: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Rehydration
    // -------------------------------------------------------------------------

    /// Rebuild the in-memory map from the store. Returns the position count.
    pub fn rehydrate(&self) -> Result<usize> {
        let rows = self.store.load_tracked_positions()?;
        let mut map = self.positions.lock();
        map.clear();
        for row in rows {
            if row.quantity > Decimal::ZERO {
                map.insert(row.symbol.clone(), row);
            }
        }
        info!(positions = map.len(), "position tracker rehydrated");
        Ok(map.len())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get(&self, symbol: &str) -> Option<TrackedPosition> {
        self.positions.lock().get(symbol).cloned()
    }

    pub fn snapshot(&self) -> Vec<TrackedPosition> {
        let mut out: Vec<_> = self.positions.lock().values().cloned().collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    pub fn open_count(&self) -> usize {
        self.positions.lock().len()
    }

    /// Count of open positions whose symbol appears in `equities`.
    pub fn open_equity_count(&self, equities: &[String]) -> usize {
        let map = self.positions.lock();
        map.keys().filter(|s| equities.contains(s)).count()
    }

    // -------------------------------------------------------------------------
    // Entry ATR hints
    // -------------------------------------------------------------------------

    /// Remember the signal's ATR for the opening fill of `client_order_id`.
    pub fn note_entry_atr(&self, client_order_id: &str, atr: Decimal) {
        self.entry_atr_hints
            .lock()
            .insert(client_order_id.to_string(), atr);
    }

    // -------------------------------------------------------------------------
    // Order updates
    // -------------------------------------------------------------------------

    /// Apply a broker order observation: record fills idempotently, update
    /// the stored intent, and project the position change.
    pub fn on_order_update(&self, order: &BrokerOrder) -> Result<()> {
        let prior = self.store.get_order_intent(&order.client_order_id)?;
        let Some(prior) = prior else {
            debug!(
                client_order_id = %order.client_order_id,
                "order update for unknown intent ignored"
            );
            return Ok(());
        };

        // Terminal failures never resurrect a terminal intent, but a stale
        // update must not regress one either.
        if prior.status.is_terminal() && !order.status.is_terminal() {
            debug!(
                client_order_id = %order.client_order_id,
                stored = %prior.status,
                observed = %order.status,
                "stale update for terminal intent ignored"
            );
            return Ok(());
        }

        self.store.apply_order_update(
            &order.client_order_id,
            order.status,
            order.filled_quantity,
            order.average_fill_price,
            Utc::now(),
        )?;

        // Exit order that died without filling: release the pending flag so
        // the next scan can try again.
        if order.status.is_terminal_failure() {
            self.clear_pending_exit_if_matches(&order.client_order_id)?;
        }

        let fill_delta = order.filled_quantity - prior.filled_quantity;
        if fill_delta <= Decimal::ZERO {
            return Ok(());
        }

        let fill = Fill {
            broker_order_id: order.broker_order_id.clone(),
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: fill_delta,
            cumulative_quantity: order.filled_quantity,
            price: order.average_fill_price,
            timestamp: order.updated_at,
        };
        if !self.store.insert_fill(&fill)? {
            debug!(dedupe_key = %fill.dedupe_key(), "fill already recorded");
            return Ok(());
        }

        match order.side {
            Side::Buy => self.apply_opening_fill(&fill),
            Side::Sell => self.apply_closing_fill(&fill),
        }
    }

    fn apply_opening_fill(&self, fill: &Fill) -> Result<()> {
        use std::collections::hash_map::Entry;

        let atr = self
            .entry_atr_hints
            .lock()
            .remove(&fill.client_order_id)
            .unwrap_or(Decimal::ZERO);

        let mut map = self.positions.lock();
        let position = match map.entry(fill.symbol.clone()) {
            Entry::Occupied(mut occupied) => {
                // Scale-in: weighted-average entry across the lots.
                let existing = occupied.get_mut();
                let total = existing.quantity + fill.quantity;
                existing.entry_price = (existing.entry_price * existing.quantity
                    + fill.price * fill.quantity)
                    / total;
                existing.quantity = total;
                if atr > Decimal::ZERO {
                    existing.atr_value = atr;
                }
                existing.clone()
            }
            Entry::Vacant(vacant) => {
                let position = TrackedPosition {
                    symbol: fill.symbol.clone(),
                    quantity: fill.quantity,
                    entry_price: fill.price,
                    atr_value: atr,
                    trailing_stop_price: fill.price - self.trailing_multiplier * atr,
                    pending_exit: false,
                    pending_exit_order: None,
                    opened_at: fill.timestamp,
                };
                vacant.insert(position.clone());
                position
            }
        };
        drop(map);

        info!(
            symbol = %position.symbol,
            quantity = %position.quantity,
            entry = %position.entry_price,
            atr = %position.atr_value,
            "position opened/increased"
        );
        self.store.upsert_position(&position)?;
        Ok(())
    }

    fn apply_closing_fill(&self, fill: &Fill) -> Result<()> {
        let mut map = self.positions.lock();
        let Some(position) = map.get_mut(&fill.symbol) else {
            warn!(symbol = %fill.symbol, "closing fill with no tracked position");
            return Ok(());
        };

        let closed = fill.quantity.min(position.quantity);
        let realized = (fill.price - position.entry_price) * closed;
        let entry_price = position.entry_price;
        position.quantity -= closed;

        if position.quantity <= Decimal::ZERO {
            map.remove(&fill.symbol);
            drop(map);

            info!(
                symbol = %fill.symbol,
                exit_price = %fill.price,
                realized_pnl = %realized,
                "position closed"
            );
            self.store.delete_position(&fill.symbol)?;
            self.store.clear_exit_attempts(&fill.symbol)?;
            self.store.add_daily_realized_pnl(realized)?;
            self.store.increment_daily_trade_count()?;
            self.store.insert_trade(
                &fill.symbol,
                Side::Sell,
                closed,
                entry_price,
                fill.price,
                realized,
                fill.timestamp,
            )?;
        } else {
            let position = position.clone();
            drop(map);

            info!(
                symbol = %fill.symbol,
                remaining = %position.quantity,
                realized_pnl = %realized,
                "position partially closed"
            );
            self.store.upsert_position(&position)?;
            self.store.add_daily_realized_pnl(realized)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trailing stop
    // -------------------------------------------------------------------------

    /// Ratchet the trailing stop on a new bar:
    /// `trailing := max(trailing, close - multiplier * atr)`.
    pub fn on_bar(&self, bar: &Bar) -> Result<()> {
        let updated = {
            let mut map = self.positions.lock();
            match map.get_mut(&bar.symbol) {
                Some(position) if position.atr_value > Decimal::ZERO => {
                    let candidate = bar.close - self.trailing_multiplier * position.atr_value;
                    if candidate > position.trailing_stop_price {
                        position.trailing_stop_price = candidate;
                        Some(position.clone())
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(position) = updated {
            debug!(
                symbol = %position.symbol,
                trailing_stop = %position.trailing_stop_price,
                "trailing stop ratcheted"
            );
            self.store.upsert_position(&position)?;
        }
        Ok(())
    }

    /// Same ratchet from the exit scan, driven by the latest close.
    pub fn refresh_trailing_stop(&self, symbol: &str, close: Decimal) -> Result<()> {
        let updated = {
            let mut map = self.positions.lock();
            match map.get_mut(symbol) {
                Some(position) if position.atr_value > Decimal::ZERO => {
                    let candidate = close - self.trailing_multiplier * position.atr_value;
                    if candidate > position.trailing_stop_price {
                        position.trailing_stop_price = candidate;
                        Some(position.clone())
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(position) = updated {
            self.store.upsert_position(&position)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Pending-exit flag
    // -------------------------------------------------------------------------

    /// Mark an exit order as working for `symbol`.
    pub fn set_pending_exit(&self, symbol: &str, client_order_id: &str) -> Result<()> {
        let updated = {
            let mut map = self.positions.lock();
            match map.get_mut(symbol) {
                Some(position) => {
                    position.pending_exit = true;
                    position.pending_exit_order = Some(client_order_id.to_string());
                    Some(position.clone())
                }
                None => None,
            }
        };
        if let Some(position) = updated {
            self.store.upsert_position(&position)?;
        }
        Ok(())
    }

    /// Clear the flag unconditionally (runtime reconciliation repair).
    pub fn clear_pending_exit(&self, symbol: &str) -> Result<()> {
        let updated = {
            let mut map = self.positions.lock();
            match map.get_mut(symbol) {
                Some(position) => {
                    position.pending_exit = false;
                    position.pending_exit_order = None;
                    Some(position.clone())
                }
                None => None,
            }
        };
        if let Some(position) = updated {
            self.store.upsert_position(&position)?;
        }
        Ok(())
    }

    /// Clear the flag iff the failed order is the one we were waiting on.
    fn clear_pending_exit_if_matches(&self, client_order_id: &str) -> Result<()> {
        let updated = {
            let mut map = self.positions.lock();
            let hit = map.values_mut().find(|p| {
                p.pending_exit_order.as_deref() == Some(client_order_id)
            });
            match hit {
                Some(position) => {
                    position.pending_exit = false;
                    position.pending_exit_order = None;
                    info!(
                        symbol = %position.symbol,
                        client_order_id,
                        "exit order failed terminally — pending flag cleared"
                    );
                    Some(position.clone())
                }
                None => None,
            }
        };
        if let Some(position) = updated {
            self.store.upsert_position(&position)?;
        }
        Ok(())
    }

    /// Drop a position outright (ghost-position cleanup).
    pub fn remove(&self, symbol: &str) -> Result<()> {
        self.positions.lock().remove(symbol);
        self.store.delete_position(symbol)?;
        Ok(())
    }
}

impl std::fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionTracker")
            .field("open_positions", &self.open_count())
            .finish()
    }
}
