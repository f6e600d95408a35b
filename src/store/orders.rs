// =============================================================================
// Store — order intents, fills, and closed trades
// =============================================================================

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use rust_decimal::Decimal;

use crate::types::{Fill, OrderIntent, OrderStatus, Side};

use super::{decimal_from_sql, decimal_to_sql, ts_from_sql, ts_to_sql, Store, StoreError,
            StoreResult};

/// Map a decode failure onto rusqlite's conversion-failure error so row
/// mapping composes with `query_map`.
fn corrupt<T>(idx: usize, result: Result<T, StoreError>) -> rusqlite::Result<T> {
    result.map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}

fn intent_from_row(row: &Row<'_>) -> rusqlite::Result<OrderIntent> {
    let side: String = row.get(2)?;
    let quantity: String = row.get(3)?;
    let limit_price: String = row.get(4)?;
    let status: String = row.get(5)?;
    let filled_quantity: String = row.get(7)?;
    let average_fill_price: String = row.get(8)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    Ok(OrderIntent {
        client_order_id: row.get(0)?,
        symbol: row.get(1)?,
        side: corrupt(2, side.parse::<Side>().map_err(StoreError::Corrupt))?,
        quantity: corrupt(3, decimal_from_sql(&quantity))?,
        limit_price: corrupt(4, decimal_from_sql(&limit_price))?,
        status: corrupt(5, status.parse::<OrderStatus>().map_err(StoreError::Corrupt))?,
        broker_order_id: row.get(6)?,
        filled_quantity: corrupt(7, decimal_from_sql(&filled_quantity))?,
        average_fill_price: corrupt(8, decimal_from_sql(&average_fill_price))?,
        last_error: row.get(9)?,
        created_at: corrupt(10, ts_from_sql(&created_at))?,
        updated_at: corrupt(11, ts_from_sql(&updated_at))?,
    })
}

const INTENT_COLUMNS: &str = "client_order_id, symbol, side, quantity, limit_price, status, \
                              broker_order_id, filled_quantity, average_fill_price, last_error, \
                              created_at, updated_at";

impl Store {
    /// Persist a new order intent. Idempotent: re-inserting an existing
    /// `client_order_id` leaves the stored row untouched and returns `false`.
    pub fn insert_order_intent(&self, intent: &OrderIntent) -> StoreResult<bool> {
        let inserted = self.with_conn(|c| {
            c.execute(
                "INSERT OR IGNORE INTO order_intents \
                 (client_order_id, symbol, side, quantity, limit_price, status, broker_order_id, \
                  filled_quantity, average_fill_price, last_error, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    intent.client_order_id,
                    intent.symbol,
                    intent.side.as_str(),
                    decimal_to_sql(intent.quantity),
                    decimal_to_sql(intent.limit_price),
                    intent.status.as_str(),
                    intent.broker_order_id,
                    decimal_to_sql(intent.filled_quantity),
                    decimal_to_sql(intent.average_fill_price),
                    intent.last_error,
                    ts_to_sql(intent.created_at),
                    ts_to_sql(intent.updated_at),
                ],
            )
        })?;
        Ok(inserted == 1)
    }

    pub fn get_order_intent(&self, client_order_id: &str) -> StoreResult<Option<OrderIntent>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare_cached(&format!(
                "SELECT {INTENT_COLUMNS} FROM order_intents WHERE client_order_id = ?1"
            ))?;
            let mut rows = stmt.query(params![client_order_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(intent_from_row(row)?)),
                None => Ok(None),
            }
        })
    }

    /// All intents whose status is not terminal, oldest first.
    pub fn open_order_intents(&self) -> StoreResult<Vec<OrderIntent>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare_cached(&format!(
                "SELECT {INTENT_COLUMNS} FROM order_intents \
                 WHERE status NOT IN ('filled', 'canceled', 'rejected', 'expired') \
                 ORDER BY created_at ASC"
            ))?;
            let mapped = stmt.query_map([], intent_from_row)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    /// Record a successful broker acceptance.
    pub fn mark_intent_submitted(
        &self,
        client_order_id: &str,
        broker_order_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE order_intents \
                 SET broker_order_id = ?2, status = 'accepted', updated_at = ?3 \
                 WHERE client_order_id = ?1",
                params![client_order_id, broker_order_id, ts_to_sql(now)],
            )
        })?;
        Ok(())
    }

    /// Record a failed broker submission with the broker's error message.
    pub fn mark_intent_rejected(
        &self,
        client_order_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE order_intents \
                 SET status = 'rejected', last_error = ?2, updated_at = ?3 \
                 WHERE client_order_id = ?1",
                params![client_order_id, error, ts_to_sql(now)],
            )
        })?;
        Ok(())
    }

    /// Apply a broker-side status/fill observation to the stored intent.
    /// Used by order-update events and by reconciliation auto-apply.
    pub fn apply_order_update(
        &self,
        client_order_id: &str,
        status: OrderStatus,
        filled_quantity: Decimal,
        average_fill_price: Decimal,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE order_intents \
                 SET status = ?2, filled_quantity = ?3, average_fill_price = ?4, updated_at = ?5 \
                 WHERE client_order_id = ?1",
                params![
                    client_order_id,
                    status.as_str(),
                    decimal_to_sql(filled_quantity),
                    decimal_to_sql(average_fill_price),
                    ts_to_sql(now),
                ],
            )
        })?;
        Ok(())
    }

    /// Insert a fill keyed by its dedupe key. Returns `false` when the fill
    /// was already recorded (duplicate suppression, not an error).
    pub fn insert_fill(&self, fill: &Fill) -> StoreResult<bool> {
        let inserted = self.with_conn(|c| {
            c.execute(
                "INSERT OR IGNORE INTO fills \
                 (dedupe_key, broker_order_id, client_order_id, symbol, side, quantity, \
                  cumulative_quantity, price, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    fill.dedupe_key(),
                    fill.broker_order_id,
                    fill.client_order_id,
                    fill.symbol,
                    fill.side.as_str(),
                    decimal_to_sql(fill.quantity),
                    decimal_to_sql(fill.cumulative_quantity),
                    decimal_to_sql(fill.price),
                    ts_to_sql(fill.timestamp),
                ],
            )
        })?;
        Ok(inserted == 1)
    }

    /// Sum of signed fill quantities for a symbol (buys minus sells).
    pub fn signed_fill_quantity(&self, symbol: &str) -> StoreResult<Decimal> {
        let rows: Vec<(String, String)> = self.with_conn(|c| {
            let mut stmt =
                c.prepare_cached("SELECT side, quantity FROM fills WHERE symbol = ?1")?;
            let mapped = stmt.query_map(params![symbol], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            mapped.collect()
        })?;

        let mut total = Decimal::ZERO;
        for (side, qty) in rows {
            let side: Side = side.parse().map_err(StoreError::Corrupt)?;
            total += side.sign() * decimal_from_sql(&qty)?;
        }
        Ok(total)
    }

    /// Record a completed round-trip.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_trade(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        entry_price: Decimal,
        exit_price: Decimal,
        realized_pnl: Decimal,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO trades \
                 (symbol, side, quantity, entry_price, exit_price, realized_pnl, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    symbol,
                    side.as_str(),
                    decimal_to_sql(quantity),
                    decimal_to_sql(entry_price),
                    decimal_to_sql(exit_price),
                    decimal_to_sql(realized_pnl),
                    ts_to_sql(timestamp),
                ],
            )
        })?;
        Ok(())
    }
}
