// =============================================================================
// Store — bars, position tracking, equity curve, snapshots, reports
// =============================================================================

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use rust_decimal::Decimal;

use crate::data::Bar;
use crate::positions::TrackedPosition;

use super::{decimal_from_sql, decimal_to_sql, ts_from_sql, ts_to_sql, Store, StoreError,
            StoreResult};

fn corrupt<T>(result: Result<T, StoreError>) -> rusqlite::Result<T> {
    result.map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}

fn bar_from_row(row: &Row<'_>) -> rusqlite::Result<Bar> {
    let timestamp: String = row.get(2)?;
    let open: String = row.get(3)?;
    let high: String = row.get(4)?;
    let low: String = row.get(5)?;
    let close: String = row.get(6)?;
    let volume: String = row.get(7)?;
    Ok(Bar {
        symbol: row.get(0)?,
        timeframe: row.get(1)?,
        timestamp: corrupt(ts_from_sql(&timestamp))?,
        open: corrupt(decimal_from_sql(&open))?,
        high: corrupt(decimal_from_sql(&high))?,
        low: corrupt(decimal_from_sql(&low))?,
        close: corrupt(decimal_from_sql(&close))?,
        volume: corrupt(decimal_from_sql(&volume))?,
    })
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<TrackedPosition> {
    let quantity: String = row.get(1)?;
    let entry_price: String = row.get(2)?;
    let atr_value: String = row.get(3)?;
    let trailing: String = row.get(4)?;
    let opened_at: String = row.get(7)?;
    Ok(TrackedPosition {
        symbol: row.get(0)?,
        quantity: corrupt(decimal_from_sql(&quantity))?,
        entry_price: corrupt(decimal_from_sql(&entry_price))?,
        atr_value: corrupt(decimal_from_sql(&atr_value))?,
        trailing_stop_price: corrupt(decimal_from_sql(&trailing))?,
        pending_exit: row.get::<_, i64>(5)? != 0,
        pending_exit_order: row.get(6)?,
        opened_at: corrupt(ts_from_sql(&opened_at))?,
    })
}

impl Store {
    // -------------------------------------------------------------------------
    // Bars
    // -------------------------------------------------------------------------

    /// Idempotent insert keyed by (symbol, timeframe, timestamp). Returns
    /// `false` for a duplicate.
    pub fn insert_bar(&self, bar: &Bar) -> StoreResult<bool> {
        let inserted = self.with_conn(|c| {
            c.execute(
                "INSERT OR IGNORE INTO bars \
                 (symbol, timeframe, timestamp, open, high, low, close, volume) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    bar.symbol,
                    bar.timeframe,
                    ts_to_sql(bar.timestamp),
                    decimal_to_sql(bar.open),
                    decimal_to_sql(bar.high),
                    decimal_to_sql(bar.low),
                    decimal_to_sql(bar.close),
                    decimal_to_sql(bar.volume),
                ],
            )
        })?;
        Ok(inserted == 1)
    }

    /// Most recent `limit` bars for (symbol, timeframe), oldest first.
    pub fn recent_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> StoreResult<Vec<Bar>> {
        let mut bars = self.with_conn(|c| {
            let mut stmt = c.prepare_cached(
                "SELECT symbol, timeframe, timestamp, open, high, low, close, volume \
                 FROM bars WHERE symbol = ?1 AND timeframe = ?2 \
                 ORDER BY timestamp DESC LIMIT ?3",
            )?;
            let mapped = stmt.query_map(params![symbol, timeframe, limit as i64], bar_from_row)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        bars.reverse();
        Ok(bars)
    }

    // -------------------------------------------------------------------------
    // Position tracking
    // -------------------------------------------------------------------------

    pub fn upsert_position(&self, position: &TrackedPosition) -> StoreResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO position_tracking \
                 (symbol, quantity, entry_price, atr_value, trailing_stop_price, pending_exit, \
                  pending_exit_order, opened_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(symbol) DO UPDATE SET \
                   quantity = excluded.quantity, \
                   entry_price = excluded.entry_price, \
                   atr_value = excluded.atr_value, \
                   trailing_stop_price = excluded.trailing_stop_price, \
                   pending_exit = excluded.pending_exit, \
                   pending_exit_order = excluded.pending_exit_order, \
                   opened_at = excluded.opened_at",
                params![
                    position.symbol,
                    decimal_to_sql(position.quantity),
                    decimal_to_sql(position.entry_price),
                    decimal_to_sql(position.atr_value),
                    decimal_to_sql(position.trailing_stop_price),
                    position.pending_exit as i64,
                    position.pending_exit_order,
                    ts_to_sql(position.opened_at),
                ],
            )
        })?;
        Ok(())
    }

    pub fn delete_position(&self, symbol: &str) -> StoreResult<()> {
        self.with_conn(|c| {
            c.execute(
                "DELETE FROM position_tracking WHERE symbol = ?1",
                params![symbol],
            )
        })?;
        Ok(())
    }

    /// Open tracked positions (quantity > 0 is enforced at write time; rows
    /// reaching zero are deleted). Used for startup rehydration.
    pub fn load_tracked_positions(&self) -> StoreResult<Vec<TrackedPosition>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare_cached(
                "SELECT symbol, quantity, entry_price, atr_value, trailing_stop_price, \
                        pending_exit, pending_exit_order, opened_at \
                 FROM position_tracking ORDER BY symbol ASC",
            )?;
            let mapped = stmt.query_map([], position_from_row)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    // -------------------------------------------------------------------------
    // Equity curve
    // -------------------------------------------------------------------------

    /// Idempotent by timestamp: a snapshot retried for the same instant is
    /// recorded once. Returns `false` for the duplicate.
    pub fn insert_equity_snapshot(
        &self,
        timestamp: DateTime<Utc>,
        portfolio_value: Decimal,
        cash: Decimal,
        daily_pnl: Decimal,
    ) -> StoreResult<bool> {
        let inserted = self.with_conn(|c| {
            c.execute(
                "INSERT OR IGNORE INTO equity_curve (timestamp, portfolio_value, cash, daily_pnl) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    ts_to_sql(timestamp),
                    decimal_to_sql(portfolio_value),
                    decimal_to_sql(cash),
                    decimal_to_sql(daily_pnl),
                ],
            )
        })?;
        Ok(inserted == 1)
    }

    pub fn equity_snapshot_count(&self) -> StoreResult<u64> {
        self.with_conn(|c| {
            c.query_row("SELECT COUNT(*) FROM equity_curve", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .map(|n| n as u64)
    }

    // -------------------------------------------------------------------------
    // Broker position snapshot (taken after a clean startup reconcile)
    // -------------------------------------------------------------------------

    pub fn replace_positions_snapshot(
        &self,
        positions: &[(String, Decimal, Decimal)],
        taken_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with_conn_mut(|c| {
            let tx = c.transaction()?;
            tx.execute("DELETE FROM positions_snapshot", [])?;
            for (symbol, quantity, avg_entry) in positions {
                tx.execute(
                    "INSERT INTO positions_snapshot \
                     (symbol, quantity, average_entry_price, taken_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        symbol,
                        decimal_to_sql(*quantity),
                        decimal_to_sql(*avg_entry),
                        ts_to_sql(taken_at),
                    ],
                )?;
            }
            tx.commit()
        })?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reconciliation reports
    // -------------------------------------------------------------------------

    pub fn insert_reconciliation_report(
        &self,
        timestamp: DateTime<Utc>,
        status: &str,
        duration_ms: u64,
        report_json: &str,
    ) -> StoreResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO reconciliation_reports (timestamp, status, duration_ms, report) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![ts_to_sql(timestamp), status, duration_ms as i64, report_json],
            )
        })?;
        Ok(())
    }
}
