// =============================================================================
// Embedded Store — SQLite-backed transactional persistence
// =============================================================================
//
// Single source of truth for everything the engine must not lose across a
// crash: order intents, fills, trades, bars, equity snapshots, bot state,
// same-bar gates, exit attempts, position tracking, reconciliation reports.
//
// Concurrency: one connection behind a parking_lot::Mutex. WAL journal mode.
// Gate acceptance runs inside a single IMMEDIATE transaction so that two
// concurrent candidates for the same (gateKey, barTs) can never both win.
//
// Idempotent inserts use INSERT OR IGNORE: a unique-constraint duplicate is
// reported as "not inserted", never as an error.
// =============================================================================

mod orders;
mod state;
mod tracking;

pub use state::keys;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::info;

/// Store failure. Unique-constraint violations on idempotent inserts are
/// swallowed before this type is ever constructed; anything surfacing here
/// is a real fault.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS order_intents (
    client_order_id    TEXT PRIMARY KEY,
    symbol             TEXT NOT NULL,
    side               TEXT NOT NULL,
    quantity           TEXT NOT NULL,
    limit_price        TEXT NOT NULL,
    status             TEXT NOT NULL,
    broker_order_id    TEXT,
    filled_quantity    TEXT NOT NULL DEFAULT '0',
    average_fill_price TEXT NOT NULL DEFAULT '0',
    last_error         TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_order_intents_status ON order_intents(status);
CREATE INDEX IF NOT EXISTS idx_order_intents_symbol ON order_intents(symbol);

CREATE TABLE IF NOT EXISTS fills (
    dedupe_key          TEXT PRIMARY KEY,
    broker_order_id     TEXT NOT NULL,
    client_order_id     TEXT NOT NULL,
    symbol              TEXT NOT NULL,
    side                TEXT NOT NULL,
    quantity            TEXT NOT NULL,
    cumulative_quantity TEXT NOT NULL,
    price               TEXT NOT NULL,
    timestamp           TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS trades (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol      TEXT NOT NULL,
    side        TEXT NOT NULL,
    quantity    TEXT NOT NULL,
    entry_price TEXT NOT NULL,
    exit_price  TEXT NOT NULL,
    realized_pnl TEXT NOT NULL,
    timestamp   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_symbol_ts ON trades(symbol, timestamp);

CREATE TABLE IF NOT EXISTS bars (
    symbol    TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    open      TEXT NOT NULL,
    high      TEXT NOT NULL,
    low       TEXT NOT NULL,
    close     TEXT NOT NULL,
    volume    TEXT NOT NULL,
    PRIMARY KEY (symbol, timeframe, timestamp)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_bars_symbol_ts ON bars(symbol, timestamp);

CREATE TABLE IF NOT EXISTS equity_curve (
    timestamp       TEXT PRIMARY KEY,
    portfolio_value TEXT NOT NULL,
    cash            TEXT NOT NULL,
    daily_pnl       TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_equity_curve_ts ON equity_curve(timestamp);

CREATE TABLE IF NOT EXISTS positions_snapshot (
    symbol              TEXT PRIMARY KEY,
    quantity            TEXT NOT NULL,
    average_entry_price TEXT NOT NULL,
    taken_at            TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS position_tracking (
    symbol              TEXT PRIMARY KEY,
    quantity            TEXT NOT NULL,
    entry_price         TEXT NOT NULL,
    atr_value           TEXT NOT NULL,
    trailing_stop_price TEXT NOT NULL,
    pending_exit        INTEGER NOT NULL DEFAULT 0,
    pending_exit_order  TEXT,
    opened_at           TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS bot_state (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS gates (
    gate_key        TEXT NOT NULL,
    bar_ts          TEXT NOT NULL,
    accepted_at_utc TEXT NOT NULL,
    PRIMARY KEY (gate_key, bar_ts)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS reconciliation_reports (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    status    TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    report    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS exit_attempts (
    symbol          TEXT PRIMARY KEY,
    attempts        INTEGER NOT NULL,
    last_attempt_at TEXT NOT NULL
) WITHOUT ROWID;
"#;

/// Embedded transactional store. Cheap to clone via `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if absent) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            // Creating data/ lazily keeps first-run setup to a single step.
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(StoreError::from)
    }

    pub(crate) fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.lock();
        f(&mut conn).map_err(StoreError::from)
    }
}

// -----------------------------------------------------------------------------
// Row codec helpers shared by the submodules
// -----------------------------------------------------------------------------

pub(crate) fn decimal_to_sql(value: Decimal) -> String {
    value.to_string()
}

pub(crate) fn decimal_from_sql(text: &str) -> StoreResult<Decimal> {
    Decimal::from_str(text)
        .map_err(|e| StoreError::Corrupt(format!("bad decimal {text:?}: {e}")))
}

pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn ts_from_sql(text: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {text:?}: {e}")))
}
