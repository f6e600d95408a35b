// =============================================================================
// Store — bot state key/value map, same-bar gates, exit attempts
// =============================================================================
//
// The bot_state table is the authoritative home of every piece of global
// mutable state: circuit breaker, daily counters, last-signal markers, halt
// flags, drawdown state. In-memory copies are never authoritative; every
// read and write goes through here.
// =============================================================================

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;

use crate::types::BrokerHealth;

use super::{decimal_from_sql, decimal_to_sql, ts_from_sql, ts_to_sql, Store, StoreError,
            StoreResult};

/// Mandatory bot_state keys.
pub mod keys {
    pub const CIRCUIT_BREAKER_COUNT: &str = "circuit_breaker_count";
    pub const DAILY_REALIZED_PNL: &str = "daily_realized_pnl";
    pub const DAILY_TRADE_COUNT: &str = "daily_trade_count";
    pub const DAILY_RESET_DATE: &str = "daily_reset_date";
    pub const TRADING_HALTED: &str = "trading_halted";
    pub const BROKER_HEALTH: &str = "broker_health";
    pub const DRAWDOWN_LEVEL: &str = "drawdown_level";
    pub const DRAWDOWN_PEAK_EQUITY: &str = "drawdown_peak_equity";
    pub const DRAWDOWN_LAST_PEAK_RESET: &str = "drawdown_last_peak_reset";
    pub const DRAWDOWN_MANUAL_RECOVERY: &str = "drawdown_manual_recovery_requested";

    pub fn last_signal(symbol: &str, param_tag: &str) -> String {
        format!("last_signal:{symbol}:{param_tag}")
    }
}

impl Store {
    // -------------------------------------------------------------------------
    // Raw key/value access
    // -------------------------------------------------------------------------

    pub fn state_get(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_conn(|c| {
            c.query_row(
                "SELECT value FROM bot_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn state_set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO bot_state (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
        })?;
        Ok(())
    }

    pub fn state_delete(&self, key: &str) -> StoreResult<()> {
        self.with_conn(|c| c.execute("DELETE FROM bot_state WHERE key = ?1", params![key]))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Typed accessors
    // -------------------------------------------------------------------------

    pub fn state_get_u32(&self, key: &str) -> StoreResult<u32> {
        match self.state_get(key)? {
            None => Ok(0),
            Some(v) => v
                .parse::<u32>()
                .map_err(|e| StoreError::Corrupt(format!("bad u32 for {key}: {e}"))),
        }
    }

    pub fn state_set_u32(&self, key: &str, value: u32) -> StoreResult<()> {
        self.state_set(key, &value.to_string())
    }

    pub fn state_get_decimal(&self, key: &str) -> StoreResult<Decimal> {
        match self.state_get(key)? {
            None => Ok(Decimal::ZERO),
            Some(v) => decimal_from_sql(&v),
        }
    }

    pub fn state_set_decimal(&self, key: &str, value: Decimal) -> StoreResult<()> {
        self.state_set(key, &decimal_to_sql(value))
    }

    pub fn state_get_bool(&self, key: &str) -> StoreResult<bool> {
        Ok(matches!(self.state_get(key)?.as_deref(), Some("true")))
    }

    pub fn state_set_bool(&self, key: &str, value: bool) -> StoreResult<()> {
        self.state_set(key, if value { "true" } else { "false" })
    }

    // -------------------------------------------------------------------------
    // Circuit breaker
    // -------------------------------------------------------------------------

    pub fn circuit_breaker_count(&self) -> StoreResult<u32> {
        self.state_get_u32(keys::CIRCUIT_BREAKER_COUNT)
    }

    /// Increment and return the new count.
    pub fn increment_circuit_breaker(&self) -> StoreResult<u32> {
        let next = self.circuit_breaker_count()? + 1;
        self.state_set_u32(keys::CIRCUIT_BREAKER_COUNT, next)?;
        Ok(next)
    }

    pub fn reset_circuit_breaker(&self) -> StoreResult<()> {
        self.state_set_u32(keys::CIRCUIT_BREAKER_COUNT, 0)
    }

    // -------------------------------------------------------------------------
    // Daily counters
    // -------------------------------------------------------------------------

    pub fn daily_realized_pnl(&self) -> StoreResult<Decimal> {
        self.state_get_decimal(keys::DAILY_REALIZED_PNL)
    }

    pub fn add_daily_realized_pnl(&self, delta: Decimal) -> StoreResult<Decimal> {
        let next = self.daily_realized_pnl()? + delta;
        self.state_set_decimal(keys::DAILY_REALIZED_PNL, next)?;
        Ok(next)
    }

    pub fn daily_trade_count(&self) -> StoreResult<u32> {
        self.state_get_u32(keys::DAILY_TRADE_COUNT)
    }

    pub fn increment_daily_trade_count(&self) -> StoreResult<u32> {
        let next = self.daily_trade_count()? + 1;
        self.state_set_u32(keys::DAILY_TRADE_COUNT, next)?;
        Ok(next)
    }

    pub fn daily_reset_date(&self) -> StoreResult<Option<NaiveDate>> {
        match self.state_get(keys::DAILY_RESET_DATE)? {
            None => Ok(None),
            Some(v) => v
                .parse::<NaiveDate>()
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("bad daily_reset_date: {e}"))),
        }
    }

    /// Clear the daily counters and stamp the reset date. The circuit
    /// breaker is deliberately left alone.
    pub fn apply_daily_reset(&self, date: NaiveDate) -> StoreResult<()> {
        self.state_set_decimal(keys::DAILY_REALIZED_PNL, Decimal::ZERO)?;
        self.state_set_u32(keys::DAILY_TRADE_COUNT, 0)?;
        self.state_set(keys::DAILY_RESET_DATE, &date.to_string())
    }

    // -------------------------------------------------------------------------
    // Flags
    // -------------------------------------------------------------------------

    pub fn trading_halted(&self) -> StoreResult<bool> {
        self.state_get_bool(keys::TRADING_HALTED)
    }

    pub fn set_trading_halted(&self, halted: bool) -> StoreResult<()> {
        self.state_set_bool(keys::TRADING_HALTED, halted)
    }

    pub fn broker_health(&self) -> StoreResult<BrokerHealth> {
        match self.state_get(keys::BROKER_HEALTH)? {
            None => Ok(BrokerHealth::Healthy),
            Some(v) => v.parse().map_err(StoreError::Corrupt),
        }
    }

    pub fn set_broker_health(&self, health: BrokerHealth) -> StoreResult<()> {
        self.state_set(keys::BROKER_HEALTH, health.as_str())
    }

    // -------------------------------------------------------------------------
    // Last-signal markers (consecutive duplicate suppression)
    // -------------------------------------------------------------------------

    pub fn last_signal(&self, symbol: &str, param_tag: &str) -> StoreResult<Option<String>> {
        self.state_get(&keys::last_signal(symbol, param_tag))
    }

    pub fn set_last_signal(&self, symbol: &str, param_tag: &str, side: &str) -> StoreResult<()> {
        self.state_set(&keys::last_signal(symbol, param_tag), side)
    }

    // -------------------------------------------------------------------------
    // Same-bar gate
    // -------------------------------------------------------------------------

    /// Atomically try to claim the gate for `(gate_key, bar_ts)`.
    ///
    /// Accepts at most one candidate per bar timestamp and enforces a per-key
    /// wall-clock cooldown between accepted bars. The whole decision runs in
    /// one IMMEDIATE transaction: under concurrent attempts exactly one
    /// caller observes `true`.
    pub fn gate_try_accept(
        &self,
        gate_key: &str,
        bar_ts: DateTime<Utc>,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> StoreResult<bool> {
        self.with_conn_mut(|c| {
            let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let bar_ts_sql = ts_to_sql(bar_ts);
            let already: Option<String> = tx
                .query_row(
                    "SELECT accepted_at_utc FROM gates WHERE gate_key = ?1 AND bar_ts = ?2",
                    params![gate_key, bar_ts_sql],
                    |row| row.get(0),
                )
                .optional()?;
            if already.is_some() {
                return Ok(false);
            }

            let last_accepted: Option<String> = tx
                .query_row(
                    "SELECT MAX(accepted_at_utc) FROM gates WHERE gate_key = ?1",
                    params![gate_key],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            if let Some(last) = last_accepted {
                if let Ok(last_ts) = ts_from_sql(&last) {
                    if now - last_ts < cooldown {
                        return Ok(false);
                    }
                }
            }

            tx.execute(
                "INSERT INTO gates (gate_key, bar_ts, accepted_at_utc) VALUES (?1, ?2, ?3)",
                params![gate_key, bar_ts_sql, ts_to_sql(now)],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    // -------------------------------------------------------------------------
    // Exit attempts (exponential back-off bookkeeping)
    // -------------------------------------------------------------------------

    /// Record a failed exit submission and return the new attempt count.
    pub fn record_exit_attempt(&self, symbol: &str, now: DateTime<Utc>) -> StoreResult<u32> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO exit_attempts (symbol, attempts, last_attempt_at) \
                 VALUES (?1, 1, ?2) \
                 ON CONFLICT(symbol) DO UPDATE \
                 SET attempts = attempts + 1, last_attempt_at = excluded.last_attempt_at",
                params![symbol, ts_to_sql(now)],
            )?;
            c.query_row(
                "SELECT attempts FROM exit_attempts WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
        })
    }

    /// `(attempts, last_attempt_at)` for a symbol, if any attempt is on
    /// record.
    pub fn exit_attempt_state(
        &self,
        symbol: &str,
    ) -> StoreResult<Option<(u32, DateTime<Utc>)>> {
        let row: Option<(u32, String)> = self.with_conn(|c| {
            c.query_row(
                "SELECT attempts, last_attempt_at FROM exit_attempts WHERE symbol = ?1",
                params![symbol],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })?;
        match row {
            None => Ok(None),
            Some((attempts, at)) => Ok(Some((attempts, ts_from_sql(&at)?))),
        }
    }

    pub fn clear_exit_attempts(&self, symbol: &str) -> StoreResult<()> {
        self.with_conn(|c| {
            c.execute("DELETE FROM exit_attempts WHERE symbol = ?1", params![symbol])
        })?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn state_kv_roundtrip_and_overwrite() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.state_get("k").unwrap(), None);
        store.state_set("k", "v1").unwrap();
        store.state_set("k", "v2").unwrap();
        assert_eq!(store.state_get("k").unwrap().as_deref(), Some("v2"));
        store.state_delete("k").unwrap();
        assert_eq!(store.state_get("k").unwrap(), None);
    }

    #[test]
    fn circuit_breaker_counts_and_resets() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.circuit_breaker_count().unwrap(), 0);
        for expected in 1..=5 {
            assert_eq!(store.increment_circuit_breaker().unwrap(), expected);
        }
        store.reset_circuit_breaker().unwrap();
        assert_eq!(store.circuit_breaker_count().unwrap(), 0);
    }

    #[test]
    fn daily_counters_accumulate() {
        let store = Store::open_in_memory().unwrap();
        store.add_daily_realized_pnl(dec!(-120.50)).unwrap();
        store.add_daily_realized_pnl(dec!(30)).unwrap();
        assert_eq!(store.daily_realized_pnl().unwrap(), dec!(-90.50));

        store.increment_daily_trade_count().unwrap();
        store.increment_daily_trade_count().unwrap();
        assert_eq!(store.daily_trade_count().unwrap(), 2);
    }

    #[test]
    fn daily_reset_clears_counters_but_not_breaker() {
        let store = Store::open_in_memory().unwrap();
        store.add_daily_realized_pnl(dec!(-500)).unwrap();
        store.increment_daily_trade_count().unwrap();
        store.increment_circuit_breaker().unwrap();

        let date = "2024-02-21".parse().unwrap();
        store.apply_daily_reset(date).unwrap();

        assert_eq!(store.daily_realized_pnl().unwrap(), Decimal::ZERO);
        assert_eq!(store.daily_trade_count().unwrap(), 0);
        assert_eq!(store.circuit_breaker_count().unwrap(), 1);
        assert_eq!(store.daily_reset_date().unwrap(), Some(date));
    }

    #[test]
    fn gate_accepts_once_per_bar() {
        let store = Store::open_in_memory().unwrap();
        let bar_ts = Utc::now();
        let key = "sma_crossover_multi:AAPL:sma_5_15:buy";

        assert!(store
            .gate_try_accept(key, bar_ts, Utc::now(), Duration::seconds(300))
            .unwrap());
        assert!(!store
            .gate_try_accept(key, bar_ts, Utc::now(), Duration::seconds(300))
            .unwrap());
    }

    #[test]
    fn gate_enforces_cooldown_across_bars() {
        let store = Store::open_in_memory().unwrap();
        let key = "sma_crossover_multi:AAPL:sma_5_15:buy";
        let bar1 = Utc::now();
        let bar2 = bar1 + Duration::seconds(60);
        let now = Utc::now();

        assert!(store
            .gate_try_accept(key, bar1, now, Duration::seconds(300))
            .unwrap());
        // Next bar arrives 60 s later, still inside the 300 s cooldown.
        assert!(!store
            .gate_try_accept(key, bar2, now + Duration::seconds(60), Duration::seconds(300))
            .unwrap());
        // After the cooldown expires the next bar is accepted.
        let bar3 = bar1 + Duration::seconds(600);
        assert!(store
            .gate_try_accept(key, bar3, now + Duration::seconds(600), Duration::seconds(300))
            .unwrap());
    }

    #[test]
    fn gate_accepts_exactly_one_under_concurrency() {
        use std::sync::Arc;

        let store = Arc::new(Store::open_in_memory().unwrap());
        let bar_ts = Utc::now();
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store
                    .gate_try_accept(
                        "sma_crossover_multi:AAPL:sma_5_15:buy",
                        bar_ts,
                        now,
                        Duration::seconds(300),
                    )
                    .unwrap()
            }));
        }
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(accepted, 1, "exactly one concurrent attempt may win the gate");
    }

    #[test]
    fn gate_keys_are_independent() {
        let store = Store::open_in_memory().unwrap();
        let bar_ts = Utc::now();
        let now = Utc::now();
        assert!(store
            .gate_try_accept("a:AAPL:sma_5_15:buy", bar_ts, now, Duration::seconds(300))
            .unwrap());
        assert!(store
            .gate_try_accept("a:MSFT:sma_5_15:buy", bar_ts, now, Duration::seconds(300))
            .unwrap());
    }

    #[test]
    fn exit_attempts_accumulate_and_clear() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.exit_attempt_state("AAPL").unwrap(), None);

        let now = Utc::now();
        assert_eq!(store.record_exit_attempt("AAPL", now).unwrap(), 1);
        assert_eq!(store.record_exit_attempt("AAPL", now).unwrap(), 2);

        let (attempts, _) = store.exit_attempt_state("AAPL").unwrap().unwrap();
        assert_eq!(attempts, 2);

        store.clear_exit_attempts("AAPL").unwrap();
        assert_eq!(store.exit_attempt_state("AAPL").unwrap(), None);
    }

    #[test]
    fn broker_health_defaults_to_healthy() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.broker_health().unwrap(), BrokerHealth::Healthy);
        store.set_broker_health(BrokerHealth::Degraded).unwrap();
        assert_eq!(store.broker_health().unwrap(), BrokerHealth::Degraded);
    }

    #[test]
    fn last_signal_marker() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.last_signal("AAPL", "sma_5_15").unwrap(), None);
        store.set_last_signal("AAPL", "sma_5_15", "buy").unwrap();
        assert_eq!(
            store.last_signal("AAPL", "sma_5_15").unwrap().as_deref(),
            Some("buy")
        );
    }
}
