// =============================================================================
// Risk Manager — three-tier gate protecting capital
// =============================================================================
//
// Tiers, evaluated in order; the first failure wins:
//
//   SAFETY  — hard abort, no state mutation: kill switch, tripped circuit
//             breaker, market closed, halt flag, drawdown Halt/Emergency.
//   RISK    — limit violations: daily loss, trade count, notional cap,
//             concurrent positions. Each one increments the persisted
//             circuit-breaker count and surfaces as an error.
//   FILTERS — soft skips: same-bar gate, low confidence, session-minute
//             windows. No state mutation beyond the gate claim itself.
//
// Exit orders run the SAFETY tier only; they are never throttled by
// confidence or time-of-day.
//
// The broker clock call and the gate transaction are the only suspension
// points inside a check. Everything else is handed in by the caller.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, warn};

use crate::broker::{Broker, MarketClock};
use crate::config::Config;
use crate::drawdown::DrawdownLevel;
use crate::notify::{Alert, Notifier};
use crate::store::Store;
use crate::strategy::Signal;
use crate::types::SessionPolicy;

/// Consecutive-failure threshold that trips the breaker permanently until
/// manual reset.
pub const CIRCUIT_BREAKER_LIMIT: u32 = 5;

/// Minimum signal confidence accepted by the FILTERS tier.
const MIN_CONFIDENCE: f64 = 0.5;

/// Regular session open in the market timezone.
const SESSION_OPEN: NaiveTime = match NaiveTime::from_hms_opt(9, 30, 0) {
    Some(t) => t,
    None => unreachable!(),
};
/// Extended-hours window in the market timezone.
const EXTENDED_OPEN: NaiveTime = match NaiveTime::from_hms_opt(4, 0, 0) {
    Some(t) => t,
    None => unreachable!(),
};
const EXTENDED_CLOSE: NaiveTime = match NaiveTime::from_hms_opt(20, 0, 0) {
    Some(t) => t,
    None => unreachable!(),
};

/// A SAFETY or RISK tier failure.
#[derive(Debug, Error)]
pub enum RiskError {
    /// Hard abort. Does not touch the circuit breaker.
    #[error("safety gate: {0}")]
    Safety(String),
    /// RISK-tier limit violation. The circuit breaker was incremented.
    #[error("risk limit: {0}")]
    Limit(String),
}

/// FILTERS-tier outcome for an approved-or-skipped entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Approved,
    /// Soft skip with the reason; nothing tripped.
    Skipped(String),
}

/// Caller-supplied context for an entry check. Equity and position count
/// come from the order manager so the check itself only suspends on the
/// clock call and the gate transaction.
#[derive(Debug, Clone)]
pub struct EntryContext {
    pub quantity: Decimal,
    pub equity: Decimal,
    /// Open equity positions currently tracked.
    pub open_equity_positions: usize,
}

pub struct RiskManager {
    store: Arc<Store>,
    broker: Arc<dyn Broker>,
    config: Arc<Config>,
    notifier: Arc<dyn Notifier>,
}

impl RiskManager {
    pub fn new(
        store: Arc<Store>,
        broker: Arc<dyn Broker>,
        config: Arc<Config>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            broker,
            config,
            notifier,
        }
    }

    // -------------------------------------------------------------------------
    // Public gates
    // -------------------------------------------------------------------------

    /// Full three-tier check for an entry signal.
    pub async fn check_entry(
        &self,
        signal: &Signal,
        ctx: &EntryContext,
    ) -> Result<GateDecision, RiskError> {
        let clock = self.check_safety().await?;
        self.check_limits(signal, ctx)?;
        self.check_filters(signal, &clock)
    }

    /// SAFETY tier only — exits must never be throttled by filters.
    pub async fn check_exit(&self) -> Result<(), RiskError> {
        self.check_safety().await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // SAFETY tier
    // -------------------------------------------------------------------------

    async fn check_safety(&self) -> Result<MarketClock, RiskError> {
        // 1. Kill switch: config flag, env var, or sentinel file.
        if let Some(source) = self.kill_switch_source() {
            return Err(RiskError::Safety(format!("kill switch active ({source})")));
        }

        // 2. Circuit breaker.
        let breaker = self
            .store
            .circuit_breaker_count()
            .map_err(|e| RiskError::Safety(format!("circuit breaker state unavailable: {e}")))?;
        if breaker >= CIRCUIT_BREAKER_LIMIT {
            return Err(RiskError::Safety(format!(
                "circuit breaker tripped ({breaker} consecutive failures, limit \
                 {CIRCUIT_BREAKER_LIMIT}) — manual reset required"
            )));
        }

        // 3. Market clock, fetched fresh every time.
        let clock = self
            .broker
            .clock()
            .await
            .map_err(|e| RiskError::Safety(format!("market clock unavailable: {e}")))?;
        if !clock.is_open && !self.within_extended_session(clock.fetched_at) {
            return Err(RiskError::Safety("market closed".into()));
        }

        // 4. Halt flag set by the reconciler or drawdown monitor.
        let halted = self
            .store
            .trading_halted()
            .map_err(|e| RiskError::Safety(format!("halt flag unavailable: {e}")))?;
        if halted {
            return Err(RiskError::Safety("trading halted".into()));
        }

        // 5. Drawdown escalation.
        let level = DrawdownLevel::load(&self.store)
            .map_err(|e| RiskError::Safety(format!("drawdown state unavailable: {e}")))?;
        if matches!(level, DrawdownLevel::Halt | DrawdownLevel::Emergency) {
            return Err(RiskError::Safety(format!(
                "drawdown level {level} blocks new positions"
            )));
        }

        Ok(clock)
    }

    fn kill_switch_source(&self) -> Option<&'static str> {
        if self.config.kill_switch {
            return Some("config");
        }
        if matches!(
            std::env::var("MERIDIAN_KILL_SWITCH").ok().as_deref(),
            Some("1") | Some("true")
        ) {
            return Some("env");
        }
        if self.config.data_dir.join("KILL_SWITCH").exists() {
            return Some("sentinel file");
        }
        None
    }

    fn within_extended_session(&self, now: DateTime<Utc>) -> bool {
        if self.config.session.policy != SessionPolicy::IncludeExtended {
            return false;
        }
        let local = now.with_timezone(&self.config.market_tz());
        let weekday = local.weekday().num_days_from_monday() < 5;
        weekday && local.time() >= EXTENDED_OPEN && local.time() < EXTENDED_CLOSE
    }

    // -------------------------------------------------------------------------
    // RISK tier
    // -------------------------------------------------------------------------

    fn check_limits(&self, signal: &Signal, ctx: &EntryContext) -> Result<(), RiskError> {
        // 6. Daily realised loss.
        let daily_pnl = self
            .store
            .daily_realized_pnl()
            .map_err(|e| RiskError::Safety(format!("daily pnl unavailable: {e}")))?;
        if daily_pnl <= -self.config.risk.max_daily_loss {
            let message = format!(
                "daily loss limit reached (pnl {daily_pnl}, limit {})",
                self.config.risk.max_daily_loss
            );
            self.notifier.notify(Alert::DailyLossExceeded {
                message: message.clone(),
            });
            return Err(self.limit(message));
        }

        // 7. Daily trade count.
        let trades = self
            .store
            .daily_trade_count()
            .map_err(|e| RiskError::Safety(format!("trade count unavailable: {e}")))?;
        if trades >= self.config.risk.max_trades_per_day {
            return Err(self.limit(format!(
                "daily trade limit reached ({trades} of {})",
                self.config.risk.max_trades_per_day
            )));
        }

        // 8. Per-trade notional cap.
        let notional = ctx.quantity * signal.metadata.price;
        let cap = ctx.equity * self.config.risk.max_position_pct;
        if notional > cap {
            return Err(self.limit(format!(
                "notional {notional} exceeds {}% of equity ({cap})",
                self.config.risk.max_position_pct * Decimal::from(100)
            )));
        }

        // 9. Concurrent positions (equities only).
        if self.config.symbols.is_equity(&signal.symbol)
            && ctx.open_equity_positions >= self.config.risk.max_concurrent_positions as usize
        {
            return Err(self.limit(format!(
                "concurrent position limit reached ({} of {})",
                ctx.open_equity_positions, self.config.risk.max_concurrent_positions
            )));
        }

        Ok(())
    }

    /// Build a RISK-tier error, incrementing the persisted breaker count.
    fn limit(&self, message: String) -> RiskError {
        match self.store.increment_circuit_breaker() {
            Ok(count) => warn!(count, %message, "risk limit violation"),
            Err(e) => warn!(error = %e, %message, "risk limit violation (breaker update failed)"),
        }
        RiskError::Limit(message)
    }

    // -------------------------------------------------------------------------
    // FILTERS tier
    // -------------------------------------------------------------------------

    fn check_filters(
        &self,
        signal: &Signal,
        clock: &MarketClock,
    ) -> Result<GateDecision, RiskError> {
        // 10. Same-bar gate, claimed atomically.
        let gate_key = format!(
            "{}:{}:{}:{}",
            signal.metadata.strategy,
            signal.symbol,
            signal.metadata.param_tag,
            signal.side
        );
        let accepted = self
            .store
            .gate_try_accept(
                &gate_key,
                signal.signal_timestamp,
                Utc::now(),
                Duration::seconds(self.config.gate.cooldown_seconds as i64),
            )
            .map_err(|e| RiskError::Safety(format!("gate transaction failed: {e}")))?;
        if !accepted {
            debug!(%gate_key, bar_ts = %signal.signal_timestamp, "same-bar gate rejected signal");
            return Ok(GateDecision::Skipped("same-bar gate".into()));
        }

        // 11. Confidence floor.
        if signal.metadata.confidence < MIN_CONFIDENCE {
            return Ok(GateDecision::Skipped(format!(
                "confidence {:.2} below {MIN_CONFIDENCE}",
                signal.metadata.confidence
            )));
        }

        // 12. Session-minute windows, equities only.
        if self.config.symbols.is_equity(&signal.symbol) && clock.is_open {
            let local = clock.fetched_at.with_timezone(&self.config.market_tz());
            let after_open =
                (local.time() - SESSION_OPEN).num_minutes();
            if after_open < self.config.filters.min_minutes_after_open as i64 {
                return Ok(GateDecision::Skipped(format!(
                    "{after_open} minutes after open, need {}",
                    self.config.filters.min_minutes_after_open
                )));
            }
            let before_close = (clock.next_close_utc - clock.fetched_at).num_minutes();
            if before_close < self.config.filters.min_minutes_before_close as i64 {
                return Ok(GateDecision::Skipped(format!(
                    "{before_close} minutes before close, need {}",
                    self.config.filters.min_minutes_before_close
                )));
            }
        }

        Ok(GateDecision::Approved)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    use crate::broker::{
        Account, BrokerError, BrokerOrder, BrokerPosition, BrokerResult, OrderRequest,
    };
    use crate::strategy::{Regime, SignalMetadata};
    use crate::types::Side;

    /// Broker stub with a scriptable clock.
    struct ClockBroker {
        is_open: Mutex<bool>,
        now: Mutex<DateTime<Utc>>,
    }

    impl ClockBroker {
        fn open_at(now: DateTime<Utc>) -> Self {
            Self {
                is_open: Mutex::new(true),
                now: Mutex::new(now),
            }
        }
    }

    #[async_trait]
    impl Broker for ClockBroker {
        async fn clock(&self) -> BrokerResult<MarketClock> {
            let now = *self.now.lock();
            Ok(MarketClock {
                is_open: *self.is_open.lock(),
                next_open_utc: now + Duration::hours(18),
                next_close_utc: now + Duration::hours(4),
                fetched_at: now,
            })
        }
        async fn account(&self) -> BrokerResult<Account> {
            Err(BrokerError::Fatal("not used".into()))
        }
        async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
            Ok(vec![])
        }
        async fn open_orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
            Ok(vec![])
        }
        async fn order_by_id(&self, _id: &str) -> BrokerResult<Option<BrokerOrder>> {
            Ok(None)
        }
        async fn submit_order(&self, _request: &OrderRequest) -> BrokerResult<BrokerOrder> {
            Err(BrokerError::Fatal("not used".into()))
        }
        async fn cancel_order(&self, _id: &str) -> BrokerResult<()> {
            Ok(())
        }
    }

    fn config() -> Arc<Config> {
        let json = r#"{ "symbols": { "equities": ["AAPL"] } }"#;
        let mut cfg: Config = serde_json::from_str(json).unwrap();
        cfg.validate().unwrap();
        Arc::new(cfg)
    }

    /// 11:00 New York on a Wednesday — comfortably inside the session.
    fn midsession_utc() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 21, 16, 0, 0).unwrap()
    }

    fn signal(confidence: f64) -> Signal {
        Signal {
            symbol: "AAPL".into(),
            side: Side::Buy,
            timeframe: "1m".into(),
            signal_timestamp: Utc.with_ymd_and_hms(2024, 2, 21, 15, 30, 0).unwrap(),
            metadata: SignalMetadata {
                strategy: "sma_crossover_multi".into(),
                param_tag: "sma_5_15".into(),
                price: dec!(150),
                regime: Regime::Trending,
                regime_strength: 0.9,
                confidence,
                atr: dec!(2),
            },
        }
    }

    fn ctx() -> EntryContext {
        EntryContext {
            quantity: dec!(33),
            equity: dec!(100000),
            open_equity_positions: 0,
        }
    }

    fn manager(store: Arc<Store>) -> RiskManager {
        RiskManager::new(
            store,
            Arc::new(ClockBroker::open_at(midsession_utc())),
            config(),
            Arc::new(crate::notify::LogNotifier),
        )
    }

    #[tokio::test]
    async fn clean_signal_is_approved() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let risk = manager(store);
        let decision = risk.check_entry(&signal(0.9), &ctx()).await.unwrap();
        assert_eq!(decision, GateDecision::Approved);
    }

    #[tokio::test]
    async fn tripped_breaker_aborts_in_safety() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for _ in 0..CIRCUIT_BREAKER_LIMIT {
            store.increment_circuit_breaker().unwrap();
        }
        let risk = manager(store);
        let err = risk.check_entry(&signal(0.9), &ctx()).await.unwrap_err();
        match err {
            RiskError::Safety(msg) => assert!(msg.contains("circuit breaker"), "{msg}"),
            other => panic!("expected safety abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_market_aborts() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let broker = Arc::new(ClockBroker::open_at(midsession_utc()));
        *broker.is_open.lock() = false;
        let risk = RiskManager::new(store, broker, config(), Arc::new(crate::notify::LogNotifier));
        let err = risk.check_entry(&signal(0.9), &ctx()).await.unwrap_err();
        assert!(matches!(err, RiskError::Safety(ref m) if m.contains("market closed")));
    }

    #[tokio::test]
    async fn halt_flag_aborts() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.set_trading_halted(true).unwrap();
        let risk = manager(store);
        let err = risk.check_entry(&signal(0.9), &ctx()).await.unwrap_err();
        assert!(matches!(err, RiskError::Safety(ref m) if m.contains("halted")));
    }

    #[tokio::test]
    async fn drawdown_halt_aborts() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        DrawdownLevel::Halt.persist(&store).unwrap();
        let risk = manager(store);
        let err = risk.check_entry(&signal(0.9), &ctx()).await.unwrap_err();
        assert!(matches!(err, RiskError::Safety(ref m) if m.contains("drawdown")));
    }

    #[tokio::test]
    async fn daily_loss_violation_increments_breaker() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.add_daily_realized_pnl(dec!(-1000)).unwrap();
        let risk = manager(store.clone());
        let err = risk.check_entry(&signal(0.9), &ctx()).await.unwrap_err();
        assert!(matches!(err, RiskError::Limit(_)));
        assert_eq!(store.circuit_breaker_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn notional_cap_violation() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let risk = manager(store.clone());
        let big = EntryContext {
            quantity: dec!(100),
            equity: dec!(100000),
            open_equity_positions: 0,
        };
        // 100 * 150 = 15 000 > 5% of 100 000.
        let err = risk.check_entry(&signal(0.9), &big).await.unwrap_err();
        assert!(matches!(err, RiskError::Limit(ref m) if m.contains("notional")));
        assert_eq!(store.circuit_breaker_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_position_cap() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let risk = manager(store);
        let full = EntryContext {
            quantity: dec!(1),
            equity: dec!(100000),
            open_equity_positions: 5,
        };
        let err = risk.check_entry(&signal(0.9), &full).await.unwrap_err();
        assert!(matches!(err, RiskError::Limit(ref m) if m.contains("concurrent")));
    }

    #[tokio::test]
    async fn low_confidence_soft_skips() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let risk = manager(store.clone());
        let decision = risk.check_entry(&signal(0.3), &ctx()).await.unwrap();
        assert!(matches!(decision, GateDecision::Skipped(ref m) if m.contains("confidence")));
        // Soft skip never touches the breaker.
        assert_eq!(store.circuit_breaker_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn same_bar_gate_rejects_second_attempt() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let risk = manager(store);
        let s = signal(0.9);
        assert_eq!(
            risk.check_entry(&s, &ctx()).await.unwrap(),
            GateDecision::Approved
        );
        let second = risk.check_entry(&s, &ctx()).await.unwrap();
        assert!(matches!(second, GateDecision::Skipped(ref m) if m.contains("gate")));
    }

    #[tokio::test]
    async fn exit_check_runs_safety_only() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        // Conditions that would fail RISK/FILTERS must not block an exit.
        store.add_daily_realized_pnl(dec!(-99999)).unwrap();
        let risk = manager(store.clone());
        risk.check_exit().await.unwrap();

        // But safety still binds.
        store.set_trading_halted(true).unwrap();
        assert!(risk.check_exit().await.is_err());
    }

    #[tokio::test]
    async fn early_session_minutes_filter_skips() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        // 09:35 New York: only 5 minutes after open.
        let early = Utc.with_ymd_and_hms(2024, 2, 21, 14, 35, 0).unwrap();
        let risk = RiskManager::new(
            store,
            Arc::new(ClockBroker::open_at(early)),
            config(),
            Arc::new(crate::notify::LogNotifier),
        );
        let decision = risk.check_entry(&signal(0.9), &ctx()).await.unwrap();
        assert!(matches!(decision, GateDecision::Skipped(ref m) if m.contains("after open")));
    }

    #[tokio::test]
    async fn near_close_minutes_filter_skips() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        // Clock that reports the close 5 minutes out.
        struct NearCloseBroker(ClockBroker);
        #[async_trait]
        impl Broker for NearCloseBroker {
            async fn clock(&self) -> BrokerResult<MarketClock> {
                let mut clock = self.0.clock().await?;
                clock.next_close_utc = clock.fetched_at + Duration::minutes(5);
                Ok(clock)
            }
            async fn account(&self) -> BrokerResult<Account> {
                self.0.account().await
            }
            async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
                self.0.positions().await
            }
            async fn open_orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
                self.0.open_orders().await
            }
            async fn order_by_id(&self, id: &str) -> BrokerResult<Option<BrokerOrder>> {
                self.0.order_by_id(id).await
            }
            async fn submit_order(&self, r: &OrderRequest) -> BrokerResult<BrokerOrder> {
                self.0.submit_order(r).await
            }
            async fn cancel_order(&self, id: &str) -> BrokerResult<()> {
                self.0.cancel_order(id).await
            }
        }
        let near_close = NearCloseBroker(ClockBroker::open_at(midsession_utc()));
        let risk = RiskManager::new(
            store,
            Arc::new(near_close),
            config(),
            Arc::new(crate::notify::LogNotifier),
        );
        let decision = risk.check_entry(&signal(0.9), &ctx()).await.unwrap();
        assert!(matches!(decision, GateDecision::Skipped(ref m) if m.contains("before close")));
    }
}
