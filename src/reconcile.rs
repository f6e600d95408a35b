// =============================================================================
// Reconciler — startup and runtime state repair
// =============================================================================
//
// Startup (blocking, before any event is accepted):
//   Rule 1. broker terminal / store non-terminal  -> auto-apply broker state
//   Rule 2. store terminal / broker open          -> discrepancy, abort
//   Rule 3. broker open order unknown to store    -> discrepancy, abort
//   Rule 4. position quantity mismatch            -> discrepancy, abort
//   Ghost positions (store-only, no open orders)  -> auto-cleared
//   Clean pass                                    -> snapshot broker positions
//
// A startup discrepancy writes data/reconciliation_error.json and the
// process exits non-zero. Silent auto-adjustment of a quantity mismatch
// could hide a real failure, so the strict rule applies.
//
// Runtime (periodic, advisory): repairs stuck pending-exit flags, warns on
// tracked-vs-broker mismatches, reconciles missed fills through the same
// path order updates take, and records a report row. Three consecutive
// failed cycles (including per-cycle timeouts) degrade broker health and
// halt trading.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, BrokerOrder, BrokerPosition};
use crate::notify::{Alert, Notifier};
use crate::positions::PositionTracker;
use crate::store::{Store, StoreError};
use crate::types::BrokerHealth;

/// Consecutive failed runtime cycles before health degrades.
const DEGRADE_THRESHOLD: u32 = 3;

/// Hard per-cycle budget for the runtime pass.
const CYCLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("startup reconciliation found {} discrepancies", report.discrepancies.len())]
    Discrepancies { report: ReconciliationReport },
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: String,
    pub discrepancies: Vec<Discrepancy>,
    pub auto_applied: u32,
    pub ghosts_cleared: u32,
}

pub struct Reconciler {
    store: Arc<Store>,
    broker: Arc<dyn Broker>,
    tracker: Arc<PositionTracker>,
    notifier: Arc<dyn Notifier>,
    error_report_path: PathBuf,
    runtime_interval_secs: u64,
}

impl Reconciler {
    pub fn new(
        store: Arc<Store>,
        broker: Arc<dyn Broker>,
        tracker: Arc<PositionTracker>,
        notifier: Arc<dyn Notifier>,
        data_dir: PathBuf,
        runtime_interval_secs: u64,
    ) -> Self {
        Self {
            store,
            broker,
            tracker,
            notifier,
            error_report_path: data_dir.join("reconciliation_error.json"),
            runtime_interval_secs,
        }
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Blocking startup pass. On discrepancies the JSON report is written
    /// to disk and the error carries it; the caller exits non-zero.
    pub async fn startup(&self) -> Result<ReconciliationReport, ReconcileError> {
        let started = Instant::now();
        info!("startup reconciliation running");

        let broker_open = self.broker.open_orders().await?;
        let broker_positions = self.broker.positions().await?;
        let open_by_client: HashMap<&str, &BrokerOrder> = broker_open
            .iter()
            .map(|o| (o.client_order_id.as_str(), o))
            .collect();

        let mut discrepancies = Vec::new();
        let mut auto_applied = 0u32;

        // Rules 1 and 2 over the store's non-terminal intents.
        for intent in self.store.open_order_intents()? {
            let Some(broker_id) = intent.broker_order_id.clone() else {
                // Crash between persist and submit: the deterministic id
                // means a replayed signal resumes this intent; nothing to
                // repair against the broker.
                debug!(
                    client_order_id = %intent.client_order_id,
                    "intent never reached the broker — left for replay"
                );
                continue;
            };
            match self.broker.order_by_id(&broker_id).await? {
                Some(order) if order.status.is_terminal() => {
                    // Rule 1: bring the store up to the broker's truth.
                    info!(
                        client_order_id = %intent.client_order_id,
                        status = %order.status,
                        "auto-applying terminal broker state to stored intent"
                    );
                    self.store.apply_order_update(
                        &intent.client_order_id,
                        order.status,
                        order.filled_quantity,
                        order.average_fill_price,
                        Utc::now(),
                    )?;
                    auto_applied += 1;
                }
                Some(_) => {} // both sides open — consistent
                None => {
                    discrepancies.push(Discrepancy {
                        kind: "order_unknown_to_broker".into(),
                        client_order_id: Some(intent.client_order_id.clone()),
                        symbol: Some(intent.symbol.clone()),
                        detail: format!(
                            "store has open intent {} but the broker does not know order {}",
                            intent.client_order_id, broker_id
                        ),
                    });
                }
            }
        }

        // Rules 2 and 3 over the broker's open orders.
        for order in &broker_open {
            match self.store.get_order_intent(&order.client_order_id)? {
                Some(intent) if intent.status.is_terminal() => {
                    discrepancies.push(Discrepancy {
                        kind: "store_terminal_broker_open".into(),
                        client_order_id: Some(order.client_order_id.clone()),
                        symbol: Some(order.symbol.clone()),
                        detail: format!(
                            "store says {} is {}, broker still shows it open",
                            order.client_order_id, intent.status
                        ),
                    });
                }
                Some(_) => {}
                None => {
                    discrepancies.push(Discrepancy {
                        kind: "broker_order_unknown_to_store".into(),
                        client_order_id: Some(order.client_order_id.clone()),
                        symbol: Some(order.symbol.clone()),
                        detail: format!(
                            "broker has open order {} ({}) with no stored intent",
                            order.broker_order_id, order.symbol
                        ),
                    });
                }
            }
        }

        // Rule 4: position quantities, both directions.
        let broker_by_symbol: HashMap<&str, &BrokerPosition> = broker_positions
            .iter()
            .map(|p| (p.symbol.as_str(), p))
            .collect();
        let mut ghosts = Vec::new();
        for tracked in self.tracker.snapshot() {
            match broker_by_symbol.get(tracked.symbol.as_str()) {
                Some(broker_pos) if broker_pos.quantity != tracked.quantity => {
                    discrepancies.push(Discrepancy {
                        kind: "position_quantity_mismatch".into(),
                        client_order_id: None,
                        symbol: Some(tracked.symbol.clone()),
                        detail: format!(
                            "store tracks {} shares of {}, broker reports {}",
                            tracked.quantity, tracked.symbol, broker_pos.quantity
                        ),
                    });
                }
                Some(_) => {}
                None => {
                    let has_open_order =
                        broker_open.iter().any(|o| o.symbol == tracked.symbol);
                    if has_open_order {
                        // An in-flight order explains the gap; leave it to
                        // the fill path.
                        debug!(symbol = %tracked.symbol, "store position awaiting open order");
                    } else {
                        ghosts.push(tracked.symbol.clone());
                    }
                }
            }
        }
        for position in &broker_positions {
            if self.tracker.get(&position.symbol).is_none() {
                discrepancies.push(Discrepancy {
                    kind: "position_quantity_mismatch".into(),
                    client_order_id: None,
                    symbol: Some(position.symbol.clone()),
                    detail: format!(
                        "broker holds {} shares of {} that the store does not track",
                        position.quantity, position.symbol
                    ),
                });
            }
        }

        // Ghost-position removal is a repair, not a discrepancy.
        let mut ghosts_cleared = 0u32;
        for symbol in ghosts {
            warn!(%symbol, "ghost position cleared (store-only, no open orders)");
            self.tracker
                .remove(&symbol)
                .map_err(|e| StoreError::Corrupt(format!("ghost removal failed: {e}")))?;
            self.notifier
                .notify(Alert::GhostPositionDetected { symbol });
            ghosts_cleared += 1;
        }

        let report = ReconciliationReport {
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            status: if discrepancies.is_empty() {
                "clean".into()
            } else {
                "discrepancies".into()
            },
            discrepancies,
            auto_applied,
            ghosts_cleared,
        };
        self.persist_report(&report)?;

        if !report.discrepancies.is_empty() {
            self.write_error_report(&report);
            self.notifier.notify(Alert::ReconciliationFailed {
                message: format!(
                    "{} discrepancies at startup",
                    report.discrepancies.len()
                ),
            });
            return Err(ReconcileError::Discrepancies { report });
        }

        // Clean pass: snapshot the broker's positions.
        let snapshot: Vec<(String, Decimal, Decimal)> = broker_positions
            .iter()
            .map(|p| (p.symbol.clone(), p.quantity, p.average_entry_price))
            .collect();
        self.store.replace_positions_snapshot(&snapshot, Utc::now())?;

        info!(
            duration_ms = report.duration_ms,
            auto_applied = report.auto_applied,
            ghosts_cleared = report.ghosts_cleared,
            "startup reconciliation clean"
        );
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Runtime
    // -------------------------------------------------------------------------

    /// Periodic advisory loop; spawned once at engine startup.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.runtime_interval_secs,
            "runtime reconciliation started"
        );
        let mut ticker = interval(Duration::from_secs(self.runtime_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("runtime reconciliation stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let outcome = timeout(CYCLE_TIMEOUT, self.runtime_cycle()).await;
            match outcome {
                Ok(Ok(())) => {
                    consecutive_failures = 0;
                }
                Ok(Err(e)) => {
                    consecutive_failures += 1;
                    warn!(error = %e, consecutive_failures, "runtime reconcile cycle failed");
                }
                Err(_) => {
                    consecutive_failures += 1;
                    warn!(consecutive_failures, "runtime reconcile cycle timed out");
                }
            }

            if consecutive_failures >= DEGRADE_THRESHOLD {
                self.degrade();
            }
        }
    }

    /// One advisory pass. Public for tests.
    pub async fn runtime_cycle(&self) -> anyhow::Result<()> {
        let started = Instant::now();
        let broker_open = self.broker.open_orders().await?;
        let broker_positions = self.broker.positions().await?;
        let broker_by_symbol: HashMap<&str, &BrokerPosition> = broker_positions
            .iter()
            .map(|p| (p.symbol.as_str(), p))
            .collect();

        // Stuck exits: pending flag with neither a working exit order nor
        // the underlying position at the broker.
        let mut repaired = 0u32;
        for tracked in self.tracker.snapshot() {
            if !tracked.pending_exit {
                continue;
            }
            let order_alive = tracked.pending_exit_order.as_deref().is_some_and(|id| {
                broker_open.iter().any(|o| o.client_order_id == id)
            });
            let position_alive = broker_by_symbol.contains_key(tracked.symbol.as_str());
            if !order_alive && !position_alive {
                warn!(
                    symbol = %tracked.symbol,
                    "stuck pending-exit flag cleared (no exit order, no position)"
                );
                self.tracker.clear_pending_exit(&tracked.symbol)?;
                repaired += 1;
            }
        }

        // Advisory position comparison.
        let mut mismatches = 0u32;
        for tracked in self.tracker.snapshot() {
            let broker_qty = broker_by_symbol
                .get(tracked.symbol.as_str())
                .map(|p| p.quantity)
                .unwrap_or(Decimal::ZERO);
            if broker_qty != tracked.quantity {
                warn!(
                    symbol = %tracked.symbol,
                    tracked = %tracked.quantity,
                    broker = %broker_qty,
                    "tracked position differs from broker"
                );
                mismatches += 1;
            }
        }

        // Fill reconciliation through the regular order-update path.
        for intent in self.store.open_order_intents()? {
            let Some(broker_id) = intent.broker_order_id.clone() else {
                continue;
            };
            if let Some(order) = self.broker.order_by_id(&broker_id).await? {
                if order.filled_quantity != intent.filled_quantity
                    || order.status != intent.status
                {
                    debug!(
                        client_order_id = %intent.client_order_id,
                        filled = %order.filled_quantity,
                        "fill reconciliation applying broker state"
                    );
                    self.tracker.on_order_update(&order)?;
                }
            }
        }

        let report = ReconciliationReport {
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            status: "runtime".into(),
            discrepancies: Vec::new(),
            auto_applied: repaired,
            ghosts_cleared: 0,
        };
        self.persist_report(&report)?;

        debug!(
            duration_ms = report.duration_ms,
            repaired, mismatches, "runtime reconcile cycle complete"
        );
        Ok(())
    }

    fn degrade(&self) {
        error!("runtime reconciliation failing repeatedly — degrading broker health");
        if let Err(e) = self.store.set_broker_health(BrokerHealth::Degraded) {
            error!(error = %e, "failed to persist broker health");
        }
        if let Err(e) = self.store.set_trading_halted(true) {
            error!(error = %e, "failed to persist halt flag");
        }
        self.notifier.notify(Alert::ReconciliationFailed {
            message: "three consecutive runtime reconcile failures".into(),
        });
    }

    // -------------------------------------------------------------------------
    // Reports
    // -------------------------------------------------------------------------

    fn persist_report(&self, report: &ReconciliationReport) -> Result<(), StoreError> {
        let json = serde_json::to_string(report)
            .map_err(|e| StoreError::Corrupt(format!("report serialisation failed: {e}")))?;
        self.store.insert_reconciliation_report(
            report.timestamp,
            &report.status,
            report.duration_ms,
            &json,
        )
    }

    /// Best-effort atomic write of the fatal startup report.
    fn write_error_report(&self, report: &ReconciliationReport) {
        let Ok(json) = serde_json::to_string_pretty(report) else {
            error!("could not serialise reconciliation error report");
            return;
        };
        if let Some(parent) = self.error_report_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = self.error_report_path.with_extension("json.tmp");
        let result = std::fs::write(&tmp, &json)
            .and_then(|()| std::fs::rename(&tmp, &self.error_report_path));
        match result {
            Ok(()) => error!(
                path = %self.error_report_path.display(),
                "reconciliation error report written"
            ),
            Err(e) => error!(error = %e, "failed to write reconciliation error report"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    use crate::broker::{Account, BrokerResult, MarketClock, OrderRequest};
    use crate::positions::TrackedPosition;
    use crate::types::{OrderIntent, OrderStatus, Side};

    #[derive(Default)]
    struct FakeBroker {
        open_orders: Mutex<Vec<BrokerOrder>>,
        orders_by_id: Mutex<HashMap<String, BrokerOrder>>,
        positions: Mutex<Vec<BrokerPosition>>,
    }

    #[async_trait]
    impl Broker for FakeBroker {
        async fn clock(&self) -> BrokerResult<MarketClock> {
            let now = Utc::now();
            Ok(MarketClock {
                is_open: true,
                next_open_utc: now,
                next_close_utc: now,
                fetched_at: now,
            })
        }
        async fn account(&self) -> BrokerResult<Account> {
            Ok(Account {
                cash_available: dec!(100000),
                portfolio_value: dec!(100000),
                day_trade_count: 0,
                is_tradable: true,
                is_account_restricted: false,
            })
        }
        async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
            Ok(self.positions.lock().clone())
        }
        async fn open_orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
            Ok(self.open_orders.lock().clone())
        }
        async fn order_by_id(&self, id: &str) -> BrokerResult<Option<BrokerOrder>> {
            Ok(self.orders_by_id.lock().get(id).cloned())
        }
        async fn submit_order(&self, _r: &OrderRequest) -> BrokerResult<BrokerOrder> {
            unimplemented!("reconciler never submits")
        }
        async fn cancel_order(&self, _id: &str) -> BrokerResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<Store>,
        broker: Arc<FakeBroker>,
        tracker: Arc<PositionTracker>,
        reconciler: Reconciler,
        data_dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let broker = Arc::new(FakeBroker::default());
        let tracker = Arc::new(PositionTracker::new(store.clone(), dec!(2)));
        let data_dir = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(
            store.clone(),
            broker.clone(),
            tracker.clone(),
            Arc::new(crate::notify::LogNotifier),
            data_dir.path().to_path_buf(),
            120,
        );
        Fixture {
            store,
            broker,
            tracker,
            reconciler,
            data_dir,
        }
    }

    fn intent(id: &str, status: OrderStatus, broker_id: Option<&str>) -> OrderIntent {
        OrderIntent {
            client_order_id: id.to_string(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            quantity: dec!(100),
            limit_price: Decimal::ZERO,
            status,
            broker_order_id: broker_id.map(String::from),
            filled_quantity: Decimal::ZERO,
            average_fill_price: Decimal::ZERO,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn broker_order(
        broker_id: &str,
        client_id: &str,
        symbol: &str,
        status: OrderStatus,
        filled: Decimal,
        price: Decimal,
    ) -> BrokerOrder {
        BrokerOrder {
            broker_order_id: broker_id.to_string(),
            client_order_id: client_id.to_string(),
            symbol: symbol.to_string(),
            side: Side::Buy,
            quantity: dec!(100),
            filled_quantity: filled,
            average_fill_price: price,
            status,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn tracked(symbol: &str, qty: Decimal) -> TrackedPosition {
        TrackedPosition {
            symbol: symbol.to_string(),
            quantity: qty,
            entry_price: dec!(150),
            atr_value: dec!(2),
            trailing_stop_price: dec!(146),
            pending_exit: false,
            pending_exit_order: None,
            opened_at: Utc::now(),
        }
    }

    fn seed_tracked(f: &Fixture, pos: &TrackedPosition) {
        f.store.upsert_position(pos).unwrap();
        f.tracker.rehydrate().unwrap();
    }

    fn seed_broker_position(f: &Fixture, symbol: &str, qty: Decimal) {
        f.broker.positions.lock().push(BrokerPosition {
            symbol: symbol.to_string(),
            quantity: qty,
            average_entry_price: dec!(150),
            current_price: dec!(151),
            unrealized_pnl: dec!(100),
        });
    }

    #[tokio::test]
    async fn clean_pass_snapshots_positions() {
        let f = fixture();
        seed_tracked(&f, &tracked("AAPL", dec!(100)));
        seed_broker_position(&f, "AAPL", dec!(100));

        let report = f.reconciler.startup().await.unwrap();
        assert_eq!(report.status, "clean");
        assert!(report.discrepancies.is_empty());
    }

    #[tokio::test]
    async fn rule1_auto_applies_terminal_broker_state() {
        let f = fixture();
        f.store
            .insert_order_intent(&intent("1111111111111111", OrderStatus::Accepted, Some("b-1")))
            .unwrap();
        f.broker.orders_by_id.lock().insert(
            "b-1".into(),
            broker_order("b-1", "1111111111111111", "AAPL", OrderStatus::Canceled,
                         Decimal::ZERO, Decimal::ZERO),
        );

        let report = f.reconciler.startup().await.unwrap();
        assert_eq!(report.auto_applied, 1);
        let stored = f.store.get_order_intent("1111111111111111").unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn rule2_store_terminal_broker_open_aborts() {
        let f = fixture();
        f.store
            .insert_order_intent(&intent("1111111111111111", OrderStatus::Canceled, Some("b-1")))
            .unwrap();
        f.broker.open_orders.lock().push(broker_order(
            "b-1",
            "1111111111111111",
            "AAPL",
            OrderStatus::Accepted,
            Decimal::ZERO,
            Decimal::ZERO,
        ));

        let err = f.reconciler.startup().await.unwrap_err();
        match err {
            ReconcileError::Discrepancies { report } => {
                assert_eq!(report.discrepancies.len(), 1);
                assert_eq!(report.discrepancies[0].kind, "store_terminal_broker_open");
            }
            other => panic!("expected discrepancies, got {other:?}"),
        }
        assert!(f.data_dir.path().join("reconciliation_error.json").exists());
    }

    #[tokio::test]
    async fn rule3_unknown_broker_order_aborts() {
        let f = fixture();
        f.broker.open_orders.lock().push(broker_order(
            "b-9",
            "ffffffffffffffff",
            "AAPL",
            OrderStatus::Accepted,
            Decimal::ZERO,
            Decimal::ZERO,
        ));

        let err = f.reconciler.startup().await.unwrap_err();
        match err {
            ReconcileError::Discrepancies { report } => {
                assert_eq!(
                    report.discrepancies[0].kind,
                    "broker_order_unknown_to_store"
                );
            }
            other => panic!("expected discrepancies, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rule4_quantity_mismatch_aborts() {
        let f = fixture();
        seed_tracked(&f, &tracked("AAPL", dec!(100)));
        seed_broker_position(&f, "AAPL", dec!(60));

        let err = f.reconciler.startup().await.unwrap_err();
        match err {
            ReconcileError::Discrepancies { report } => {
                assert_eq!(report.discrepancies[0].kind, "position_quantity_mismatch");
            }
            other => panic!("expected discrepancies, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ghost_position_is_cleared_and_pass_succeeds() {
        let f = fixture();
        seed_tracked(&f, &tracked("XYZ", dec!(50)));
        // Broker: no position, no open orders for XYZ.

        let report = f.reconciler.startup().await.unwrap();
        assert_eq!(report.ghosts_cleared, 1);
        assert!(f.tracker.get("XYZ").is_none());
        assert!(f.store.load_tracked_positions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_position_with_open_order_is_not_a_ghost() {
        let f = fixture();
        seed_tracked(&f, &tracked("XYZ", dec!(50)));
        f.store
            .insert_order_intent(&intent("1111111111111111", OrderStatus::Accepted, Some("b-1")))
            .unwrap();
        let mut order = broker_order(
            "b-1",
            "1111111111111111",
            "XYZ",
            OrderStatus::Accepted,
            Decimal::ZERO,
            Decimal::ZERO,
        );
        order.symbol = "XYZ".into();
        f.broker.open_orders.lock().push(order.clone());
        f.broker.orders_by_id.lock().insert("b-1".into(), order);

        let report = f.reconciler.startup().await.unwrap();
        assert_eq!(report.ghosts_cleared, 0);
        assert!(f.tracker.get("XYZ").is_some());
    }

    #[tokio::test]
    async fn runtime_clears_stuck_pending_exit() {
        let f = fixture();
        let mut pos = tracked("AAPL", dec!(100));
        pos.pending_exit = true;
        pos.pending_exit_order = Some("eeeeeeeeeeeeeeee".into());
        seed_tracked(&f, &pos);
        // Broker has neither the exit order nor the position.

        f.reconciler.runtime_cycle().await.unwrap();
        let repaired = f.tracker.get("AAPL").unwrap();
        assert!(!repaired.pending_exit);
    }

    #[tokio::test]
    async fn runtime_keeps_pending_exit_while_order_lives() {
        let f = fixture();
        let mut pos = tracked("AAPL", dec!(100));
        pos.pending_exit = true;
        pos.pending_exit_order = Some("eeeeeeeeeeeeeeee".into());
        seed_tracked(&f, &pos);
        seed_broker_position(&f, "AAPL", dec!(100));
        f.broker.open_orders.lock().push(broker_order(
            "b-e",
            "eeeeeeeeeeeeeeee",
            "AAPL",
            OrderStatus::Accepted,
            Decimal::ZERO,
            Decimal::ZERO,
        ));

        f.reconciler.runtime_cycle().await.unwrap();
        assert!(f.tracker.get("AAPL").unwrap().pending_exit);
    }

    #[tokio::test]
    async fn runtime_reconciles_missed_fills() {
        let f = fixture();
        f.store
            .insert_order_intent(&intent("1111111111111111", OrderStatus::Accepted, Some("b-1")))
            .unwrap();
        f.tracker.note_entry_atr("1111111111111111", dec!(2));
        f.broker.orders_by_id.lock().insert(
            "b-1".into(),
            broker_order("b-1", "1111111111111111", "AAPL", OrderStatus::Filled,
                         dec!(100), dec!(150)),
        );
        seed_broker_position(&f, "AAPL", dec!(100));

        f.reconciler.runtime_cycle().await.unwrap();

        // The missed fill opened the position and recorded the fill row.
        assert_eq!(f.tracker.get("AAPL").unwrap().quantity, dec!(100));
        assert_eq!(f.store.signed_fill_quantity("AAPL").unwrap(), dec!(100));
        let stored = f.store.get_order_intent("1111111111111111").unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn degrade_sets_health_and_halt() {
        let f = fixture();
        f.reconciler.degrade();
        assert_eq!(f.store.broker_health().unwrap(), BrokerHealth::Degraded);
        assert!(f.store.trading_halted().unwrap());
    }
}
