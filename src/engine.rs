// =============================================================================
// Engine — component wiring, event routing, task lifecycle
// =============================================================================
//
// Startup sequence:
//   1. rehydrate the position tracker from the store
//   2. honour a pending manual drawdown recovery
//   3. blocking startup reconciliation (discrepancies abort the process)
//   4. preload bar histories
//   5. spawn the background tasks (pollers, exit scan, runtime reconcile,
//      drawdown monitor, housekeeping loops)
//   6. run the event dispatcher until the root cancellation token fires
//   7. join the tasks, then run the graceful-shutdown hook
//
// The dispatcher owns all routing: bars feed the tracker and the strategy,
// signals feed the order manager, exit signals feed the exit-submission
// path, order updates feed the position tracker. Components never hold
// each other directly across these edges.
// =============================================================================

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::bus::{self, Event, EventBus, EventReceiver};
use crate::config::Config;
use crate::data::{poller, DataHandler, MarketDataSource};
use crate::drawdown::DrawdownMonitor;
use crate::exits::ExitManager;
use crate::housekeeping::{self, Metrics};
use crate::notify::Notifier;
use crate::orders::{OrderError, OrderManager, SubmitOutcome};
use crate::positions::PositionTracker;
use crate::reconcile::{ReconcileError, Reconciler};
use crate::risk::{RiskError, RiskManager};
use crate::store::Store;
use crate::strategy::{SmaCrossoverStrategy, Strategy};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("startup reconciliation failed: {0}")]
    StartupReconciliation(#[from] ReconcileError),
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Routes bus events to the components. Cloneable snapshot of the wiring.
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<DataHandler>,
    strategy: Arc<dyn Strategy>,
    tracker: Arc<PositionTracker>,
    orders: Arc<OrderManager>,
    bus: EventBus,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub async fn handle(&self, event: Event) -> anyhow::Result<()> {
        use std::sync::atomic::Ordering;

        match event {
            Event::Bar(bar) => {
                self.metrics.bars_processed.fetch_add(1, Ordering::Relaxed);

                self.tracker.on_bar(&bar)?;

                let history = self.handler.history(&bar.symbol);
                for signal in self.strategy.on_bar(&bar.symbol, &history) {
                    self.metrics
                        .signals_emitted
                        .fetch_add(1, Ordering::Relaxed);
                    self.bus.publish(Event::Signal(signal));
                }
                Ok(())
            }

            Event::Signal(signal) => {
                match self.orders.submit_entry(&signal).await {
                    Ok(SubmitOutcome::Submitted(id)) => {
                        self.metrics
                            .orders_submitted
                            .fetch_add(1, Ordering::Relaxed);
                        debug!(client_order_id = %id, "entry submitted");
                    }
                    Ok(SubmitOutcome::AlreadyExists(id)) => {
                        debug!(client_order_id = %id, "entry already on record");
                    }
                    Ok(SubmitOutcome::Skipped(reason)) => {
                        self.metrics
                            .signals_skipped
                            .fetch_add(1, Ordering::Relaxed);
                        debug!(symbol = %signal.symbol, %reason, "entry skipped");
                    }
                    Err(OrderError::Risk(RiskError::Safety(reason))) => {
                        // Safety aborts are quiet towards the caller; the
                        // log line is the record.
                        info!(symbol = %signal.symbol, %reason, "entry aborted by safety gate");
                    }
                    Err(e) => {
                        self.metrics.order_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(symbol = %signal.symbol, error = %e, "entry submission failed");
                    }
                }
                Ok(())
            }

            Event::Exit(exit) => {
                self.metrics.exit_signals.fetch_add(1, Ordering::Relaxed);
                match self.orders.submit_exit(&exit).await {
                    Ok(outcome) => {
                        debug!(symbol = %exit.symbol, ?outcome, "exit routed");
                    }
                    Err(e) => {
                        // Back-off was recorded inside submit_exit; the
                        // next scan retries.
                        self.metrics.order_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(symbol = %exit.symbol, error = %e, "exit submission failed");
                    }
                }
                Ok(())
            }

            Event::OrderUpdate(order) => {
                self.metrics.order_updates.fetch_add(1, Ordering::Relaxed);
                self.tracker.on_order_update(&order)?;
                Ok(())
            }

            Event::IntentSubmitted(intent) => {
                debug!(
                    client_order_id = %intent.client_order_id,
                    symbol = %intent.symbol,
                    status = %intent.status,
                    "intent audit event"
                );
                Ok(())
            }
        }
    }
}

pub struct Engine {
    config: Arc<Config>,
    store: Arc<Store>,
    broker: Arc<dyn Broker>,
    data_source: Arc<dyn MarketDataSource>,
    notifier: Arc<dyn Notifier>,
    bus: EventBus,
    receiver: EventReceiver,
    handler: Arc<DataHandler>,
    strategy: Arc<dyn Strategy>,
    tracker: Arc<PositionTracker>,
    orders: Arc<OrderManager>,
    metrics: Arc<Metrics>,
}

impl Engine {
    /// Wire the engine over an already-opened store and the external
    /// collaborators.
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        broker: Arc<dyn Broker>,
        data_source: Arc<dyn MarketDataSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (bus, receiver) = bus::channel();
        let handler = Arc::new(DataHandler::new(
            store.clone(),
            bus.clone(),
            config.timeframe.clone(),
        ));
        let tracker = Arc::new(PositionTracker::new(
            store.clone(),
            config.exit.trailing_multiplier,
        ));
        let risk = RiskManager::new(
            store.clone(),
            broker.clone(),
            config.clone(),
            notifier.clone(),
        );
        let orders = Arc::new(OrderManager::new(
            store.clone(),
            broker.clone(),
            risk,
            tracker.clone(),
            bus.clone(),
            config.clone(),
            notifier.clone(),
        ));
        let strategy: Arc<dyn Strategy> = Arc::new(SmaCrossoverStrategy::new(store.clone()));

        Self {
            config,
            store,
            broker,
            data_source,
            notifier,
            bus,
            receiver,
            handler,
            strategy,
            tracker,
            orders,
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Run to completion: returns after the token is cancelled and the
    /// graceful shutdown has finished, or with an error on a fatal
    /// startup failure.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), EngineError> {
        let Engine {
            config,
            store,
            broker,
            data_source,
            notifier,
            bus,
            receiver,
            handler,
            strategy,
            tracker,
            orders,
            metrics,
        } = self;

        // ── 1. Rehydrate ─────────────────────────────────────────────
        tracker.rehydrate().map_err(EngineError::Fatal)?;

        // ── 2. Drawdown monitor (manual recovery happens pre-reconcile) ──
        let monitor = DrawdownMonitor::new(
            store.clone(),
            broker.clone(),
            orders.clone(),
            notifier.clone(),
            config.drawdown.clone(),
        );
        monitor
            .apply_manual_recovery()
            .map_err(|e| EngineError::Fatal(e.into()))?;

        // ── 3. Startup reconciliation (blocking) ─────────────────────
        let reconciler = Reconciler::new(
            store.clone(),
            broker.clone(),
            tracker.clone(),
            notifier.clone(),
            config.data_dir.clone(),
            config.reconciliation.runtime_check_interval_seconds,
        );
        reconciler.startup().await?;

        // ── 4. Preload histories ─────────────────────────────────────
        let symbols = config.symbols.all();
        handler.preload(&symbols).map_err(EngineError::Fatal)?;

        // ── 5. Background tasks ──────────────────────────────────────
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(poller::run_bar_poll_loop(
            data_source.clone(),
            handler.clone(),
            symbols.clone(),
            config.timeframe.clone(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(poller::run_order_update_loop(
            broker.clone(),
            store.clone(),
            bus.clone(),
            cancel.clone(),
        )));

        let exit_manager = ExitManager::new(
            tracker.clone(),
            handler.clone(),
            broker.clone(),
            store.clone(),
            bus.clone(),
            config.exit.clone(),
        );
        tasks.push(tokio::spawn(exit_manager.run(cancel.clone())));

        tasks.push(tokio::spawn(reconciler.run(cancel.clone())));
        tasks.push(tokio::spawn(monitor.run(cancel.clone())));

        tasks.push(tokio::spawn(housekeeping::run_equity_snapshot_loop(
            broker.clone(),
            store.clone(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(housekeeping::run_daily_reset_loop(
            store.clone(),
            config.market_tz(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(housekeeping::run_metrics_loop(
            metrics.clone(),
            bus.clone(),
            config.data_dir.join("metrics.json"),
            cancel.clone(),
        )));

        info!(tasks = tasks.len() + 1, "engine running");

        // ── 6. Dispatcher (this task) ────────────────────────────────
        let dispatcher = Dispatcher {
            handler,
            strategy,
            tracker,
            orders: orders.clone(),
            bus,
            metrics,
        };
        receiver
            .dispatch(cancel.clone(), move |event| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.handle(event).await }
            })
            .await;

        // ── 7. Drain tasks, then shut down gracefully ────────────────
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        housekeeping::graceful_shutdown(&orders, broker.as_ref(), &store)
            .await
            .map_err(EngineError::Fatal)?;
        Ok(())
    }
}

// =============================================================================
// Scenario tests — end-to-end flows over mock collaborators
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::broker::{
        Account, BrokerError, BrokerOrder, BrokerPosition, BrokerResult, MarketClock,
        OrderRequest,
    };
    use crate::data::Bar;
    use crate::exits::{ExitReason, ExitSignal};
    use crate::types::{OrderStatus, Side};

    /// Recording broker: open market, 100k account, scripted orders and
    /// positions, strict call journal for ordering assertions.
    struct ScenarioBroker {
        calls: Mutex<Vec<String>>,
        submissions: Mutex<Vec<OrderRequest>>,
        open_orders: Mutex<Vec<BrokerOrder>>,
        positions: Mutex<Vec<BrokerPosition>>,
        fail_submissions: Mutex<bool>,
        now: DateTime<Utc>,
    }

    impl ScenarioBroker {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                submissions: Mutex::new(Vec::new()),
                open_orders: Mutex::new(Vec::new()),
                positions: Mutex::new(Vec::new()),
                fail_submissions: Mutex::new(false),
                // 11:00 New York, Wednesday 2024-02-21.
                now: Utc.with_ymd_and_hms(2024, 2, 21, 16, 0, 0).unwrap(),
            }
        }
    }

    #[async_trait]
    impl Broker for ScenarioBroker {
        async fn clock(&self) -> BrokerResult<MarketClock> {
            Ok(MarketClock {
                is_open: true,
                next_open_utc: self.now + ChronoDuration::hours(18),
                next_close_utc: self.now + ChronoDuration::hours(5),
                fetched_at: self.now,
            })
        }
        async fn account(&self) -> BrokerResult<Account> {
            self.calls.lock().push("account".into());
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
        async fn order_by_id(&self, _id: &str) -> BrokerResult<Option<BrokerOrder>> {
            Ok(None)
        }
        async fn submit_order(&self, request: &OrderRequest) -> BrokerResult<BrokerOrder> {
            if *self.fail_submissions.lock() {
                return Err(BrokerError::Fatal("scripted failure".into()));
            }
            self.calls
                .lock()
                .push(format!("submit:{}", request.client_order_id));
            self.submissions.lock().push(request.clone());
            let now = Utc::now();
            Ok(BrokerOrder {
                broker_order_id: format!("b-{}", self.submissions.lock().len()),
                client_order_id: request.client_order_id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                quantity: request.quantity,
                filled_quantity: Decimal::ZERO,
                average_fill_price: Decimal::ZERO,
                status: OrderStatus::Accepted,
                created_at: now,
                updated_at: now,
            })
        }
        async fn cancel_order(&self, broker_order_id: &str) -> BrokerResult<()> {
            self.calls.lock().push(format!("cancel:{broker_order_id}"));
            Ok(())
        }
    }

    struct Scenario {
        store: Arc<Store>,
        broker: Arc<ScenarioBroker>,
        handler: Arc<DataHandler>,
        tracker: Arc<PositionTracker>,
        orders: Arc<OrderManager>,
        dispatcher: Dispatcher,
        receiver: crate::bus::EventReceiver,
    }

    fn scenario() -> Scenario {
        let json = r#"{ "symbols": { "equities": ["AAPL"] } }"#;
        let mut cfg: Config = serde_json::from_str(json).unwrap();
        cfg.validate().unwrap();
        let config = Arc::new(cfg);

        let store = Arc::new(Store::open_in_memory().unwrap());
        let broker = Arc::new(ScenarioBroker::new());
        let notifier: Arc<dyn Notifier> = Arc::new(crate::notify::LogNotifier);

        let (bus, receiver) = bus::channel();
        let handler = Arc::new(DataHandler::new(store.clone(), bus.clone(), "1m"));
        let tracker = Arc::new(PositionTracker::new(
            store.clone(),
            config.exit.trailing_multiplier,
        ));
        let risk = RiskManager::new(
            store.clone(),
            broker.clone(),
            config.clone(),
            notifier.clone(),
        );
        let orders = Arc::new(OrderManager::new(
            store.clone(),
            broker.clone(),
            risk,
            tracker.clone(),
            bus.clone(),
            config.clone(),
            notifier,
        ));
        let strategy: Arc<dyn Strategy> = Arc::new(SmaCrossoverStrategy::new(store.clone()));
        let dispatcher = Dispatcher {
            handler: handler.clone(),
            strategy,
            tracker: tracker.clone(),
            orders: orders.clone(),
            bus,
            metrics: Arc::new(Metrics::default()),
        };

        Scenario {
            store,
            broker,
            handler,
            tracker,
            orders,
            dispatcher,
            receiver,
        }
    }

    /// 60 bars of AAPL ending in an upward SMA cross at 10:30 UTC with the
    /// final close at 150.
    fn crossing_bars() -> Vec<Bar> {
        let end = Utc.with_ymd_and_hms(2024, 2, 21, 10, 30, 0).unwrap();
        let mut bars = Vec::new();
        for i in 0..60i64 {
            let close = if i == 59 { dec!(150) } else { dec!(149) };
            bars.push(Bar {
                symbol: "AAPL".into(),
                timeframe: "1m".into(),
                timestamp: end - ChronoDuration::minutes(59 - i),
                open: close,
                high: close + dec!(0.5),
                low: close - dec!(0.5),
                close,
                volume: dec!(1000),
            });
        }
        bars
    }

    /// Drain every queued event through the dispatcher, in bus order.
    async fn drain(scenario: &mut Scenario) {
        loop {
            let event = scenario
                .receiver
                .try_recv_exit()
                .or_else(|| scenario.receiver.try_recv_main());
            match event {
                Some(event) => scenario.dispatcher.handle(event).await.unwrap(),
                None => return,
            }
        }
    }

    #[tokio::test]
    async fn scenario_happy_path_signal_to_broker() {
        let mut s = scenario();
        for bar in crossing_bars() {
            s.handler.on_raw_bar(bar).unwrap();
        }
        drain(&mut s).await;

        // Deterministic id for
        // sma_crossover_multi:AAPL:1m:2024-02-21T10:30:00Z:buy. All three
        // pair signals share the id tuple, so exactly one order reaches
        // the broker.
        let submissions = s.broker.submissions.lock();
        assert_eq!(submissions.len(), 1);
        let entry = &submissions[0];
        assert_eq!(entry.client_order_id, "f96c6425fc1a89f5");
        // floor(100000 * 0.05 / 150) = 33 shares.
        assert_eq!(entry.quantity, dec!(33));

        drop(submissions);
        let intent = s.store.get_order_intent("f96c6425fc1a89f5").unwrap().unwrap();
        assert_eq!(intent.status, OrderStatus::Accepted);
        assert_eq!(intent.quantity, dec!(33));
    }

    #[tokio::test]
    async fn scenario_duplicate_suppression() {
        let mut s = scenario();
        for bar in crossing_bars() {
            s.handler.on_raw_bar(bar).unwrap();
        }
        drain(&mut s).await;
        let first_count = s.broker.submissions.lock().len();
        assert!(first_count >= 1);

        // The identical signal replayed straight into the dispatcher.
        let signal = crate::strategy::Signal {
            symbol: "AAPL".into(),
            side: Side::Buy,
            timeframe: "1m".into(),
            signal_timestamp: Utc.with_ymd_and_hms(2024, 2, 21, 10, 30, 0).unwrap(),
            metadata: crate::strategy::SignalMetadata {
                strategy: "sma_crossover_multi".into(),
                param_tag: "sma_5_15".into(),
                price: dec!(150),
                regime: crate::strategy::Regime::Unknown,
                regime_strength: 0.5,
                confidence: 0.6,
                atr: dec!(1),
            },
        };
        s.dispatcher
            .handle(Event::Signal(signal))
            .await
            .unwrap();

        assert_eq!(s.broker.submissions.lock().len(), first_count);
    }

    #[tokio::test]
    async fn scenario_exit_rule_fires_and_flag_round_trips() {
        let s = scenario();

        // Position opened at 100 with ATR 2.
        let position = crate::positions::TrackedPosition {
            symbol: "AAPL".into(),
            quantity: dec!(100),
            entry_price: dec!(100),
            atr_value: dec!(2),
            trailing_stop_price: dec!(90),
            pending_exit: false,
            pending_exit_order: None,
            opened_at: Utc::now(),
        };
        s.store.upsert_position(&position).unwrap();
        s.tracker.rehydrate().unwrap();

        // Exit signal at 97.0 — the ATR stop (rule 1).
        let exit = ExitSignal {
            symbol: "AAPL".into(),
            quantity: dec!(100),
            side: Side::Sell,
            reason: ExitReason::AtrStopLoss,
            current_price: dec!(97),
            timestamp: Utc::now(),
        };
        s.dispatcher.handle(Event::Exit(exit)).await.unwrap();

        let pos = s.tracker.get("AAPL").unwrap();
        assert!(pos.pending_exit);
        let exit_id = pos.pending_exit_order.clone().unwrap();

        // Broker cancels the exit order: pending must return to false.
        let now = Utc::now();
        let canceled = BrokerOrder {
            broker_order_id: "b-x".into(),
            client_order_id: exit_id,
            symbol: "AAPL".into(),
            side: Side::Sell,
            quantity: dec!(100),
            filled_quantity: Decimal::ZERO,
            average_fill_price: Decimal::ZERO,
            status: OrderStatus::Canceled,
            created_at: now,
            updated_at: now,
        };
        s.dispatcher
            .handle(Event::OrderUpdate(canceled))
            .await
            .unwrap();
        assert!(!s.tracker.get("AAPL").unwrap().pending_exit);
    }

    #[tokio::test]
    async fn scenario_graceful_shutdown_order() {
        let s = scenario();

        // One open order and one open 100-share AAPL position.
        let now = Utc::now();
        s.broker.open_orders.lock().push(BrokerOrder {
            broker_order_id: "b-open".into(),
            client_order_id: "1234123412341234".into(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            quantity: dec!(10),
            filled_quantity: Decimal::ZERO,
            average_fill_price: Decimal::ZERO,
            status: OrderStatus::Accepted,
            created_at: now,
            updated_at: now,
        });
        let position = crate::positions::TrackedPosition {
            symbol: "AAPL".into(),
            quantity: dec!(100),
            entry_price: dec!(150),
            atr_value: dec!(2),
            trailing_stop_price: dec!(146),
            pending_exit: false,
            pending_exit_order: None,
            opened_at: now,
        };
        s.store.upsert_position(&position).unwrap();
        s.tracker.rehydrate().unwrap();

        housekeeping::graceful_shutdown(&s.orders, s.broker.as_ref(), &s.store)
            .await
            .unwrap();

        // Cancel, then the flatten sell, then the account fetch for the
        // final snapshot — in that order.
        let calls = s.broker.calls.lock().clone();
        let cancel_idx = calls.iter().position(|c| c == "cancel:b-open").unwrap();
        let flatten_idx = calls
            .iter()
            .position(|c| c.starts_with("submit:FLATTEN_AAPL_"))
            .unwrap();
        let snapshot_idx = calls.iter().rposition(|c| c == "account").unwrap();
        assert!(cancel_idx < flatten_idx, "{calls:?}");
        assert!(flatten_idx < snapshot_idx, "{calls:?}");

        let flatten = &s.broker.submissions.lock()[0];
        assert_eq!(flatten.quantity, dec!(100));
        assert_eq!(flatten.side, Side::Sell);

        assert_eq!(s.store.equity_snapshot_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn scenario_safety_abort_is_swallowed_by_dispatcher() {
        let mut s = scenario();
        s.store.set_trading_halted(true).unwrap();

        for bar in crossing_bars() {
            s.handler.on_raw_bar(bar).unwrap();
        }
        // Dispatch must survive the safety aborts and submit nothing.
        drain(&mut s).await;
        assert!(s.broker.submissions.lock().is_empty());
    }
}
