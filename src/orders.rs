// =============================================================================
// Order Manager — deterministic identity and persist-before-submit
// =============================================================================
//
// The client order id is the first 16 hex characters of SHA-256 over
// `strategy:symbol:timeframe:signalTimestamp:side` (timestamp in ISO 8601
// with a Z suffix). Same signal, same id — across calls and across process
// restarts. Combined with persist-before-submit this makes submission
// idempotent end to end: a crash between the store insert and the broker
// call leaves a recoverable intent, and a replayed signal short-circuits on
// the existing row.
//
// Submission protocol for entries:
//   1. size the order (min of the equity cap and the risk cap, >= 1)
//   2. short-circuit on an existing intent for the id
//   3. run the full risk gate against that quantity's notional
//   4. apply the drawdown Warning multiplier
//   5. persist the intent as PendingNew
//   6. submit; on success record the broker id and reset the circuit
//      breaker, on failure increment it and mark the intent Rejected
//   7. publish the intent event
//
// Exits skip the RISK and FILTERS tiers entirely (SAFETY still binds).
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError, OrderRequest};
use crate::bus::{Event, EventBus};
use crate::config::Config;
use crate::drawdown::DrawdownLevel;
use crate::exits::ExitSignal;
use crate::notify::{Alert, Notifier};
use crate::positions::PositionTracker;
use crate::risk::{EntryContext, GateDecision, RiskError, RiskManager, CIRCUIT_BREAKER_LIMIT};
use crate::store::{Store, StoreError};
use crate::strategy::Signal;
use crate::types::{OrderIntent, OrderStatus, Side};

/// Strategy tag used in deterministic ids for exit-manager orders.
const EXIT_STRATEGY_TAG: &str = "exit_manager";

#[derive(Debug, Error)]
pub enum OrderError {
    #[error(transparent)]
    Risk(#[from] RiskError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a submission attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Submitted to the broker (or synthesised in dry-run mode).
    Submitted(String),
    /// An intent for this id already exists; no broker call was made.
    AlreadyExists(String),
    /// Soft-skipped by the FILTERS tier.
    Skipped(String),
}

impl SubmitOutcome {
    pub fn client_order_id(&self) -> Option<&str> {
        match self {
            Self::Submitted(id) | Self::AlreadyExists(id) => Some(id),
            Self::Skipped(_) => None,
        }
    }
}

/// Deterministic client order id over the signal identity tuple.
pub fn client_order_id(
    strategy: &str,
    symbol: &str,
    timeframe: &str,
    signal_ts: DateTime<Utc>,
    side: Side,
) -> String {
    let preimage = format!(
        "{strategy}:{symbol}:{timeframe}:{}:{side}",
        signal_ts.format("%Y-%m-%dT%H:%M:%SZ")
    );
    let digest = Sha256::digest(preimage.as_bytes());
    hex::encode(digest)[..16].to_string()
}

pub struct OrderManager {
    store: Arc<Store>,
    broker: Arc<dyn Broker>,
    risk: RiskManager,
    tracker: Arc<PositionTracker>,
    bus: EventBus,
    config: Arc<Config>,
    notifier: Arc<dyn Notifier>,
}

impl OrderManager {
    pub fn new(
        store: Arc<Store>,
        broker: Arc<dyn Broker>,
        risk: RiskManager,
        tracker: Arc<PositionTracker>,
        bus: EventBus,
        config: Arc<Config>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            broker,
            risk,
            tracker,
            bus,
            config,
            notifier,
        }
    }

    // -------------------------------------------------------------------------
    // Sizing
    // -------------------------------------------------------------------------

    /// `min(equityCap, riskCap)`, clamped to at least one share.
    ///
    ///   equityCap = floor(equity * maxPositionPct / price)
    ///   riskCap   = floor(equity * maxRiskPerTradePct / (price * stopLossPct))
    pub fn compute_quantity(&self, equity: Decimal, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return Decimal::ONE;
        }
        let equity_cap = (equity * self.config.risk.max_position_pct / price).floor();
        let risk_cap = (equity * self.config.risk.max_risk_per_trade_pct
            / (price * self.config.risk.stop_loss_pct))
            .floor();
        equity_cap.min(risk_cap).max(Decimal::ONE)
    }

    // -------------------------------------------------------------------------
    // Entry submission
    // -------------------------------------------------------------------------

    pub async fn submit_entry(&self, signal: &Signal) -> Result<SubmitOutcome, OrderError> {
        let account = self.broker.account().await?;
        let equity = account.portfolio_value;
        let price = signal.metadata.price;

        let mut quantity = self.compute_quantity(equity, price);

        let id = client_order_id(
            &signal.metadata.strategy,
            &signal.symbol,
            &signal.timeframe,
            signal.signal_timestamp,
            signal.side,
        );

        // Idempotency short-circuit before anything else mutates state: a
        // replayed signal returns the existing id and the broker is never
        // called twice.
        if let Some(existing) = self.store.get_order_intent(&id)? {
            info!(
                client_order_id = %id,
                status = %existing.status,
                "intent already exists — not resubmitting"
            );
            return Ok(SubmitOutcome::AlreadyExists(id));
        }

        let ctx = EntryContext {
            quantity,
            equity,
            open_equity_positions: self
                .tracker
                .open_equity_count(&self.config.symbols.equities),
        };
        match self.risk.check_entry(signal, &ctx).await? {
            GateDecision::Approved => {}
            GateDecision::Skipped(reason) => {
                info!(
                    symbol = %signal.symbol,
                    param_tag = %signal.metadata.param_tag,
                    %reason,
                    "signal skipped by filters"
                );
                return Ok(SubmitOutcome::Skipped(reason));
            }
        }

        // Drawdown Warning shrinks new positions; it never blocks them.
        if DrawdownLevel::load(&self.store)? == DrawdownLevel::Warning {
            let multiplier = self.config.drawdown.warning_position_multiplier;
            quantity = (quantity * multiplier).floor().max(Decimal::ONE);
            info!(
                symbol = %signal.symbol,
                %multiplier,
                reduced_quantity = %quantity,
                "drawdown warning multiplier applied"
            );
        }

        // Volatility reference for the position that the fill will open.
        self.tracker.note_entry_atr(&id, signal.metadata.atr);

        let request = OrderRequest {
            symbol: signal.symbol.clone(),
            side: signal.side,
            quantity,
            limit_price: Decimal::ZERO,
            client_order_id: id.clone(),
        };
        self.persist_and_submit(request).await?;
        Ok(SubmitOutcome::Submitted(id))
    }

    // -------------------------------------------------------------------------
    // Exit submission
    // -------------------------------------------------------------------------

    /// Submit an exit order. SAFETY tier only; the same-bar gate and the
    /// filters never throttle an exit.
    pub async fn submit_exit(&self, exit: &ExitSignal) -> Result<SubmitOutcome, OrderError> {
        self.risk.check_exit().await?;

        let id = client_order_id(
            EXIT_STRATEGY_TAG,
            &exit.symbol,
            &self.config.timeframe,
            exit.timestamp,
            exit.side,
        );

        if let Some(existing) = self.store.get_order_intent(&id)? {
            info!(
                client_order_id = %id,
                status = %existing.status,
                "exit intent already exists — not resubmitting"
            );
            return Ok(SubmitOutcome::AlreadyExists(id));
        }

        let request = OrderRequest {
            symbol: exit.symbol.clone(),
            side: exit.side,
            quantity: exit.quantity,
            limit_price: Decimal::ZERO,
            client_order_id: id.clone(),
        };

        match self.persist_and_submit(request).await {
            Ok(()) => {
                self.tracker.set_pending_exit(&exit.symbol, &id).map_err(|e| {
                    BrokerError::Fatal(format!("pending-exit bookkeeping failed: {e}"))
                })?;
                self.store.clear_exit_attempts(&exit.symbol)?;
                Ok(SubmitOutcome::Submitted(id))
            }
            Err(e) => {
                // Exponential back-off bookkeeping for the exit scan.
                let attempts = self.store.record_exit_attempt(&exit.symbol, Utc::now())?;
                warn!(
                    symbol = %exit.symbol,
                    attempts,
                    error = %e,
                    "exit submission failed — back-off recorded"
                );
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Flatten-all
    // -------------------------------------------------------------------------

    /// Cancel every open order for owned symbols, then market-sell every
    /// open position. Used by graceful shutdown and drawdown Emergency.
    pub async fn flatten_all(&self) -> Result<(), OrderError> {
        let universe = self.config.symbols.all();

        match self.broker.open_orders().await {
            Ok(open) => {
                for order in open.iter().filter(|o| universe.contains(&o.symbol)) {
                    info!(
                        broker_order_id = %order.broker_order_id,
                        symbol = %order.symbol,
                        "cancelling open order"
                    );
                    if let Err(e) = self.broker.cancel_order(&order.broker_order_id).await {
                        warn!(
                            broker_order_id = %order.broker_order_id,
                            error = %e,
                            "cancel failed — continuing flatten"
                        );
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not list open orders — flattening anyway"),
        }

        for position in self.tracker.snapshot() {
            if position.quantity <= Decimal::ZERO {
                continue;
            }
            let id = format!("FLATTEN_{}_{}", position.symbol, Uuid::new_v4());
            let request = OrderRequest {
                symbol: position.symbol.clone(),
                side: Side::Sell,
                quantity: position.quantity,
                limit_price: Decimal::ZERO,
                client_order_id: id.clone(),
            };
            info!(symbol = %position.symbol, quantity = %position.quantity, "flattening position");
            match self.persist_and_submit(request).await {
                Ok(()) => {
                    if let Err(e) = self.tracker.set_pending_exit(&position.symbol, &id) {
                        warn!(symbol = %position.symbol, error = %e, "pending-exit flag not set");
                    }
                }
                Err(e) => {
                    warn!(
                        symbol = %position.symbol,
                        error = %e,
                        "flatten submission failed — continuing with remaining positions"
                    );
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Shared submit path
    // -------------------------------------------------------------------------

    /// Persist the intent, then submit. The store write strictly precedes
    /// the broker call.
    async fn persist_and_submit(&self, request: OrderRequest) -> Result<(), OrderError> {
        let now = Utc::now();
        let intent = OrderIntent {
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            limit_price: request.limit_price,
            status: OrderStatus::PendingNew,
            broker_order_id: None,
            filled_quantity: Decimal::ZERO,
            average_fill_price: Decimal::ZERO,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_order_intent(&intent)?;

        match self.broker.submit_order(&request).await {
            Ok(order) => {
                self.store.mark_intent_submitted(
                    &request.client_order_id,
                    &order.broker_order_id,
                    Utc::now(),
                )?;
                // A successful submission proves the broker path is healthy.
                self.store.reset_circuit_breaker()?;

                let mut accepted = intent;
                accepted.status = OrderStatus::Accepted;
                accepted.broker_order_id = Some(order.broker_order_id.clone());
                info!(
                    client_order_id = %accepted.client_order_id,
                    broker_order_id = %order.broker_order_id,
                    symbol = %accepted.symbol,
                    side = %accepted.side,
                    quantity = %accepted.quantity,
                    "order submitted"
                );
                self.bus.publish(Event::IntentSubmitted(accepted));
                Ok(())
            }
            Err(e) => {
                let count = self.store.increment_circuit_breaker()?;
                self.store
                    .mark_intent_rejected(&request.client_order_id, &e.to_string(), Utc::now())?;
                self.notifier.notify(Alert::OrderSubmissionFailed {
                    symbol: request.symbol.clone(),
                    message: e.to_string(),
                });
                if count == CIRCUIT_BREAKER_LIMIT {
                    self.notifier
                        .notify(Alert::CircuitBreakerTripped { count });
                }
                warn!(
                    client_order_id = %request.client_order_id,
                    breaker_count = count,
                    error = %e,
                    "order submission failed"
                );
                Err(e.into())
            }
        }
    }
}

#[async_trait::async_trait]
impl crate::drawdown::FlattenAll for OrderManager {
    async fn flatten_positions(&self) -> anyhow::Result<()> {
        self.flatten_all().await.map_err(Into::into)
    }
}
