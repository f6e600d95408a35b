// =============================================================================
// Exit Manager — periodic position scan with 5-rule priority
// =============================================================================
//
// Runs as a background task, waking on a fixed interval to evaluate every
// open position against the exit rules, in priority order:
//
//   1. ATR stop loss       price <= entry - atrStopMultiplier * atr
//   2. Percentage stop     price <= entry * (1 - stopLossPct)
//   3. ATR profit target   price >= entry + atrProfitMultiplier * atr
//   4. Percentage target   price >= entry * (1 + profitTargetPct)
//   5. Trailing stop       price <= trailingStopPrice
//
// At most one ExitSignal per position per scan, published on the bus's
// unbounded exit channel — exit signals are never dropped. The dispatcher
// routes them to the order manager.
//
// Skips: market closed, position already pending exit, invalid (zero) ATR,
// and positions inside the exponential back-off window after a failed
// submission (2^(attempts-1) seconds, capped).
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::bus::{Event, EventBus};
use crate::config::ExitConfig;
use crate::data::DataHandler;
use crate::positions::{PositionTracker, TrackedPosition};
use crate::store::Store;
use crate::types::Side;

/// Back-off ceiling for repeated exit-submission failures.
const BACKOFF_CAP_SECS: u64 = 3600;

/// Which rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    AtrStopLoss,
    PctStopLoss,
    AtrProfitTarget,
    PctProfitTarget,
    TrailingStop,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AtrStopLoss => "atr_stop_loss",
            Self::PctStopLoss => "pct_stop_loss",
            Self::AtrProfitTarget => "atr_profit_target",
            Self::PctProfitTarget => "pct_profit_target",
            Self::TrailingStop => "trailing_stop",
        };
        f.write_str(s)
    }
}

/// Request to close a position. Travels on the unbounded exit channel.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    pub symbol: String,
    pub quantity: Decimal,
    pub side: Side,
    pub reason: ExitReason,
    pub current_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Seconds to wait after `attempts` failed submissions.
pub fn backoff_seconds(attempts: u32) -> u64 {
    if attempts == 0 {
        return 0;
    }
    1u64.checked_shl(attempts - 1)
        .map(|s| s.min(BACKOFF_CAP_SECS))
        .unwrap_or(BACKOFF_CAP_SECS)
}

/// Evaluate the rules for one position. Pure; first match wins.
pub fn evaluate_rules(
    position: &TrackedPosition,
    price: Decimal,
    config: &ExitConfig,
) -> Option<ExitReason> {
    let entry = position.entry_price;
    let atr = position.atr_value;

    if price <= entry - config.atr_stop_multiplier * atr {
        return Some(ExitReason::AtrStopLoss);
    }
    if price <= entry * (Decimal::ONE - config.stop_loss_pct) {
        return Some(ExitReason::PctStopLoss);
    }
    if price >= entry + config.atr_profit_multiplier * atr {
        return Some(ExitReason::AtrProfitTarget);
    }
    if price >= entry * (Decimal::ONE + config.profit_target_pct) {
        return Some(ExitReason::PctProfitTarget);
    }
    if price <= position.trailing_stop_price {
        return Some(ExitReason::TrailingStop);
    }
    None
}

pub struct ExitManager {
    tracker: Arc<PositionTracker>,
    handler: Arc<DataHandler>,
    broker: Arc<dyn Broker>,
    store: Arc<Store>,
    bus: EventBus,
    config: ExitConfig,
}

impl ExitManager {
    pub fn new(
        tracker: Arc<PositionTracker>,
        handler: Arc<DataHandler>,
        broker: Arc<dyn Broker>,
        store: Arc<Store>,
        bus: EventBus,
        config: ExitConfig,
    ) -> Self {
        Self {
            tracker,
            handler,
            broker,
            store,
            bus,
            config,
        }
    }

    /// Scan loop; spawned once at engine startup.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.check_interval_seconds,
            "exit manager started"
        );
        let mut ticker = interval(Duration::from_secs(self.config.check_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("exit manager stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            self.scan_once(Utc::now()).await;
        }
    }

    /// One pass over all open positions. Returns the number of exit
    /// signals emitted.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> usize {
        let positions = self.tracker.snapshot();
        if positions.is_empty() {
            return 0;
        }

        match self.broker.clock().await {
            Ok(clock) if !clock.is_open => {
                debug!("market closed — exit scan skipped");
                return 0;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "clock unavailable — exit scan skipped");
                return 0;
            }
        }

        let mut emitted = 0;
        for position in positions {
            if position.pending_exit {
                debug!(symbol = %position.symbol, "exit already working — skipped");
                continue;
            }
            if position.atr_value <= Decimal::ZERO {
                warn!(
                    symbol = %position.symbol,
                    atr = %position.atr_value,
                    "invalid ATR — exit evaluation skipped"
                );
                continue;
            }
            if self.in_backoff(&position.symbol, now) {
                continue;
            }

            let Some(price) = self.handler.latest_close(&position.symbol) else {
                debug!(symbol = %position.symbol, "no price yet — skipped");
                continue;
            };

            // Refresh the trailing stop before rule 5 sees it.
            if let Err(e) = self.tracker.refresh_trailing_stop(&position.symbol, price) {
                warn!(symbol = %position.symbol, error = %e, "trailing refresh failed");
            }
            let position = match self.tracker.get(&position.symbol) {
                Some(p) => p,
                None => continue,
            };

            if let Some(reason) = evaluate_rules(&position, price, &self.config) {
                info!(
                    symbol = %position.symbol,
                    %reason,
                    entry = %position.entry_price,
                    price = %price,
                    trailing = %position.trailing_stop_price,
                    "exit rule fired"
                );
                self.bus.publish(Event::Exit(ExitSignal {
                    symbol: position.symbol.clone(),
                    quantity: position.quantity,
                    side: Side::Sell,
                    reason,
                    current_price: price,
                    timestamp: now,
                }));
                emitted += 1;
            }
        }
        emitted
    }

    fn in_backoff(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        match self.store.exit_attempt_state(symbol) {
            Ok(Some((attempts, last_attempt))) => {
                let wait = backoff_seconds(attempts);
                let until = last_attempt + ChronoDuration::seconds(wait as i64);
                if now < until {
                    debug!(
                        symbol,
                        attempts,
                        wait_secs = wait,
                        "position in exit back-off — skipped"
                    );
                    true
                } else {
                    false
                }
            }
            Ok(None) => false,
            Err(e) => {
                warn!(symbol, error = %e, "back-off state unavailable — not skipping");
                false
            }
        }
    }
}
