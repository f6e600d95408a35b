// =============================================================================
// Drawdown Monitor — peak-to-trough escalation with hysteresis
// =============================================================================
//
// Four levels, benign to severe: Normal, Warning, Halt, Emergency. Each
// level has an escalation threshold and a strictly lower recovery
// threshold, so the monitor cannot oscillate at a boundary.
//
// Per tick:
//   - fetch equity, ratchet the persisted peak (reset every lookbackDays)
//   - drawdownPct = (peak - equity) / peak
//   - escalate at most ONE level per tick towards severity
//   - recover any number of levels in one tick (auto-recovery only),
//     judged against the lower recovery thresholds
//
// Side effects: Warning shrinks new order quantities (order manager reads
// the level), Halt and Emergency block the SAFETY tier, and entering
// Emergency flattens the book.
//
// Fail-safe: three consecutive failed ticks escalate Normal/Warning to
// Halt; Emergency is never downgraded by the fail-safe. All state lives in
// the store and survives restarts. A manual-recovery flag, honoured at
// startup when auto-recovery is off, resets the level to Normal once.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::DrawdownConfig;
use crate::notify::{Alert, Notifier};
use crate::store::{keys, Store, StoreError, StoreResult};

/// Consecutive failed ticks before the fail-safe escalates to Halt.
const FAILSAFE_THRESHOLD: u32 = 3;

/// Escalation levels, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrawdownLevel {
    Normal,
    Warning,
    Halt,
    Emergency,
}

impl DrawdownLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Halt => "halt",
            Self::Emergency => "emergency",
        }
    }

    /// One step towards severity.
    fn escalated(&self) -> DrawdownLevel {
        match self {
            Self::Normal => Self::Warning,
            Self::Warning => Self::Halt,
            Self::Halt | Self::Emergency => Self::Emergency,
        }
    }

    /// Persisted level, defaulting to Normal.
    pub fn load(store: &Store) -> StoreResult<DrawdownLevel> {
        match store.state_get(keys::DRAWDOWN_LEVEL)? {
            None => Ok(Self::Normal),
            Some(v) => v.parse(),
        }
    }

    pub fn persist(&self, store: &Store) -> StoreResult<()> {
        store.state_set(keys::DRAWDOWN_LEVEL, self.as_str())
    }
}

impl std::fmt::Display for DrawdownLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DrawdownLevel {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "warning" => Ok(Self::Warning),
            "halt" => Ok(Self::Halt),
            "emergency" => Ok(Self::Emergency),
            other => Err(StoreError::Corrupt(format!("unknown drawdown level {other:?}"))),
        }
    }
}

/// Flatten hook; implemented by the order manager.
#[async_trait]
pub trait FlattenAll: Send + Sync {
    async fn flatten_positions(&self) -> anyhow::Result<()>;
}

pub struct DrawdownMonitor {
    store: Arc<Store>,
    broker: Arc<dyn Broker>,
    flatten: Arc<dyn FlattenAll>,
    notifier: Arc<dyn Notifier>,
    config: DrawdownConfig,
    consecutive_failures: AtomicU32,
}

impl DrawdownMonitor {
    pub fn new(
        store: Arc<Store>,
        broker: Arc<dyn Broker>,
        flatten: Arc<dyn FlattenAll>,
        notifier: Arc<dyn Notifier>,
        config: DrawdownConfig,
    ) -> Self {
        Self {
            store,
            broker,
            flatten,
            notifier,
            config,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Startup hook: honour a pending manual-recovery request when
    /// auto-recovery is disabled. The flag clears itself.
    pub fn apply_manual_recovery(&self) -> StoreResult<()> {
        if self.config.enable_auto_recovery {
            return Ok(());
        }
        if self.store.state_get_bool(keys::DRAWDOWN_MANUAL_RECOVERY)? {
            let previous = DrawdownLevel::load(&self.store)?;
            DrawdownLevel::Normal.persist(&self.store)?;
            self.store.state_set_bool(keys::DRAWDOWN_MANUAL_RECOVERY, false)?;
            info!(%previous, "manual drawdown recovery applied — level reset to normal");
        }
        Ok(())
    }

    /// Monitor loop; spawned once at engine startup.
    pub async fn run(self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("drawdown monitor disabled by configuration");
            return;
        }
        info!(
            interval_secs = self.config.check_interval_seconds,
            "drawdown monitor started"
        );
        let mut ticker = interval(Duration::from_secs(self.config.check_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("drawdown monitor stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick(Utc::now()).await {
                error!(error = %e, "drawdown tick failed");
                self.on_tick_failure();
            }
        }
    }

    /// One monitor tick. Public for the scenario tests.
    pub async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let account = self.broker.account().await?;
        let equity = account.portfolio_value;
        if equity <= Decimal::ZERO {
            anyhow::bail!("non-positive portfolio value {equity}");
        }
        self.consecutive_failures.store(0, Ordering::Relaxed);

        let peak = self.update_peak(equity, now)?;
        let drawdown_pct = (peak - equity) / peak * Decimal::from(100);

        let current = DrawdownLevel::load(&self.store)?;
        let escalation_target = self.escalation_level(drawdown_pct);
        let recovery_target = self.recovery_level(drawdown_pct);

        let next = if escalation_target > current {
            // Never jump more than one level towards severity per tick.
            current.escalated()
        } else if self.config.enable_auto_recovery && recovery_target < current {
            recovery_target
        } else {
            current
        };

        debug!(
            equity = %equity,
            peak = %peak,
            drawdown_pct = %drawdown_pct.round_dp(3),
            level = %current,
            "drawdown tick"
        );

        if next != current {
            self.transition(current, next).await?;
        }
        Ok(())
    }

    fn update_peak(&self, equity: Decimal, now: DateTime<Utc>) -> StoreResult<Decimal> {
        let stored_peak = self.store.state_get_decimal(keys::DRAWDOWN_PEAK_EQUITY)?;
        let last_reset = match self.store.state_get(keys::DRAWDOWN_LAST_PEAK_RESET)? {
            Some(v) => DateTime::parse_from_rfc3339(&v)
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            None => None,
        };

        let lookback = ChronoDuration::days(self.config.lookback_days as i64);
        let expired = last_reset.map_or(true, |reset| now - reset > lookback);

        let peak = if expired || stored_peak <= Decimal::ZERO {
            self.store
                .state_set(keys::DRAWDOWN_LAST_PEAK_RESET, &now.to_rfc3339())?;
            equity
        } else {
            stored_peak.max(equity)
        };
        self.store.state_set_decimal(keys::DRAWDOWN_PEAK_EQUITY, peak)?;
        Ok(peak)
    }

    fn escalation_level(&self, drawdown_pct: Decimal) -> DrawdownLevel {
        if drawdown_pct >= self.config.emergency_threshold_pct {
            DrawdownLevel::Emergency
        } else if drawdown_pct >= self.config.halt_threshold_pct {
            DrawdownLevel::Halt
        } else if drawdown_pct >= self.config.warning_threshold_pct {
            DrawdownLevel::Warning
        } else {
            DrawdownLevel::Normal
        }
    }

    fn recovery_level(&self, drawdown_pct: Decimal) -> DrawdownLevel {
        if drawdown_pct >= self.config.emergency_recovery_threshold_pct {
            DrawdownLevel::Emergency
        } else if drawdown_pct >= self.config.halt_recovery_threshold_pct {
            DrawdownLevel::Halt
        } else if drawdown_pct >= self.config.warning_recovery_threshold_pct {
            DrawdownLevel::Warning
        } else {
            DrawdownLevel::Normal
        }
    }

    async fn transition(&self, from: DrawdownLevel, to: DrawdownLevel) -> anyhow::Result<()> {
        to.persist(&self.store)?;
        warn!(%from, %to, "drawdown level transition");
        self.notifier.notify(Alert::DrawdownTransition {
            from: from.to_string(),
            to: to.to_string(),
        });

        if to == DrawdownLevel::Emergency && from != DrawdownLevel::Emergency {
            error!("drawdown emergency — flattening all positions");
            self.flatten.flatten_positions().await?;
        }
        Ok(())
    }

    fn on_tick_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures < FAILSAFE_THRESHOLD {
            return;
        }
        match DrawdownLevel::load(&self.store) {
            Ok(level @ (DrawdownLevel::Normal | DrawdownLevel::Warning)) => {
                warn!(
                    failures,
                    %level,
                    "drawdown updates failing — fail-safe escalation to halt"
                );
                if let Err(e) = DrawdownLevel::Halt.persist(&self.store) {
                    error!(error = %e, "fail-safe halt could not be persisted");
                } else {
                    self.notifier.notify(Alert::DrawdownTransition {
                        from: level.to_string(),
                        to: DrawdownLevel::Halt.to_string(),
                    });
                }
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "drawdown level unavailable during fail-safe"),
        }
    }
}
