// =============================================================================
// Housekeeping — equity snapshots, daily reset, metrics, shutdown
// =============================================================================
//
// Three periodic jobs plus the graceful-shutdown hook:
//
//   equity snapshots  — every 60 s, one idempotent equity_curve row
//   daily reset       — first tick at/after 09:30 market time on weekdays,
//                       clears the daily counters (never the breaker),
//                       at most once per day via daily_reset_date
//   metrics flush     — every 60 s, data/metrics.json via tmp + rename
//
// Graceful shutdown: cancel open orders and flatten (both inside
// flatten_all), then take one final equity snapshot.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::bus::EventBus;
use crate::orders::OrderManager;
use crate::store::Store;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);
const RESET_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const METRICS_INTERVAL: Duration = Duration::from_secs(60);

const DAILY_RESET_TIME: NaiveTime = match NaiveTime::from_hms_opt(9, 30, 0) {
    Some(t) => t,
    None => unreachable!(),
};

// -----------------------------------------------------------------------------
// Metrics
// -----------------------------------------------------------------------------

/// Engine-wide counters, flushed periodically to `data/metrics.json`.
#[derive(Debug, Default)]
pub struct Metrics {
    pub bars_processed: AtomicU64,
    pub signals_emitted: AtomicU64,
    pub signals_skipped: AtomicU64,
    pub orders_submitted: AtomicU64,
    pub order_failures: AtomicU64,
    pub exit_signals: AtomicU64,
    pub order_updates: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: String,
    pub bars_processed: u64,
    pub signals_emitted: u64,
    pub signals_skipped: u64,
    pub orders_submitted: u64,
    pub order_failures: u64,
    pub exit_signals: u64,
    pub order_updates: u64,
    pub events_dropped: u64,
}

impl Metrics {
    pub fn snapshot(&self, events_dropped: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            taken_at: Utc::now().to_rfc3339(),
            bars_processed: self.bars_processed.load(Ordering::Relaxed),
            signals_emitted: self.signals_emitted.load(Ordering::Relaxed),
            signals_skipped: self.signals_skipped.load(Ordering::Relaxed),
            orders_submitted: self.orders_submitted.load(Ordering::Relaxed),
            order_failures: self.order_failures.load(Ordering::Relaxed),
            exit_signals: self.exit_signals.load(Ordering::Relaxed),
            order_updates: self.order_updates.load(Ordering::Relaxed),
            events_dropped,
        }
    }
}

/// Atomic write: tmp sibling, then rename. A crash mid-write never leaves
/// a torn metrics file.
pub fn write_metrics_file(path: &Path, snapshot: &MetricsSnapshot) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot).context("metrics serialisation failed")?;
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}

pub async fn run_metrics_loop(
    metrics: Arc<Metrics>,
    bus: EventBus,
    path: PathBuf,
    cancel: CancellationToken,
) {
    info!(path = %path.display(), "metrics loop started");
    let mut ticker = interval(METRICS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // One last flush on the way out.
                let _ = write_metrics_file(&path, &metrics.snapshot(bus.dropped_count()));
                info!("metrics loop stopped");
                return;
            }
            _ = ticker.tick() => {}
        }
        if let Err(e) = write_metrics_file(&path, &metrics.snapshot(bus.dropped_count())) {
            warn!(error = %e, "metrics flush failed");
        }
    }
}

// -----------------------------------------------------------------------------
// Equity snapshots
// -----------------------------------------------------------------------------

pub async fn run_equity_snapshot_loop(
    broker: Arc<dyn Broker>,
    store: Arc<Store>,
    cancel: CancellationToken,
) {
    info!(
        interval_secs = SNAPSHOT_INTERVAL.as_secs(),
        "equity snapshot loop started"
    );
    let mut ticker = interval(SNAPSHOT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("equity snapshot loop stopped");
                return;
            }
            _ = ticker.tick() => {}
        }
        if let Err(e) = take_equity_snapshot(broker.as_ref(), &store).await {
            warn!(error = %e, "equity snapshot failed");
        }
    }
}

/// Fetch the account and insert one equity_curve row.
pub async fn take_equity_snapshot(broker: &dyn Broker, store: &Store) -> Result<()> {
    let account = broker.account().await?;
    let daily_pnl = store.daily_realized_pnl()?;
    let inserted = store.insert_equity_snapshot(
        Utc::now(),
        account.portfolio_value,
        account.cash_available,
        daily_pnl,
    )?;
    debug!(
        portfolio_value = %account.portfolio_value,
        inserted,
        "equity snapshot taken"
    );
    Ok(())
}

// -----------------------------------------------------------------------------
// Daily reset
// -----------------------------------------------------------------------------

pub async fn run_daily_reset_loop(store: Arc<Store>, market_tz: Tz, cancel: CancellationToken) {
    info!(timezone = %market_tz, "daily reset loop started");
    let mut ticker = interval(RESET_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("daily reset loop stopped");
                return;
            }
            _ = ticker.tick() => {}
        }
        if let Err(e) = maybe_daily_reset(&store, market_tz) {
            warn!(error = %e, "daily reset check failed");
        }
    }
}

/// Reset the daily counters on the first check at/after 09:30 market time
/// on a weekday. Gated to once per day by `daily_reset_date`.
pub fn maybe_daily_reset(store: &Store, market_tz: Tz) -> Result<bool> {
    let local = Utc::now().with_timezone(&market_tz);
    if local.weekday().num_days_from_monday() >= 5 {
        return Ok(false);
    }
    if local.time() < DAILY_RESET_TIME {
        return Ok(false);
    }
    let today = local.date_naive();
    if store.daily_reset_date()? == Some(today) {
        return Ok(false);
    }

    store.apply_daily_reset(today)?;
    info!(date = %today, "daily counters reset");
    Ok(true)
}

// -----------------------------------------------------------------------------
// Graceful shutdown
// -----------------------------------------------------------------------------

/// Cancel everything open, flatten the book, take a final snapshot.
pub async fn graceful_shutdown(
    orders: &OrderManager,
    broker: &dyn Broker,
    store: &Store,
) -> Result<()> {
    info!("graceful shutdown: cancelling orders and flattening positions");
    orders
        .flatten_all()
        .await
        .context("flatten-all during shutdown failed")?;

    take_equity_snapshot(broker, store)
        .await
        .context("final equity snapshot failed")?;
    info!("graceful shutdown complete");
    Ok(())
}
