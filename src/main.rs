// =============================================================================
// Meridian Trading Engine — Main Entry Point
// =============================================================================
//
// The engine starts on the paper endpoint unless BOTH live gates are set
// (mode = live and allowLiveTrading = true). Exit codes:
//
//   0  normal termination after graceful shutdown
//   1  fatal runtime error
//   2  configuration validation failure
//   3  startup reconciliation failure (report at
//      data/reconciliation_error.json)
// =============================================================================

mod broker;
mod bus;
mod config;
mod data;
mod drawdown;
mod engine;
mod exits;
mod housekeeping;
mod indicators;
mod notify;
mod orders;
mod positions;
mod reconcile;
mod risk;
mod store;
mod strategy;
mod types;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::broker::HttpBroker;
use crate::config::Config;
use crate::data::HttpMarketData;
use crate::engine::{Engine, EngineError};
use crate::notify::LogNotifier;
use crate::store::Store;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let _ = dotenv::dotenv();

    // ── 1. Configuration ─────────────────────────────────────────────
    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            // Logging is not up yet; stderr is all we have.
            eprintln!("configuration error: {e}");
            return 2;
        }
    };

    // ── 2. Logging: stdout + daily-rotated file ──────────────────────
    let log_dir = config.data_dir.join("logs");
    let file_appender = tracing_appender::rolling::daily(&log_dir, "meridian.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    info!(
        mode = %config.mode,
        live_armed = config.live_trading_armed(),
        dry_run = config.dry_run,
        config = %config_path,
        "meridian starting"
    );

    // ── 3. Store and external collaborators ──────────────────────────
    let store = match Store::open(&config.database_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "could not open store");
            return 1;
        }
    };
    let broker = match HttpBroker::from_config(&config) {
        Ok(broker) => Arc::new(broker),
        Err(e) => {
            error!(error = %e, "could not build broker client");
            return 1;
        }
    };
    let data_source = match HttpMarketData::from_config(&config) {
        Ok(source) => Arc::new(source),
        Err(e) => {
            error!(error = %e, "could not build market data client");
            return 1;
        }
    };

    // ── 4. Engine + root cancellation ────────────────────────────────
    let engine = Engine::new(
        config.clone(),
        store,
        broker,
        data_source,
        Arc::new(LogNotifier),
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received — stopping gracefully");
            signal_cancel.cancel();
        }
    });

    match engine.run(cancel).await {
        Ok(()) => {
            info!("meridian shut down complete");
            0
        }
        Err(EngineError::StartupReconciliation(e)) => {
            error!(error = %e, "startup reconciliation failed — see data/reconciliation_error.json");
            3
        }
        Err(EngineError::Fatal(e)) => {
            error!(error = %e, "fatal engine error");
            1
        }
    }
}
