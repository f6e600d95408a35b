// =============================================================================
// Notifier — user-visible alerts for capital-affecting events
// =============================================================================
//
// Concrete delivery backends (Slack, SMTP) live outside this repository;
// the engine ships the contract and a log-backed implementation so every
// alert at least lands in the structured log stream.
// =============================================================================

use tracing::{error, warn};

/// Events that must surface to a human.
#[derive(Debug, Clone)]
pub enum Alert {
    CircuitBreakerTripped { count: u32 },
    DailyLossExceeded { message: String },
    DrawdownTransition { from: String, to: String },
    GhostPositionDetected { symbol: String },
    ReconciliationFailed { message: String },
    OrderSubmissionFailed { symbol: String, message: String },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Default backend: structured log lines at warn/error.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, alert: Alert) {
        match alert {
            Alert::CircuitBreakerTripped { count } => {
                error!(count, "ALERT: circuit breaker tripped — trading stopped until manual reset");
            }
            Alert::DailyLossExceeded { message } => {
                error!(%message, "ALERT: daily loss limit exceeded");
            }
            Alert::DrawdownTransition { from, to } => {
                warn!(%from, %to, "ALERT: drawdown level transition");
            }
            Alert::GhostPositionDetected { symbol } => {
                warn!(%symbol, "ALERT: ghost position detected and cleared");
            }
            Alert::ReconciliationFailed { message } => {
                error!(%message, "ALERT: reconciliation failed");
            }
            Alert::OrderSubmissionFailed { symbol, message } => {
                error!(%symbol, %message, "ALERT: order submission failed");
            }
        }
    }
}
