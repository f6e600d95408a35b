// =============================================================================
// Event Bus — dual-channel in-process message bus
// =============================================================================
//
// Two channels with different loss policies:
//
//   main (bounded, capacity 10 000) — bars, signals, order updates, intent
//   audit events. Overload sheds the *incoming* event (drop counter
//   incremented) so in-flight ordering is preserved; publish never blocks.
//
//   exit (unbounded) — exit signals protect capital and are never dropped.
//   Exit-producing work is rare and self-limiting (one signal per position
//   per scan), so the channel cannot grow without bound in practice.
//
// The dispatcher drains the exit channel to exhaustion before touching the
// main channel. A handler failure is logged and swallowed; the bus must
// outlive any single bad event.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broker::BrokerOrder;
use crate::data::Bar;
use crate::exits::ExitSignal;
use crate::strategy::Signal;
use crate::types::OrderIntent;

/// Bounded main-channel capacity.
pub const MAIN_CHANNEL_CAPACITY: usize = 10_000;

/// Everything that flows through the bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// A normalised bar, published by the bars handler.
    Bar(Bar),
    /// A strategy signal awaiting the risk gate.
    Signal(Signal),
    /// A broker-side order observation from the order-update poll loop.
    OrderUpdate(BrokerOrder),
    /// Audit record published after a submission attempt.
    IntentSubmitted(OrderIntent),
    /// An exit request. Routed through the unbounded channel.
    Exit(ExitSignal),
}

impl Event {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bar(_) => "bar",
            Self::Signal(_) => "signal",
            Self::OrderUpdate(_) => "order_update",
            Self::IntentSubmitted(_) => "intent_submitted",
            Self::Exit(_) => "exit",
        }
    }
}

/// Publisher half. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    main_tx: mpsc::Sender<Event>,
    exit_tx: mpsc::UnboundedSender<Event>,
    dropped: Arc<AtomicU64>,
}

/// Consumer half, owned by the single dispatcher task.
pub struct EventReceiver {
    main_rx: mpsc::Receiver<Event>,
    exit_rx: mpsc::UnboundedReceiver<Event>,
}

/// Create a connected bus/receiver pair.
pub fn channel() -> (EventBus, EventReceiver) {
    let (main_tx, main_rx) = mpsc::channel(MAIN_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = mpsc::unbounded_channel();
    (
        EventBus {
            main_tx,
            exit_tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        EventReceiver { main_rx, exit_rx },
    )
}

impl EventBus {
    /// Publish an event. Exit signals are always accepted. For everything
    /// else, returns `false` iff the main channel is full; the event is shed
    /// and the drop counter incremented. Never blocks.
    pub fn publish(&self, event: Event) -> bool {
        if matches!(event, Event::Exit(_)) {
            // Receiver dropping only happens at shutdown.
            if self.exit_tx.send(event).is_err() {
                warn!("exit channel closed — event discarded during shutdown");
            }
            return true;
        }

        match self.main_tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    kind = event.kind(),
                    dropped_total = total,
                    "main channel full — event dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("main channel closed — event discarded during shutdown");
                false
            }
        }
    }

    /// Total events shed from the main channel since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventReceiver {
    /// Run the dispatch loop until the token is cancelled. `handler` is
    /// invoked for one event at a time; exit events strictly first.
    pub async fn dispatch<F, Fut>(mut self, cancel: CancellationToken, mut handler: F)
    where
        F: FnMut(Event) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        loop {
            // Priority pass: drain every queued exit signal before anything
            // else gets a look-in.
            loop {
                match self.exit_rx.try_recv() {
                    Ok(event) => {
                        Self::run_handler(&mut handler, event).await;
                        continue;
                    }
                    Err(mpsc::error::TryRecvError::Empty)
                    | Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("dispatcher cancelled");
                    return;
                }
                Some(event) = self.exit_rx.recv() => {
                    Self::run_handler(&mut handler, event).await;
                }
                Some(event) = self.main_rx.recv() => {
                    Self::run_handler(&mut handler, event).await;
                }
                else => {
                    debug!("all bus senders dropped — dispatcher stopping");
                    return;
                }
            }
        }
    }

    /// Non-blocking pop from the main channel, for tests that assert on
    /// exactly what was published.
    #[cfg(test)]
    pub(crate) fn try_recv_main(&mut self) -> Option<Event> {
        self.main_rx.try_recv().ok()
    }

    /// Non-blocking pop from the exit channel, for tests.
    #[cfg(test)]
    pub(crate) fn try_recv_exit(&mut self) -> Option<Event> {
        self.exit_rx.try_recv().ok()
    }

    async fn run_handler<F, Fut>(handler: &mut F, event: Event)
    where
        F: FnMut(Event) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let kind = event.kind();
        if let Err(e) = handler(event).await {
            // One bad event must not kill the dispatcher.
            error!(kind, error = %e, "event handler failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::sync::Mutex;

    use crate::exits::ExitReason;
    use crate::types::Side;

    type EventLog = Arc<Mutex<Vec<&'static str>>>;

    fn bar_event() -> Event {
        Event::Bar(Bar {
            symbol: "AAPL".into(),
            timeframe: "1m".into(),
            timestamp: Utc::now(),
            open: dec!(150),
            high: dec!(151),
            low: dec!(149),
            close: dec!(150.5),
            volume: dec!(1000),
        })
    }

    fn exit_event() -> Event {
        Event::Exit(ExitSignal {
            symbol: "AAPL".into(),
            quantity: dec!(100),
            reason: ExitReason::AtrStopLoss,
            current_price: dec!(97),
            side: Side::Sell,
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn exit_events_always_accepted() {
        let (bus, _rx) = channel();
        for _ in 0..MAIN_CHANNEL_CAPACITY + 10 {
            assert!(bus.publish(exit_event()));
        }
        assert_eq!(bus.dropped_count(), 0);
    }

    #[tokio::test]
    async fn main_channel_sheds_incoming_when_full() {
        let (bus, _rx) = channel();
        for _ in 0..MAIN_CHANNEL_CAPACITY {
            assert!(bus.publish(bar_event()));
        }
        // Channel is now full; the next publishes are shed.
        assert!(!bus.publish(bar_event()));
        assert!(!bus.publish(bar_event()));
        assert_eq!(bus.dropped_count(), 2);
    }

    #[tokio::test]
    async fn drop_counter_is_monotonic() {
        let (bus, _rx) = channel();
        for _ in 0..MAIN_CHANNEL_CAPACITY + 5 {
            bus.publish(bar_event());
        }
        let first = bus.dropped_count();
        bus.publish(bar_event());
        assert!(bus.dropped_count() > first);
    }

    #[tokio::test]
    async fn exit_events_dispatch_before_main_events() {
        let (bus, rx) = channel();

        // Queue main events first, then exits; exits must still come out first.
        for _ in 0..3 {
            bus.publish(bar_event());
        }
        for _ in 0..2 {
            bus.publish(exit_event());
        }

        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let handler_log = log.clone();
        let handler_cancel = cancel.clone();
        let dispatcher = tokio::spawn(rx.dispatch(cancel.clone(), move |event| {
            let log = handler_log.clone();
            let cancel = handler_cancel.clone();
            async move {
                let mut log = log.lock().await;
                log.push(event.kind());
                if log.len() == 5 {
                    cancel.cancel();
                }
                Ok(())
            }
        }));

        dispatcher.await.unwrap();
        let log = log.lock().await;
        assert_eq!(*log, vec!["exit", "exit", "bar", "bar", "bar"]);
    }

    #[tokio::test]
    async fn handler_failure_does_not_stop_dispatch() {
        let (bus, rx) = channel();
        bus.publish(bar_event());
        bus.publish(bar_event());

        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let handler_log = log.clone();
        let handler_cancel = cancel.clone();
        let dispatcher = tokio::spawn(rx.dispatch(cancel.clone(), move |event| {
            let log = handler_log.clone();
            let cancel = handler_cancel.clone();
            async move {
                let mut log = log.lock().await;
                log.push(event.kind());
                if log.len() == 2 {
                    cancel.cancel();
                    return Ok(());
                }
                anyhow::bail!("simulated handler crash")
            }
        }));

        dispatcher.await.unwrap();
        assert_eq!(log.lock().await.len(), 2);
    }
}
