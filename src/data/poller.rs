// =============================================================================
// Stream Poller — HTTP poll loops for bars and order updates
// =============================================================================
//
// Two independent tasks:
//
//   bar loop     — every 60 s, fetch the latest bars for the whole universe
//                  in batches of 25 symbols per request and feed them to the
//                  DataHandler (which dedupes, persists, publishes).
//
//   order loop   — every 2 s, refresh every non-terminal order intent from
//                  the broker, at most 10 in flight at a time; a change in
//                  status or filled quantity publishes an OrderUpdate event.
//
// Both loops treat errors as per-iteration: log, skip, try again next tick.
// =============================================================================

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::bus::{Event, EventBus};
use crate::store::Store;

use super::{DataHandler, MarketDataSource};

/// Symbols per batched bars request.
const BAR_BATCH_SIZE: usize = 25;
/// Bars fetched per symbol per poll; two so a just-closed bar is never
/// missed across a tick boundary.
const BARS_PER_POLL: usize = 2;
/// Bar poll cadence.
const BAR_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Order-update poll cadence.
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Concurrent order fetches per cycle.
const ORDER_POLL_CONCURRENCY: usize = 10;

/// Poll bars for `symbols` until cancelled.
pub async fn run_bar_poll_loop(
    source: Arc<dyn MarketDataSource>,
    handler: Arc<DataHandler>,
    symbols: Vec<String>,
    timeframe: String,
    cancel: CancellationToken,
) {
    info!(
        symbols = symbols.len(),
        timeframe = %timeframe,
        interval_secs = BAR_POLL_INTERVAL.as_secs(),
        "bar poll loop started"
    );

    let mut ticker = interval(BAR_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("bar poll loop stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        for chunk in symbols.chunks(BAR_BATCH_SIZE) {
            match source
                .get_bars_multi(chunk, &timeframe, BARS_PER_POLL)
                .await
            {
                Ok(bars) => {
                    debug!(batch = chunk.len(), bars = bars.len(), "bars fetched");
                    for bar in bars {
                        if let Err(e) = handler.on_raw_bar(bar) {
                            warn!(error = %e, "bar ingestion failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(batch = chunk.len(), error = %e, "bar poll failed — next tick retries");
                }
            }
        }
    }
}

/// Poll broker state for every non-terminal intent until cancelled.
pub async fn run_order_update_loop(
    broker: Arc<dyn Broker>,
    store: Arc<Store>,
    bus: EventBus,
    cancel: CancellationToken,
) {
    info!(
        interval_secs = ORDER_POLL_INTERVAL.as_secs_f64(),
        concurrency = ORDER_POLL_CONCURRENCY,
        "order update loop started"
    );

    let mut ticker = interval(ORDER_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("order update loop stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let open = match store.open_order_intents() {
            Ok(open) => open,
            Err(e) => {
                warn!(error = %e, "could not list open intents");
                continue;
            }
        };
        if open.is_empty() {
            continue;
        }

        let broker = broker.clone();
        let fetches = stream::iter(
            open.into_iter()
                .filter(|intent| intent.broker_order_id.is_some()),
        )
        .map(|intent| {
            let broker = broker.clone();
            async move {
                let broker_id = intent.broker_order_id.clone().unwrap_or_default();
                (intent, broker.order_by_id(&broker_id).await)
            }
        })
        .buffer_unordered(ORDER_POLL_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

        for (intent, result) in fetches {
            match result {
                Ok(Some(order)) => {
                    let changed = order.status != intent.status
                        || order.filled_quantity != intent.filled_quantity;
                    if changed {
                        debug!(
                            client_order_id = %order.client_order_id,
                            status = %order.status,
                            filled = %order.filled_quantity,
                            "order state changed"
                        );
                        bus.publish(Event::OrderUpdate(order));
                    }
                }
                Ok(None) => {
                    warn!(
                        client_order_id = %intent.client_order_id,
                        "broker no longer knows this order — leaving to reconciliation"
                    );
                }
                Err(e) => {
                    warn!(
                        client_order_id = %intent.client_order_id,
                        error = %e,
                        "order status fetch failed"
                    );
                }
            }
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
    use chrono::Utc;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::broker::{
        Account, BrokerError, BrokerOrder, BrokerPosition, BrokerResult, MarketClock,
        OrderRequest,
    };
    use crate::types::{OrderIntent, OrderStatus, Side};

    /// Broker stub that serves a fixed set of orders and counts fetches.
    struct StubBroker {
        orders: Mutex<Vec<BrokerOrder>>,
        fetches: Mutex<u32>,
    }

    #[async_trait]
    impl Broker for StubBroker {
        async fn clock(&self) -> BrokerResult<MarketClock> {
            Err(BrokerError::Fatal("not used".into()))
        }
        async fn account(&self) -> BrokerResult<Account> {
            Err(BrokerError::Fatal("not used".into()))
        }
        async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
            Ok(vec![])
        }
        async fn open_orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
            Ok(self.orders.lock().clone())
        }
        async fn order_by_id(&self, broker_order_id: &str) -> BrokerResult<Option<BrokerOrder>> {
            *self.fetches.lock() += 1;
            Ok(self
                .orders
                .lock()
                .iter()
                .find(|o| o.broker_order_id == broker_order_id)
                .cloned())
        }
        async fn submit_order(&self, _request: &OrderRequest) -> BrokerResult<BrokerOrder> {
            Err(BrokerError::Fatal("not used".into()))
        }
        async fn cancel_order(&self, _broker_order_id: &str) -> BrokerResult<()> {
            Ok(())
        }
    }

    fn accepted_intent(id: &str, broker_id: &str) -> OrderIntent {
        OrderIntent {
            client_order_id: id.to_string(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            quantity: dec!(33),
            limit_price: Decimal::ZERO,
            status: OrderStatus::Accepted,
            broker_order_id: Some(broker_id.to_string()),
            filled_quantity: Decimal::ZERO,
            average_fill_price: Decimal::ZERO,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn broker_order(broker_id: &str, client_id: &str, status: OrderStatus) -> BrokerOrder {
        BrokerOrder {
            broker_order_id: broker_id.to_string(),
            client_order_id: client_id.to_string(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            quantity: dec!(33),
            filled_quantity: if status == OrderStatus::Filled {
                dec!(33)
            } else {
                Decimal::ZERO
            },
            average_fill_price: if status == OrderStatus::Filled {
                dec!(150.25)
            } else {
                Decimal::ZERO
            },
            status,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn changed_order_publishes_update() {
        let store = Arc::new(crate::store::Store::open_in_memory().unwrap());
        store
            .insert_order_intent(&accepted_intent("1111111111111111", "b-1"))
            .unwrap();

        let broker = Arc::new(StubBroker {
            orders: Mutex::new(vec![broker_order("b-1", "1111111111111111", OrderStatus::Filled)]),
            fetches: Mutex::new(0),
        });

        let (bus, mut rx) = crate::bus::channel();
        let cancel = CancellationToken::new();
        let loop_handle = tokio::spawn(run_order_update_loop(
            broker.clone(),
            store,
            bus,
            cancel.clone(),
        ));

        // First tick fires immediately under paused time; let it run.
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        loop_handle.await.unwrap();

        assert!(*broker.fetches.lock() >= 1);

        // The update reached the bus.
        match rx.try_recv_main() {
            Some(Event::OrderUpdate(order)) => {
                assert_eq!(order.status, OrderStatus::Filled);
                assert_eq!(order.filled_quantity, dec!(33));
            }
            other => panic!("expected an order update, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_order_publishes_nothing() {
        let store = Arc::new(crate::store::Store::open_in_memory().unwrap());
        store
            .insert_order_intent(&accepted_intent("1111111111111111", "b-1"))
            .unwrap();

        let broker = Arc::new(StubBroker {
            orders: Mutex::new(vec![broker_order(
                "b-1",
                "1111111111111111",
                OrderStatus::Accepted,
            )]),
            fetches: Mutex::new(0),
        });

        let (bus, mut rx) = crate::bus::channel();
        let cancel = CancellationToken::new();
        let loop_handle = tokio::spawn(run_order_update_loop(
            broker,
            store,
            bus,
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        loop_handle.await.unwrap();

        assert!(rx.try_recv_main().is_none());
    }
}
