// =============================================================================
// Broker contract — execution endpoints only
// =============================================================================
//
// Market data lives behind its own contract (`crate::data`); the broker
// exposes nothing but execution: clock, account, positions, orders.
//
// Rules every conforming implementation must enforce:
//   - The market clock is fetched fresh on every call, never cached.
//   - Account and positions may be cached for at most 1 second.
//   - Order submission is fatal on failure (no automatic retry); reads may
//     retry with exponential back-off.
//   - A successful submission invalidates the positions cache.
//   - Kill switch fails submission; dry-run returns a synthetic accepted
//     order without contacting the broker.
// =============================================================================

pub mod http;

pub use http::HttpBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{OrderStatus, Side};

/// Broker failure, split by retryability.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Read-path failure worth retrying: timeouts, 5xx, connection resets.
    #[error("transient broker error: {0}")]
    Transient(String),
    /// Write-path or authentication failure. Never retried; increments the
    /// circuit breaker via the order manager.
    #[error("fatal broker error: {0}")]
    Fatal(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Market clock snapshot. `fetched_at` records the wall-clock instant of the
/// fetch so consumers can assert freshness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketClock {
    pub is_open: bool,
    pub next_open_utc: DateTime<Utc>,
    pub next_close_utc: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub cash_available: Decimal,
    pub portfolio_value: Decimal,
    pub day_trade_count: u32,
    pub is_tradable: bool,
    pub is_account_restricted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: Decimal,
    pub average_entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
}

/// An order as the broker sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub broker_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub average_fill_price: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Submission request. `limit_price` of zero means a market order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub limit_price: Decimal,
    pub client_order_id: String,
}

/// Execution endpoints. Implementations: the HTTP client below, mocks in
/// tests.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Fresh market clock. Implementations must not cache this.
    async fn clock(&self) -> BrokerResult<MarketClock>;

    /// Account snapshot; may be served from a cache up to 1 second old.
    async fn account(&self) -> BrokerResult<Account>;

    /// Open positions; may be served from a cache up to 1 second old.
    async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>>;

    async fn open_orders(&self) -> BrokerResult<Vec<BrokerOrder>>;

    async fn order_by_id(&self, broker_order_id: &str) -> BrokerResult<Option<BrokerOrder>>;

    /// Submit an order. Fatal on failure; never retried.
    async fn submit_order(&self, request: &OrderRequest) -> BrokerResult<BrokerOrder>;

    async fn cancel_order(&self, broker_order_id: &str) -> BrokerResult<()>;
}
