// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order or signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Lower-case wire representation (`"buy"` / `"sell"`), also used in the
    /// deterministic client-order-id preimage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1 for buys, -1 for sells. Used when summing signed fill quantities.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Broker order status, normalised across transports.
///
/// Terminal statuses never transition back to non-terminal except through an
/// explicit reconciliation auto-apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingNew,
    Accepted,
    PartiallyFilled,
    Filled,
    Replaced,
    PendingCancel,
    PendingReplace,
    Canceled,
    Rejected,
    Expired,
    Suspended,
}

impl OrderStatus {
    /// Terminal set: {Filled, Canceled, Expired, Rejected}. A partial fill
    /// that is later cancelled lands on `Canceled` and is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }

    /// Terminal without a complete fill — the working order died. Used to
    /// clear a position's pending-exit flag.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Canceled | Self::Rejected | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingNew => "pending_new",
            Self::Accepted => "accepted",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Replaced => "replaced",
            Self::PendingCancel => "pending_cancel",
            Self::PendingReplace => "pending_replace",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Suspended => "suspended",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending_new" | "new" => Ok(Self::PendingNew),
            "accepted" => Ok(Self::Accepted),
            "partially_filled" => Ok(Self::PartiallyFilled),
            "filled" => Ok(Self::Filled),
            "replaced" => Ok(Self::Replaced),
            "pending_cancel" => Ok(Self::PendingCancel),
            "pending_replace" => Ok(Self::PendingReplace),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            "suspended" => Ok(Self::Suspended),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Whether the engine points at the paper or the live endpoint. Live
/// operation additionally requires the `allow_live_trading` gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Paper,
    Live,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Market-hours gate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    RegularOnly,
    IncludeExtended,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::RegularOnly
    }
}

/// Broker connectivity health as judged by the runtime reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerHealth {
    Healthy,
    Degraded,
}

impl BrokerHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
        }
    }
}

impl std::str::FromStr for BrokerHealth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            other => Err(format!("unknown broker health: {other}")),
        }
    }
}

/// A persisted order intent, uniquely keyed by the deterministic 16-hex-char
/// `client_order_id`. Created before the broker submission is attempted and
/// updated by order-update events and reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    /// Zero means a market order.
    pub limit_price: Decimal,
    pub status: OrderStatus,
    pub broker_order_id: Option<String>,
    pub filled_quantity: Decimal,
    pub average_fill_price: Decimal,
    /// Broker error message recorded when the submission was rejected.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderIntent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A single execution against a broker order. Idempotent by `dedupe_key`.
///
/// `quantity` is the incremental fill observed (signed sums over a symbol
/// reproduce the position); `cumulative_quantity` is the order's total
/// filled quantity at observation time and keys the deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub broker_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub cumulative_quantity: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Fill {
    /// `brokerOrderId:filledQuantity:averagePrice` — the uniqueness key that
    /// makes fill insertion idempotent across reconciliation passes.
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.broker_order_id,
            self.cumulative_quantity.normalize(),
            self.price.normalize()
        )
    }
}
