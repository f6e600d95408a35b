// =============================================================================
// HTTP Broker Client — REST execution endpoints with TTL caches
// =============================================================================
//
// SECURITY: the secret key is sent as a header and never logged or
// serialised. Endpoint selection is dual-gated: the live base URL is used
// only when mode = live AND allow_live_trading = true; any other
// combination stays on the paper endpoint.
//
// Read calls (clock, account, positions, orders) retry transient failures
// with exponential back-off. Writes (submit, cancel) never retry.
// =============================================================================

use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::types::{OrderStatus, Side, TradingMode};

use super::{Account, Broker, BrokerError, BrokerOrder, BrokerPosition, BrokerResult,
            MarketClock, OrderRequest};

const DEFAULT_PAPER_URL: &str = "https://paper-api.alpaca.markets";
const DEFAULT_LIVE_URL: &str = "https://api.alpaca.markets";

/// Account/positions cache TTL mandated by the broker contract.
const CACHE_TTL: Duration = Duration::from_secs(1);

/// Read-path retry schedule: attempt count and first back-off step.
const READ_RETRIES: u32 = 3;
const READ_BACKOFF_BASE_MS: u64 = 250;

struct Cached<T> {
    fetched_at: Instant,
    value: T,
}

/// REST execution client.
pub struct HttpBroker {
    client: reqwest::Client,
    base_url: String,
    dry_run: bool,
    kill_switch: bool,
    account_cache: Mutex<Option<Cached<Account>>>,
    positions_cache: Mutex<Option<Cached<Vec<BrokerPosition>>>>,
}

impl HttpBroker {
    /// Build the client from config + environment credentials
    /// (`MERIDIAN_API_KEY_ID` / `MERIDIAN_API_SECRET_KEY`).
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let key = std::env::var("MERIDIAN_API_KEY_ID").unwrap_or_default();
        let secret = std::env::var("MERIDIAN_API_SECRET_KEY").unwrap_or_default();

        let base_url = if config.live_trading_armed() {
            config
                .endpoints
                .live_url
                .clone()
                .unwrap_or_else(|| DEFAULT_LIVE_URL.to_string())
        } else {
            if config.mode == TradingMode::Live {
                warn!("mode=live but allowLiveTrading is not set — staying on paper endpoint");
            }
            config
                .endpoints
                .paper_url
                .clone()
                .unwrap_or_else(|| DEFAULT_PAPER_URL.to_string())
        };

        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&key) {
            headers.insert("APCA-API-KEY-ID", val);
        }
        if let Ok(mut val) = HeaderValue::from_str(&secret) {
            val.set_sensitive(true);
            headers.insert("APCA-API-SECRET-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.endpoints.timeout_seconds))
            .build()?;

        info!(base_url = %base_url, dry_run = config.dry_run, "broker client initialised");

        Ok(Self {
            client,
            base_url,
            dry_run: config.dry_run,
            kill_switch: config.kill_switch,
            account_cache: Mutex::new(None),
            positions_cache: Mutex::new(None),
        })
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> BrokerResult<T> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e))?;
        decode_response(resp).await
    }

    /// Read with exponential back-off on transient failures.
    async fn get_json_retry<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> BrokerResult<T> {
        let mut attempt = 0;
        loop {
            match self.get_json::<T>(path).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < READ_RETRIES => {
                    let backoff =
                        Duration::from_millis(READ_BACKOFF_BASE_MS * (1 << attempt));
                    warn!(path, attempt, backoff_ms = backoff.as_millis() as u64,
                          error = %e, "transient read failure — backing off");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn invalidate_positions_cache(&self) {
        *self.positions_cache.lock() = None;
    }

    fn synthetic_order(request: &OrderRequest) -> BrokerOrder {
        let now = Utc::now();
        BrokerOrder {
            broker_order_id: format!("dry-{}", Uuid::new_v4()),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            filled_quantity: Decimal::ZERO,
            average_fill_price: Decimal::ZERO,
            status: OrderStatus::Accepted,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait::async_trait]
impl Broker for HttpBroker {
    #[instrument(skip(self), name = "broker::clock")]
    async fn clock(&self) -> BrokerResult<MarketClock> {
        // Deliberately uncached: risk checks must see the real clock.
        let wire: ClockWire = self.get_json_retry("/v2/clock").await?;
        Ok(MarketClock {
            is_open: wire.is_open,
            next_open_utc: wire.next_open.with_timezone(&Utc),
            next_close_utc: wire.next_close.with_timezone(&Utc),
            fetched_at: Utc::now(),
        })
    }

    #[instrument(skip(self), name = "broker::account")]
    async fn account(&self) -> BrokerResult<Account> {
        {
            let cache = self.account_cache.lock();
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(cached.value.clone());
                }
            }
        }

        let wire: AccountWire = self.get_json_retry("/v2/account").await?;
        let account = wire.into_account()?;
        *self.account_cache.lock() = Some(Cached {
            fetched_at: Instant::now(),
            value: account.clone(),
        });
        Ok(account)
    }

    #[instrument(skip(self), name = "broker::positions")]
    async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        {
            let cache = self.positions_cache.lock();
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(cached.value.clone());
                }
            }
        }

        let wire: Vec<PositionWire> = self.get_json_retry("/v2/positions").await?;
        let positions = wire
            .into_iter()
            .map(PositionWire::into_position)
            .collect::<BrokerResult<Vec<_>>>()?;
        *self.positions_cache.lock() = Some(Cached {
            fetched_at: Instant::now(),
            value: positions.clone(),
        });
        Ok(positions)
    }

    #[instrument(skip(self), name = "broker::open_orders")]
    async fn open_orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
        let wire: Vec<OrderWire> = self
            .get_json_retry("/v2/orders?status=open&limit=500")
            .await?;
        wire.into_iter().map(OrderWire::into_order).collect()
    }

    #[instrument(skip(self), name = "broker::order_by_id")]
    async fn order_by_id(&self, broker_order_id: &str) -> BrokerResult<Option<BrokerOrder>> {
        let url = format!("{}/v2/orders/{broker_order_id}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let wire: OrderWire = decode_response(resp).await?;
        wire.into_order().map(Some)
    }

    #[instrument(skip(self, request), name = "broker::submit_order",
                 fields(symbol = %request.symbol, side = %request.side,
                        client_order_id = %request.client_order_id))]
    async fn submit_order(&self, request: &OrderRequest) -> BrokerResult<BrokerOrder> {
        if self.kill_switch {
            return Err(BrokerError::Fatal(
                "kill switch engaged — order submission refused".into(),
            ));
        }
        if self.dry_run {
            info!(
                symbol = %request.symbol,
                side = %request.side,
                quantity = %request.quantity,
                "dry run — returning synthetic accepted order"
            );
            return Ok(Self::synthetic_order(request));
        }

        let is_market = request.limit_price.is_zero();
        let body = serde_json::json!({
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "qty": request.quantity.to_string(),
            "type": if is_market { "market" } else { "limit" },
            "limit_price": if is_market { None } else { Some(request.limit_price.to_string()) },
            "time_in_force": "day",
            "client_order_id": request.client_order_id,
        });

        // Writes are never retried: a timeout here is ambiguous and the
        // deterministic client_order_id makes the outcome recoverable.
        let url = format!("{}/v2/orders", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BrokerError::Fatal(format!("order submission failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Fatal(format!(
                "order submission rejected ({status}): {text}"
            )));
        }

        let wire: OrderWire = resp
            .json()
            .await
            .map_err(|e| BrokerError::Fatal(format!("bad submission response: {e}")))?;
        let order = wire.into_order()?;

        // The next positions read must see the broker's truth.
        self.invalidate_positions_cache();

        debug!(broker_order_id = %order.broker_order_id, "order accepted by broker");
        Ok(order)
    }

    #[instrument(skip(self), name = "broker::cancel_order")]
    async fn cancel_order(&self, broker_order_id: &str) -> BrokerResult<()> {
        let url = format!("{}/v2/orders/{broker_order_id}", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Fatal(format!("cancel failed: {e}")))?;
        let status = resp.status();
        // 404 means the order is already gone; cancellation is idempotent.
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            let text = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Fatal(format!(
                "cancel rejected ({status}): {text}"
            )));
        }
        self.invalidate_positions_cache();
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Wire formats (numbers arrive as strings)
// -----------------------------------------------------------------------------

fn classify_reqwest(e: &reqwest::Error) -> BrokerError {
    if e.is_timeout() || e.is_connect() {
        BrokerError::Transient(e.to_string())
    } else {
        BrokerError::Fatal(e.to_string())
    }
}

async fn decode_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> BrokerResult<T> {
    let status = resp.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(BrokerError::Transient(format!("broker returned {status}")));
    }
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(BrokerError::Fatal(format!("broker returned {status}: {text}")));
    }
    resp.json::<T>()
        .await
        .map_err(|e| BrokerError::Fatal(format!("bad broker response: {e}")))
}

fn parse_decimal(field: &str, value: &str) -> BrokerResult<Decimal> {
    Decimal::from_str(value)
        .map_err(|e| BrokerError::Fatal(format!("bad decimal in {field}: {value:?} ({e})")))
}

#[derive(Debug, Deserialize)]
struct ClockWire {
    is_open: bool,
    next_open: DateTime<chrono::FixedOffset>,
    next_close: DateTime<chrono::FixedOffset>,
}

#[derive(Debug, Deserialize)]
struct AccountWire {
    cash: String,
    portfolio_value: String,
    daytrade_count: u32,
    account_blocked: bool,
    trading_blocked: bool,
}

impl AccountWire {
    fn into_account(self) -> BrokerResult<Account> {
        Ok(Account {
            cash_available: parse_decimal("account.cash", &self.cash)?,
            portfolio_value: parse_decimal("account.portfolio_value", &self.portfolio_value)?,
            day_trade_count: self.daytrade_count,
            is_tradable: !self.trading_blocked,
            is_account_restricted: self.account_blocked,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PositionWire {
    symbol: String,
    qty: String,
    avg_entry_price: String,
    #[serde(default)]
    current_price: Option<String>,
    #[serde(default)]
    unrealized_pl: Option<String>,
}

impl PositionWire {
    fn into_position(self) -> BrokerResult<BrokerPosition> {
        Ok(BrokerPosition {
            quantity: parse_decimal("position.qty", &self.qty)?,
            average_entry_price: parse_decimal(
                "position.avg_entry_price",
                &self.avg_entry_price,
            )?,
            current_price: match &self.current_price {
                Some(v) => parse_decimal("position.current_price", v)?,
                None => Decimal::ZERO,
            },
            unrealized_pnl: match &self.unrealized_pl {
                Some(v) => parse_decimal("position.unrealized_pl", v)?,
                None => Decimal::ZERO,
            },
            symbol: self.symbol,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OrderWire {
    id: String,
    client_order_id: String,
    symbol: String,
    side: String,
    qty: String,
    #[serde(default)]
    filled_qty: Option<String>,
    #[serde(default)]
    filled_avg_price: Option<String>,
    status: String,
    created_at: DateTime<chrono::FixedOffset>,
    updated_at: DateTime<chrono::FixedOffset>,
}

impl OrderWire {
    fn into_order(self) -> BrokerResult<BrokerOrder> {
        Ok(BrokerOrder {
            side: self
                .side
                .parse::<Side>()
                .map_err(BrokerError::Fatal)?,
            quantity: parse_decimal("order.qty", &self.qty)?,
            filled_quantity: match &self.filled_qty {
                Some(v) => parse_decimal("order.filled_qty", v)?,
                None => Decimal::ZERO,
            },
            average_fill_price: match &self.filled_avg_price {
                Some(v) => parse_decimal("order.filled_avg_price", v)?,
                None => Decimal::ZERO,
            },
            status: self
                .status
                .parse::<OrderStatus>()
                .map_err(BrokerError::Fatal)?,
            created_at: self.created_at.with_timezone(&Utc),
            updated_at: self.updated_at.with_timezone(&Utc),
            broker_order_id: self.id,
            client_order_id: self.client_order_id,
            symbol: self.symbol,
        })
    }
}
