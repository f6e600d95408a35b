// =============================================================================
// Market Data — normalised bars and the data-source contract
// =============================================================================
//
// The broker handles execution only; quotes and bars come through this
// contract. The shipped implementation polls HTTP endpoints (1-minute bars
// batched 25 symbols per request); a streaming implementation with the same
// event outputs would be a drop-in replacement, and consumers must not care
// which is in use.
// =============================================================================

pub mod handler;
pub mod poller;

pub use handler::DataHandler;

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

/// One OHLCV bar, uniquely keyed by (symbol, timeframe, timestamp).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: String,
    /// Always UTC; the bars handler rejects anything else at the boundary.
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    /// OHLCV sanity: positive prices, `low <= open,close <= high`,
    /// non-negative volume.
    pub fn is_valid(&self) -> bool {
        if self.open <= Decimal::ZERO
            || self.high <= Decimal::ZERO
            || self.low <= Decimal::ZERO
            || self.close <= Decimal::ZERO
            || self.volume < Decimal::ZERO
        {
            return false;
        }
        self.low <= self.high
            && self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
    }
}

/// National-best-bid-and-offer style quote snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Source of normalised bars and quote snapshots.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn get_bars(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Bar>>;

    async fn get_snapshot(&self, symbol: &str) -> Result<QuoteSnapshot>;

    /// Batched fetch used by the poll loop. The default just loops; the
    /// HTTP implementation overrides it with one multi-symbol request.
    async fn get_bars_multi(
        &self,
        symbols: &[String],
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        let mut out = Vec::new();
        for symbol in symbols {
            out.extend(self.get_bars(symbol, timeframe, limit).await?);
        }
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// HTTP implementation
// -----------------------------------------------------------------------------

const DEFAULT_DATA_URL: &str = "https://data.alpaca.markets";

/// HTTP market-data client. Credentials shared with the broker client.
pub struct HttpMarketData {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMarketData {
    pub fn from_config(config: &crate::config::Config) -> Result<Self> {
        let key = std::env::var("MERIDIAN_API_KEY_ID").unwrap_or_default();
        let secret = std::env::var("MERIDIAN_API_SECRET_KEY").unwrap_or_default();

        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&key) {
            headers.insert("APCA-API-KEY-ID", val);
        }
        if let Ok(mut val) = reqwest::header::HeaderValue::from_str(&secret) {
            val.set_sensitive(true);
            headers.insert("APCA-API-SECRET-KEY", val);
        }

        let base_url = config
            .endpoints
            .market_data_url
            .clone()
            .unwrap_or_else(|| DEFAULT_DATA_URL.to_string());

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(config.endpoints.timeout_seconds))
            .build()
            .context("failed to build market data client")?;

        info!(base_url = %base_url, "market data client initialised");
        Ok(Self { client, base_url })
    }

    async fn fetch_bars(
        &self,
        symbols: &[String],
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        let url = format!(
            "{}/v2/stocks/bars?symbols={}&timeframe={}&limit={}",
            self.base_url,
            symbols.join(","),
            wire_timeframe(timeframe),
            limit,
        );
        let resp: BarsWire = self
            .client
            .get(&url)
            .send()
            .await
            .context("bars request failed")?
            .error_for_status()
            .context("bars request rejected")?
            .json()
            .await
            .context("bad bars response")?;

        let mut out = Vec::new();
        for (symbol, bars) in resp.bars {
            for wire in bars {
                out.push(wire.into_bar(&symbol, timeframe)?);
            }
        }
        // Stable order: by symbol, then timestamp.
        out.sort_by(|a, b| (a.symbol.as_str(), a.timestamp).cmp(&(b.symbol.as_str(), b.timestamp)));
        Ok(out)
    }
}

#[async_trait]
impl MarketDataSource for HttpMarketData {
    async fn get_bars(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Bar>> {
        self.fetch_bars(&[symbol.to_string()], timeframe, limit).await
    }

    async fn get_snapshot(&self, symbol: &str) -> Result<QuoteSnapshot> {
        let url = format!("{}/v2/stocks/{symbol}/quotes/latest", self.base_url);
        let resp: LatestQuoteWire = self
            .client
            .get(&url)
            .send()
            .await
            .context("quote request failed")?
            .error_for_status()
            .context("quote request rejected")?
            .json()
            .await
            .context("bad quote response")?;
        resp.quote.into_snapshot()
    }

    async fn get_bars_multi(
        &self,
        symbols: &[String],
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        self.fetch_bars(symbols, timeframe, limit).await
    }
}

fn wire_timeframe(timeframe: &str) -> &str {
    match timeframe {
        "1m" => "1Min",
        "5m" => "5Min",
        "15m" => "15Min",
        "1h" => "1Hour",
        "1d" => "1Day",
        other => other,
    }
}

// -----------------------------------------------------------------------------
// Wire formats
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BarsWire {
    #[serde(default)]
    bars: std::collections::HashMap<String, Vec<BarWire>>,
}

#[derive(Debug, Deserialize)]
struct BarWire {
    t: DateTime<Utc>,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}

impl BarWire {
    fn into_bar(self, symbol: &str, timeframe: &str) -> Result<Bar> {
        // The feed serialises prices as JSON numbers; convert through the
        // canonical string form to keep the stored precision exact.
        let dec = |v: f64, field: &str| -> Result<Decimal> {
            Decimal::from_str(&format!("{v}"))
                .with_context(|| format!("bad {field} in bar for {symbol}"))
        };
        Ok(Bar {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            timestamp: self.t,
            open: dec(self.o, "open")?,
            high: dec(self.h, "high")?,
            low: dec(self.l, "low")?,
            close: dec(self.c, "close")?,
            volume: dec(self.v, "volume")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct LatestQuoteWire {
    quote: QuoteWire,
}

#[derive(Debug, Deserialize)]
struct QuoteWire {
    t: DateTime<Utc>,
    bp: f64,
    ap: f64,
    bs: f64,
    #[serde(rename = "as")]
    asz: f64,
}

impl QuoteWire {
    fn into_snapshot(self) -> Result<QuoteSnapshot> {
        let dec = |v: f64, field: &str| -> Result<Decimal> {
            Decimal::from_str(&format!("{v}")).with_context(|| format!("bad quote {field}"))
        };
        Ok(QuoteSnapshot {
            bid: dec(self.bp, "bid")?,
            ask: dec(self.ap, "ask")?,
            bid_size: dec(self.bs, "bid_size")?,
            ask_size: dec(self.asz, "ask_size")?,
            timestamp: self.t,
        })
    }
}
