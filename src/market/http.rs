// =============================================================================
// HTTP Market Data Provider — vendor gateway client
// =============================================================================
//
// Thin client for the market-data gateway. The JSON shapes here mirror the
// gateway's REST endpoints; anything vendor-specific stays on the other
// side of that service. The reqwest client carries a hard per-request
// timeout so a stalled vendor can never wedge a worker tick.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::types::OptionType;

use super::{
    CircuitBreaker, GexData, MarketDataProvider, MarketHours, OptionQuote, OptionRow,
};

pub struct HttpMarketData {
    base_url: String,
    client: reqwest::Client,
    breaker: CircuitBreaker,
}

impl HttpMarketData {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        debug!(base_url = %base_url, timeout_ms, "HttpMarketData initialised");

        Self {
            base_url,
            client,
            breaker: CircuitBreaker::new("market_data"),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let now_ms = Utc::now().timestamp_millis();
        if !self.breaker.allow(now_ms) {
            anyhow::bail!("market data circuit breaker open");
        }

        let url = format!("{}{}", self.base_url, path);
        let result = async {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("GET {path} request failed"))?;
            let status = resp.status();
            if !status.is_success() {
                anyhow::bail!("GET {path} returned {status}");
            }
            resp.json::<T>()
                .await
                .with_context(|| format!("failed to parse {path} response"))
        }
        .await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) => {
                warn!(path, error = %e, "market data request failed");
                self.breaker.record_failure(Utc::now().timestamp_millis());
            }
        }
        result
    }
}

#[derive(Deserialize)]
struct PriceResponse {
    price: f64,
}

#[derive(Deserialize)]
struct QuoteResponse {
    bid: Option<f64>,
    ask: Option<f64>,
    mid: Option<f64>,
}

#[derive(Deserialize)]
struct ChainResponse {
    rows: Vec<OptionRow>,
}

#[derive(Deserialize)]
struct HoursResponse {
    is_market_open: bool,
    minutes_until_close: i64,
}

#[async_trait]
impl MarketDataProvider for HttpMarketData {
    #[instrument(skip(self), name = "market::stock_price")]
    async fn stock_price(&self, symbol: &str) -> Result<f64> {
        let resp: PriceResponse = self.get_json(&format!("/v1/price/{symbol}")).await?;
        Ok(resp.price)
    }

    #[instrument(skip(self), name = "market::option_quote")]
    async fn option_quote(
        &self,
        symbol: &str,
        strike: f64,
        expiration: NaiveDate,
        option_type: OptionType,
    ) -> Result<Option<OptionQuote>> {
        let path = format!(
            "/v1/option/{symbol}/quote?strike={strike}&expiration={expiration}&type={option_type}"
        );
        let resp: QuoteResponse = self.get_json(&path).await?;

        // The gateway reports an empty book as nulls rather than 404.
        let quote = match (resp.bid, resp.ask) {
            (Some(bid), Some(ask)) if ask > 0.0 => Some(OptionQuote {
                bid,
                ask,
                mid: resp.mid.unwrap_or((bid + ask) / 2.0),
            }),
            _ => None,
        };
        Ok(quote)
    }

    #[instrument(skip(self), name = "market::options_chain")]
    async fn options_chain(&self, symbol: &str) -> Result<Vec<OptionRow>> {
        let resp: ChainResponse = self.get_json(&format!("/v1/chain/{symbol}")).await?;
        Ok(resp.rows)
    }

    #[instrument(skip(self), name = "market::gex")]
    async fn gex(&self, symbol: &str) -> Result<GexData> {
        self.get_json(&format!("/v1/gex/{symbol}")).await
    }

    #[instrument(skip(self), name = "market::hours")]
    async fn market_hours(&self) -> Result<MarketHours> {
        let resp: HoursResponse = self.get_json("/v1/market-hours").await?;
        Ok(MarketHours {
            is_market_open: resp.is_market_open,
            minutes_until_close: resp.minutes_until_close,
        })
    }

    fn provider_name(&self) -> &'static str {
        "http_gateway"
    }

    fn breaker_snapshot(&self) -> Option<super::BreakerSnapshot> {
        Some(self.breaker.snapshot())
    }
}
