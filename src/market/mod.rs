// =============================================================================
// Market Data — provider trait, circuit breaker, static fixture provider
// =============================================================================
//
// Vendor clients live behind `MarketDataProvider`. The engine never talks to
// a vendor directly: the orchestrator, paper executor, exit monitor, and
// refresher all consume the trait, so tests and local runs swap in the
// static provider without touching worker code.
//
// Every call is expected to complete within the configured timeout; callers
// wrap invocations with `tokio::time::timeout`. Consecutive transport
// failures trip a circuit breaker that is surfaced on /monitoring/status.
// =============================================================================

pub mod coalesce;
pub mod http;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{GexState, OptionType};

// =============================================================================
// Types
// =============================================================================

/// One row of an option chain as delivered by the vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionRow {
    pub option_symbol: String,
    pub underlying: String,
    pub strike: f64,
    /// Expiration date (vendor-local calendar date).
    pub expiration: NaiveDate,
    pub option_type: OptionType,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    /// Implied volatility as a fraction (0.25 = 25%).
    pub iv: f64,
    pub open_interest: i64,
    pub volume: i64,
}

impl OptionRow {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Bid/ask spread as a percentage of mid. Unquotable rows report 100%.
    pub fn spread_pct(&self) -> f64 {
        let mid = self.mid();
        if mid <= 0.0 {
            return 100.0;
        }
        (self.ask - self.bid).max(0.0) / mid * 100.0
    }

    /// Calendar days to expiration from `today`.
    pub fn dte(&self, today: NaiveDate) -> i64 {
        (self.expiration - today).num_days()
    }
}

/// Bid/ask/mid for one contract.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OptionQuote {
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
}

impl OptionQuote {
    pub fn spread_pct(&self) -> f64 {
        if self.mid <= 0.0 {
            return 100.0;
        }
        (self.ask - self.bid).max(0.0) / self.mid * 100.0
    }
}

/// Dealer-gamma snapshot for one underlying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GexData {
    pub symbol: String,
    pub gex_state: GexState,
    pub dollar_gamma: f64,
    pub flip_point: Option<f64>,
    pub as_of_ms: i64,
}

/// Trading-session snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketHours {
    pub is_market_open: bool,
    pub minutes_until_close: i64,
}

// =============================================================================
// Provider trait
// =============================================================================

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Last traded price of the underlying.
    async fn stock_price(&self, symbol: &str) -> Result<f64>;

    /// Quote for one contract; `None` when the vendor has no market.
    async fn option_quote(
        &self,
        symbol: &str,
        strike: f64,
        expiration: NaiveDate,
        option_type: OptionType,
    ) -> Result<Option<OptionQuote>>;

    /// Full chain for the underlying.
    async fn options_chain(&self, symbol: &str) -> Result<Vec<OptionRow>>;

    /// Dealer-gamma snapshot.
    async fn gex(&self, symbol: &str) -> Result<GexData>;

    /// Session clock.
    async fn market_hours(&self) -> Result<MarketHours>;

    /// Name used in monitoring output.
    fn provider_name(&self) -> &'static str;

    /// Circuit-breaker reading for monitoring; providers without a breaker
    /// report nothing.
    fn breaker_snapshot(&self) -> Option<BreakerSnapshot> {
        None
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

/// Consecutive failures before the breaker opens.
const BREAKER_THRESHOLD: u32 = 5;
/// How long an open breaker blocks calls before probing again (ms).
const BREAKER_COOLDOWN_MS: i64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    consecutive_failures: u32,
    state: BreakerState,
    opened_at_ms: i64,
}

/// Counts consecutive transport failures and blocks calls while open.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    inner: RwLock<BreakerInner>,
}

/// Serializable snapshot for /monitoring/status.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: &'static str,
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(BreakerInner {
                consecutive_failures: 0,
                state: BreakerState::Closed,
                opened_at_ms: 0,
            }),
        }
    }

    /// Whether a call may proceed right now. An open breaker transitions to
    /// half-open after the cooldown, letting a single probe through.
    pub fn allow(&self, now_ms: i64) -> bool {
        let mut inner = self.inner.write();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if now_ms - inner.opened_at_ms >= BREAKER_COOLDOWN_MS {
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        inner.consecutive_failures = 0;
        inner.state = BreakerState::Closed;
    }

    pub fn record_failure(&self, now_ms: i64) {
        let mut inner = self.inner.write();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= BREAKER_THRESHOLD
            || inner.state == BreakerState::HalfOpen
        {
            inner.state = BreakerState::Open;
            inner.opened_at_ms = now_ms;
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().state == BreakerState::Open
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.read();
        BreakerSnapshot {
            name: self.name,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}

// =============================================================================
// Static provider — fixtures for tests and vendor-less local runs
// =============================================================================

/// In-memory provider with settable fixtures. Useful both for tests and for
/// running the engine without a vendor gateway configured.
#[derive(Default)]
pub struct StaticMarketData {
    prices: RwLock<HashMap<String, f64>>,
    quotes: RwLock<HashMap<String, OptionQuote>>,
    chains: RwLock<HashMap<String, Vec<OptionRow>>>,
    gex: RwLock<HashMap<String, GexData>>,
    hours: RwLock<MarketHoursState>,
}

#[derive(Debug, Clone, Copy)]
struct MarketHoursState(MarketHours);

impl Default for MarketHoursState {
    fn default() -> Self {
        Self(MarketHours {
            is_market_open: true,
            minutes_until_close: 240,
        })
    }
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.write().insert(symbol.to_string(), price);
    }

    pub fn set_quote(&self, key: &str, quote: OptionQuote) {
        self.quotes.write().insert(key.to_string(), quote);
    }

    pub fn remove_quote(&self, key: &str) {
        self.quotes.write().remove(key);
    }

    pub fn set_chain(&self, symbol: &str, chain: Vec<OptionRow>) {
        self.chains.write().insert(symbol.to_string(), chain);
    }

    pub fn set_gex(&self, symbol: &str, data: GexData) {
        self.gex.write().insert(symbol.to_string(), data);
    }

    pub fn set_market_hours(&self, hours: MarketHours) {
        self.hours.write().0 = hours;
    }

    fn quote_key(symbol: &str, strike: f64, expiration: NaiveDate, option_type: OptionType) -> String {
        format!("{symbol}:{strike}:{expiration}:{option_type}")
    }
}

#[async_trait]
impl MarketDataProvider for StaticMarketData {
    async fn stock_price(&self, symbol: &str) -> Result<f64> {
        self.prices
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no fixture price for {symbol}"))
    }

    async fn option_quote(
        &self,
        symbol: &str,
        strike: f64,
        expiration: NaiveDate,
        option_type: OptionType,
    ) -> Result<Option<OptionQuote>> {
        let key = Self::quote_key(symbol, strike, expiration, option_type);
        Ok(self.quotes.read().get(&key).copied())
    }

    async fn options_chain(&self, symbol: &str) -> Result<Vec<OptionRow>> {
        Ok(self.chains.read().get(symbol).cloned().unwrap_or_default())
    }

    async fn gex(&self, symbol: &str) -> Result<GexData> {
        Ok(self
            .gex
            .read()
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| GexData {
                symbol: symbol.to_string(),
                gex_state: GexState::Neutral,
                dollar_gamma: 0.0,
                flip_point: None,
                as_of_ms: 0,
            }))
    }

    async fn market_hours(&self) -> Result<MarketHours> {
        Ok(self.hours.read().0)
    }

    fn provider_name(&self) -> &'static str {
        "static"
    }
}

/// Fixture quote key shared with tests.
pub fn static_quote_key(
    symbol: &str,
    strike: f64,
    expiration: NaiveDate,
    option_type: OptionType,
) -> String {
    StaticMarketData::quote_key(symbol, strike, expiration, option_type)
}

// =============================================================================
// Tests
// =============================================================================
