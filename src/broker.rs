// =============================================================================
// Cache / Stream Broker — idempotency keys with TTL + named-stream publish
// =============================================================================
//
// The engine's broker needs are narrow: set-if-absent keys with a TTL (the
// bias pipeline's idempotency set), plain reads (bias snapshots written by
// the aggregator), and fire-and-forget publishes onto named streams. Redis
// backs production; an in-memory implementation backs tests and local runs
// without a REDIS_URL.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Set `key` iff absent, with a TTL. Returns true when this call set it.
    async fn set_idempotency_key(&self, key: &str, ttl_secs: u64) -> Result<bool>;

    /// Read a string value (e.g. a bias snapshot JSON blob).
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Append a JSON payload to a named stream.
    async fn publish(&self, stream: &str, payload: &serde_json::Value) -> Result<()>;

    fn broker_name(&self) -> &'static str;
}

// =============================================================================
// Redis implementation
// =============================================================================

pub struct RedisBroker {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid REDIS_URL")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("connect to redis")?;
        debug!("redis broker connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn set_idempotency_key(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .context("redis SET NX")?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("redis GET")
    }

    async fn publish(&self, stream: &str, payload: &serde_json::Value) -> Result<()> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(payload).context("serialize stream payload")?;
        let _: String = redis::cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg("payload")
            .arg(body)
            .query_async(&mut conn)
            .await
            .context("redis XADD")?;
        Ok(())
    }

    fn broker_name(&self) -> &'static str {
        "redis"
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    keys: HashMap<String, (String, Option<Instant>)>,
    streams: HashMap<String, Vec<serde_json::Value>>,
}

/// Process-local broker for tests and REDIS_URL-less development.
#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<MemoryInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: seed a value directly.
    pub fn put(&self, key: &str, value: &str) {
        self.inner
            .lock()
            .keys
            .insert(key.to_string(), (value.to_string(), None));
    }

    /// Test hook: entries published to a stream so far.
    pub fn stream_entries(&self, stream: &str) -> Vec<serde_json::Value> {
        self.inner
            .lock()
            .streams
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn set_idempotency_key(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some((_, expiry)) = inner.keys.get(key) {
            let live = expiry.map(|e| e > now).unwrap_or(true);
            if live {
                return Ok(false);
            }
        }
        inner.keys.insert(
            key.to_string(),
            ("1".to_string(), Some(now + Duration::from_secs(ttl_secs))),
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock();
        Ok(inner.keys.get(key).and_then(|(v, expiry)| {
            let live = expiry.map(|e| e > Instant::now()).unwrap_or(true);
            live.then(|| v.clone())
        }))
    }

    async fn publish(&self, stream: &str, payload: &serde_json::Value) -> Result<()> {
        self.inner
            .lock()
            .streams
            .entry(stream.to_string())
            .or_default()
            .push(payload.clone());
        Ok(())
    }

    fn broker_name(&self) -> &'static str {
        "memory"
    }
}
