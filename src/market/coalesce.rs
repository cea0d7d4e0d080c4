// =============================================================================
// GEX Coalescer — single outstanding fetch per symbol
// =============================================================================
//
// Several workers may want the same symbol's dealer-gamma snapshot at the
// same instant. Each symbol gets an async mutex guarding a tiny freshness
// cache: concurrent callers queue on the mutex, the first one fetches, and
// the rest read the just-filled cache — one vendor request total.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use super::{GexData, MarketDataProvider};

/// Snapshots younger than this are served from cache (ms).
const FRESHNESS_MS: i64 = 5_000;

#[derive(Default)]
struct SymbolSlot {
    cached: Option<(i64, GexData)>,
}

/// Coalesces concurrent GEX fetches per symbol.
pub struct GexCoalescer {
    slots: RwLock<HashMap<String, Arc<Mutex<SymbolSlot>>>>,
}

impl GexCoalescer {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, symbol: &str) -> Arc<Mutex<SymbolSlot>> {
        if let Some(slot) = self.slots.read().get(symbol) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    /// Fetch the symbol's GEX snapshot, sharing one in-flight request among
    /// concurrent callers.
    pub async fn get(
        &self,
        market: &dyn MarketDataProvider,
        symbol: &str,
    ) -> Result<GexData> {
        let slot = self.slot(symbol);
        let mut guard = slot.lock().await;

        let now_ms = Utc::now().timestamp_millis();
        if let Some((at, data)) = &guard.cached {
            if now_ms - at < FRESHNESS_MS {
                return Ok(data.clone());
            }
        }

        let data = market.gex(symbol).await?;
        guard.cached = Some((now_ms, data.clone()));
        Ok(data)
    }
}

impl Default for GexCoalescer {
    fn default() -> Self {
        Self::new()
    }
}
