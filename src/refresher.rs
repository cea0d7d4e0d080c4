// =============================================================================
// Position Refresher — periodic mark-to-market over open positions
// =============================================================================
//
// Revalues every open position at the live mid and pushes the updated row
// to realtime subscribers. Purely advisory: the refresher never transitions
// position state, and a missing quote for one contract never aborts the
// sweep.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

use crate::market::MarketDataProvider;
use crate::realtime::RealtimeHub;
use crate::store::Store;

/// Positions refreshed per sweep.
const REFRESH_LIMIT: usize = 500;

pub struct PositionRefresher {
    store: Store,
    market: Arc<dyn MarketDataProvider>,
    realtime: Arc<RealtimeHub>,
}

impl PositionRefresher {
    pub fn new(store: Store, market: Arc<dyn MarketDataProvider>, realtime: Arc<RealtimeHub>) -> Self {
        Self {
            store,
            market,
            realtime,
        }
    }

    pub async fn run_once(&self) -> Result<()> {
        let positions = self.store.open_positions(REFRESH_LIMIT).await?;
        if positions.is_empty() {
            return Ok(());
        }
        debug!(count = positions.len(), "refreshing open positions");

        for position in &positions {
            let Ok(expiration) = NaiveDate::parse_from_str(&position.expiration, "%Y-%m-%d")
            else {
                warn!(position_id = %position.id, "unparseable expiration — skipping");
                continue;
            };

            let quote = match self
                .market
                .option_quote(
                    &position.symbol,
                    position.strike,
                    expiration,
                    position.option_type,
                )
                .await
            {
                Ok(Some(quote)) if quote.mid > 0.0 => quote,
                Ok(_) => {
                    debug!(position_id = %position.id, "no market — skipping revalue");
                    continue;
                }
                Err(e) => {
                    warn!(position_id = %position.id, error = %e, "quote failed — continuing");
                    continue;
                }
            };

            let now_ms = Utc::now().timestamp_millis();
            self.store
                .update_position_mark(&position.id, quote.mid, now_ms)
                .await?;

            if let Some(updated) = self.store.get_position(&position.id).await? {
                self.realtime.publish_position_update(&updated);
            }
        }
        Ok(())
    }
}
