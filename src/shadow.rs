// =============================================================================
// Shadow Executor — audit-store recommendations that never become orders
// =============================================================================
//
// When dual-paper trading is off, the non-primary engine's recommendation
// is recorded for later A/B comparison but produces no order, no fill, and
// no position. Converting shadows into a parallel paper book is a
// collaborator decision outside this core.
// =============================================================================

use anyhow::Result;
use chrono::Utc;
use tracing::debug;

use crate::engines::TradeRecommendation;
use crate::store::{SignalRow, Store};

pub struct ShadowExecutor {
    store: Store,
}

impl ShadowExecutor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Persist a shadow recommendation: an audit row plus a virtual entry
    /// in shadow_positions the comparison tooling marks against.
    pub async fn record(&self, signal: &SignalRow, rec: &TradeRecommendation) -> Result<()> {
        let experiment_id = rec.experiment_id.as_deref().unwrap_or("");
        let now_ms = Utc::now().timestamp_millis();

        self.store
            .insert_recommendation(
                &signal.id,
                experiment_id,
                rec.engine,
                true,
                &rec.symbol,
                rec.direction.as_str(),
                &rec.option_symbol,
                rec.strike,
                &rec.expiration,
                rec.quantity,
                rec.entry_price,
                &rec.rationale.join("; "),
                now_ms,
            )
            .await?;
        self.store
            .insert_shadow_position(
                &signal.id,
                experiment_id,
                rec.engine,
                &rec.symbol,
                &rec.option_symbol,
                rec.strike,
                &rec.expiration,
                rec.quantity,
                rec.entry_price,
                now_ms,
            )
            .await?;

        debug!(
            signal_id = %signal.id,
            engine = %rec.engine,
            contract = %rec.option_symbol,
            "shadow recommendation recorded"
        );
        Ok(())
    }
}
