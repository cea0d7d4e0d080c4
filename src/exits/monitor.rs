// =============================================================================
// Exit Monitor — applies exit decisions to open positions
// =============================================================================
//
// Scans up to 200 open positions oldest-first. For each: fetch live market
// state, run the bias adjustment layer then the tier evaluator, and apply
// the resulting action through guarded store transitions:
//
//   FULL_EXIT     -> open->closing reservation, then one exit order.
//   PARTIAL_EXIT  -> guarded quantity decrement, then one exit order.
//   TIGHTEN_STOP  -> stop level update (only ever tightens).
//
// Zero-row updates mean another monitor won the race; skip. One position's
// data-access failure never aborts the batch.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::bias::{self, BiasReader};
use crate::config::AppConfig;
use crate::exits::decision::{evaluate, ExitDecision, ExitSnapshot};
use crate::market::MarketDataProvider;
use crate::realtime::RealtimeHub;
use crate::store::{ExitRuleRow, PositionRow, Store};
use crate::types::ExitAction;

/// Positions examined per scan.
const SCAN_LIMIT: usize = 200;

pub struct ExitMonitor {
    store: Store,
    market: Arc<dyn MarketDataProvider>,
    bias: Arc<dyn BiasReader>,
    realtime: Arc<RealtimeHub>,
    decision_engine_enabled: bool,
    /// Fired profit milestones per position id (process-local).
    milestones: RwLock<HashMap<String, HashSet<usize>>>,
}

impl ExitMonitor {
    pub fn new(
        store: Store,
        market: Arc<dyn MarketDataProvider>,
        bias: Arc<dyn BiasReader>,
        realtime: Arc<RealtimeHub>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            market,
            bias,
            realtime,
            decision_engine_enabled: config.enable_exit_decision_engine,
            milestones: RwLock::new(HashMap::new()),
        }
    }

    /// One scan over the open book.
    pub async fn run_once(&self) -> Result<()> {
        let Some(rule) = self.store.current_exit_rule().await? else {
            debug!("no enabled exit rule — skipping scan");
            return Ok(());
        };

        let positions = self.store.open_positions(SCAN_LIMIT).await?;
        if positions.is_empty() {
            return Ok(());
        }
        debug!(count = positions.len(), "exit monitor scanning positions");

        for position in &positions {
            if let Err(e) = self.evaluate_position(position, &rule).await {
                // One position's failure never aborts the batch.
                warn!(position_id = %position.id, error = %e, "exit evaluation failed — continuing");
            }
        }

        // Forget milestone state for positions no longer open.
        let open_ids: HashSet<&str> = positions.iter().map(|p| p.id.as_str()).collect();
        self.milestones.write().retain(|id, _| open_ids.contains(id.as_str()));

        Ok(())
    }

    async fn evaluate_position(&self, position: &PositionRow, rule: &ExitRuleRow) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();

        // ── Live market state ───────────────────────────────────────────
        let expiration = NaiveDate::parse_from_str(&position.expiration, "%Y-%m-%d")
            .with_context(|| format!("bad expiration on position {}", position.id))?;
        let quote = self
            .market
            .option_quote(
                &position.symbol,
                position.strike,
                expiration,
                position.option_type,
            )
            .await?
            .context("no quote for open position")?;
        let spot_price = self.market.stock_price(&position.symbol).await.unwrap_or(0.0);

        let bias_state = self.bias.current_state(&position.symbol).await.unwrap_or(None);

        // ── Bias adjustment layer runs ahead of the tier evaluator ──────
        if let Some(state) = &bias_state {
            if let Some(adj) = bias::exit_adjustment(position, state) {
                info!(
                    position_id = %position.id,
                    action = %adj.action,
                    reason = %adj.reason_code,
                    "bias adjustment forcing exit"
                );
                match adj.action {
                    ExitAction::FullExit => {
                        self.apply_full_exit(position, &adj.reason_code, now_ms).await?;
                        return Ok(());
                    }
                    ExitAction::PartialExit => {
                        let size = adj.size_percent.unwrap_or(50.0);
                        self.apply_partial_exit(position, size, &adj.reason_code, now_ms)
                            .await?;
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }

        if !self.decision_engine_enabled {
            return Ok(());
        }

        // ── Tier evaluation ─────────────────────────────────────────────
        let today = Utc::now().date_naive();
        let snapshot = ExitSnapshot {
            option_mid: quote.mid,
            spot_price,
            spread_pct: quote.spread_pct(),
            dte: (expiration - today).num_days(),
            thesis_valid: bias_state.as_ref().map(|b| b.thesis_valid).unwrap_or(true),
            htf_invalidation: bias_state
                .as_ref()
                .map(|b| b.htf_invalidation)
                .unwrap_or(false),
            regime: bias::regime_hint(bias_state.as_ref()),
        };

        let fired = self
            .milestones
            .read()
            .get(&position.id)
            .cloned()
            .unwrap_or_default();
        let decision = evaluate(position, rule, &snapshot, &fired, now_ms);

        self.apply_decision(position, &decision, now_ms).await
    }

    async fn apply_decision(
        &self,
        position: &PositionRow,
        decision: &ExitDecision,
        now_ms: i64,
    ) -> Result<()> {
        match decision.action {
            ExitAction::Hold => Ok(()),
            ExitAction::FullExit => {
                let reason = decision
                    .triggered_rules
                    .first()
                    .map(|s| s.as_str())
                    .unwrap_or("FULL_EXIT");
                info!(
                    position_id = %position.id,
                    reason,
                    urgency = %decision.urgency,
                    pnl_pct = format!("{:.1}", decision.metrics.option_pnl_pct),
                    "full exit decided"
                );
                self.apply_full_exit(position, reason, now_ms).await
            }
            ExitAction::PartialExit => {
                let size = decision.size_percent.unwrap_or(50.0);
                let reason = decision
                    .triggered_rules
                    .first()
                    .map(|s| s.as_str())
                    .unwrap_or("PARTIAL_EXIT");
                let applied = self
                    .apply_partial_exit(position, size, reason, now_ms)
                    .await?;
                if applied {
                    if let Some(index) = decision.milestone_index {
                        self.milestones
                            .write()
                            .entry(position.id.clone())
                            .or_default()
                            .insert(index);
                    }
                }
                Ok(())
            }
            ExitAction::TightenStop => {
                if let Some(level) = decision.new_stop_level {
                    let updated = self
                        .store
                        .update_position_stop(&position.id, level, now_ms)
                        .await?;
                    if updated {
                        info!(position_id = %position.id, stop_level = level, "stop tightened");
                    }
                }
                Ok(())
            }
        }
    }

    /// Reserve `open -> closing` and emit one exit order for the full size.
    async fn apply_full_exit(
        &self,
        position: &PositionRow,
        reason: &str,
        now_ms: i64,
    ) -> Result<()> {
        let reserved = self
            .store
            .reserve_position_close(&position.id, reason, now_ms)
            .await?;
        if !reserved {
            // Another monitor already owns the transition.
            debug!(position_id = %position.id, "close reservation lost — skipping");
            return Ok(());
        }

        let order = self
            .store
            .insert_exit_order(position, position.quantity, now_ms)
            .await?;
        info!(
            position_id = %position.id,
            order_id = %order.id,
            quantity = position.quantity,
            reason,
            "exit order created"
        );

        if let Ok(Some(updated)) = self.store.get_position(&position.id).await {
            self.realtime.publish_position_update(&updated);
        }
        Ok(())
    }

    /// Guarded decrement plus one exit order for the partial quantity.
    /// Returns true when this monitor applied the partial.
    async fn apply_partial_exit(
        &self,
        position: &PositionRow,
        size_percent: f64,
        reason: &str,
        now_ms: i64,
    ) -> Result<bool> {
        let exit_quantity =
            ((position.quantity as f64) * size_percent / 100.0).round() as i64;
        let exit_quantity = exit_quantity.max(1);

        // A partial that consumes the whole position is a full exit.
        if exit_quantity >= position.quantity {
            self.apply_full_exit(position, reason, now_ms).await?;
            return Ok(true);
        }

        let reduced = self
            .store
            .reduce_position_quantity(&position.id, exit_quantity, now_ms)
            .await?;
        if !reduced {
            debug!(position_id = %position.id, "partial reservation lost — skipping");
            return Ok(false);
        }

        let order = self
            .store
            .insert_exit_order(position, exit_quantity, now_ms)
            .await?;
        info!(
            position_id = %position.id,
            order_id = %order.id,
            exit_quantity,
            size_percent,
            reason,
            "partial exit order created"
        );

        if let Ok(Some(updated)) = self.store.get_position(&position.id).await {
            self.realtime.publish_position_update(&updated);
        }
        Ok(true)
    }
}

// =============================================================================
// Tests
// =============================================================================
