// =============================================================================
// Paper Executor — simulated fills over pending paper orders
// =============================================================================
//
// Polls `pending_execution` paper orders FIFO and fills each at the live
// mid plus a deterministic slippage adjustment (entries pay up, exits give
// up). The trade insert, order flip, and position transition run in one
// store transaction; the price fetch happens before the transaction opens
// so no DB lock is ever held across vendor I/O.
//
// A daily fill cap is enforced before and during the scan; hitting it
// mid-run stops the batch.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::bias::BiasReader;
use crate::config::AppConfig;
use crate::market::MarketDataProvider;
use crate::realtime::RealtimeHub;
use crate::risk::RiskGate;
use crate::store::{FillOutcome, OrderRow, Store};

/// Estimated spread as a fraction of mid when the book is synthetic.
const SPREAD_ESTIMATE_FRACTION: f64 = 0.02;
/// Fraction of the spread paid as slippage.
const SLIPPAGE_FRACTION: f64 = 0.25;

/// Deterministic slippage model: entries fill above mid, exits below.
pub fn slipped_fill_price(mid: f64, is_exit: bool) -> f64 {
    let slip = mid * SPREAD_ESTIMATE_FRACTION * SLIPPAGE_FRACTION;
    if is_exit {
        (mid - slip).max(0.0)
    } else {
        mid + slip
    }
}

pub struct PaperExecutor {
    store: Store,
    market: Arc<dyn MarketDataProvider>,
    realtime: Arc<RealtimeHub>,
    risk: RiskGate,
    bias: Arc<dyn BiasReader>,
    batch_size: usize,
}

impl PaperExecutor {
    pub fn new(
        store: Store,
        market: Arc<dyn MarketDataProvider>,
        realtime: Arc<RealtimeHub>,
        risk: RiskGate,
        bias: Arc<dyn BiasReader>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            market,
            realtime,
            risk,
            bias,
            batch_size: config.paper_executor_batch_size,
        }
    }

    /// One scan: fill pending orders up to the batch size and the remaining
    /// daily allowance.
    pub async fn run_once(&self) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let allowance = self.risk.remaining_daily_fills(now_ms).await?;
        if allowance == 0 {
            debug!("daily trade cap reached — skipping fill scan");
            return Ok(());
        }

        let limit = self.batch_size.min(allowance as usize);
        let orders = self.store.pending_paper_orders(limit).await?;
        if orders.is_empty() {
            return Ok(());
        }
        debug!(count = orders.len(), "paper executor scanning orders");

        let mut filled = 0i64;
        for order in &orders {
            if filled >= allowance {
                info!("daily trade cap reached mid-run — stopping batch");
                break;
            }
            match self.fill_order(order).await {
                Ok(true) => filled += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(order_id = %order.id, error = %e, "fill failed — marking order failed");
                    let _ = self.store.mark_order_failed(&order.id).await;
                }
            }
        }
        Ok(())
    }

    /// Fill one order. Returns true when a fill happened.
    async fn fill_order(&self, order: &OrderRow) -> Result<bool> {
        // Price first, transaction second.
        let expiration = parse_expiration(&order.expiration)?;
        let quote = self
            .market
            .option_quote(&order.symbol, order.strike, expiration, order.option_type)
            .await?;

        let Some(quote) = quote else {
            // Null price is a terminal failure for this order.
            warn!(order_id = %order.id, contract = %order.option_symbol,
                  "no market for contract — failing order");
            self.store.mark_order_failed(&order.id).await?;
            return Ok(false);
        };
        if quote.mid <= 0.0 {
            self.store.mark_order_failed(&order.id).await?;
            return Ok(false);
        }

        let fill_price = slipped_fill_price(quote.mid, order.is_exit());

        // Bias snapshot for new positions is captured before the
        // transaction opens; a failed read degrades to no snapshot.
        let bias_snapshot = if order.is_exit() {
            None
        } else {
            self.bias
                .current_state(&order.symbol)
                .await
                .unwrap_or(None)
                .and_then(|state| serde_json::to_string(&state).ok())
        };

        let now_ms = Utc::now().timestamp_millis();
        let outcome = self
            .store
            .apply_paper_fill(order, fill_price, bias_snapshot.as_deref(), now_ms)
            .await?;

        match outcome {
            FillOutcome::Opened { position, trade } => {
                info!(
                    order_id = %order.id,
                    position_id = %position.id,
                    fill_price = trade.fill_price,
                    quantity = trade.fill_quantity,
                    "entry filled — position opened"
                );
                self.realtime.publish_position_update(&position);
                self.publish_risk(now_ms).await;
                Ok(true)
            }
            FillOutcome::Closed {
                position,
                realized_pnl,
                trade,
            } => {
                let duration_min =
                    (trade.fill_timestamp_ms - position.entry_timestamp_ms) as f64 / 60_000.0;
                let cost_basis = position.entry_price * position.quantity as f64 * 100.0;
                let pnl_pct = if cost_basis > 0.0 {
                    realized_pnl / cost_basis * 100.0
                } else {
                    0.0
                };
                info!(
                    order_id = %order.id,
                    position_id = %position.id,
                    realized_pnl,
                    pnl_pct = format!("{pnl_pct:.1}"),
                    duration_min = format!("{duration_min:.0}"),
                    reason = position.exit_reason.as_deref().unwrap_or("unknown"),
                    "exit filled — position closed"
                );
                self.realtime.publish_position_closed(&position, realized_pnl);
                self.publish_risk(now_ms).await;
                Ok(true)
            }
            FillOutcome::Reduced {
                position,
                realized_pnl,
                ..
            } => {
                info!(
                    order_id = %order.id,
                    position_id = %position.id,
                    realized_pnl,
                    remaining = position.quantity,
                    "partial exit filled"
                );
                self.realtime.publish_position_update(&position);
                Ok(true)
            }
            FillOutcome::Unmatched { .. } => {
                warn!(order_id = %order.id, "fill had no matching position");
                Ok(true)
            }
            FillOutcome::AlreadyHandled => {
                debug!(order_id = %order.id, "order already handled by a sibling");
                Ok(false)
            }
        }
    }

    async fn publish_risk(&self, now_ms: i64) {
        let open = self.store.count_open_positions().await.unwrap_or(0);
        let daily_pnl = self
            .store
            .realized_pnl_since(crate::risk::day_start_ms(now_ms))
            .await
            .unwrap_or(0.0);
        let depth = self.store.queue_depth(now_ms).await.unwrap_or(0);
        self.realtime.publish_risk_update(open, daily_pnl, depth);
    }
}

fn parse_expiration(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("bad expiration '{raw}': {e}"))
}

// =============================================================================
// Tests
// =============================================================================
