// =============================================================================
// Store — experiments, orders, trades, positions, exit rules
// =============================================================================
//
// All lifecycle transitions here follow the guarded-update discipline:
// `UPDATE … WHERE status = '…'` and inspect the changed-row count. Zero rows
// means another worker owns the transition and the caller skips.
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use tracing::warn;
use uuid::Uuid;

use crate::types::{
    EngineVariant, ExecutionMode, OptionType, OrderStatus, PositionStatus, SetupType,
};

use super::{
    ExitRuleRow, ExperimentRow, OrderRow, PolicyRow, PositionRow, Store, TradeRow,
};

/// Outcome of a single transactional paper fill.
#[derive(Debug, Clone)]
pub enum FillOutcome {
    /// Entry fill: a new position was opened.
    Opened { position: PositionRow, trade: TradeRow },
    /// Exit fill against a `closing` reservation: position is now closed.
    Closed {
        position: PositionRow,
        realized_pnl: f64,
        trade: TradeRow,
    },
    /// Exit fill for a partial: realized P&L accumulated, position stays open.
    Reduced {
        position: PositionRow,
        realized_pnl: f64,
        trade: TradeRow,
    },
    /// Exit fill with no matching position; trade recorded, nothing else.
    Unmatched { trade: TradeRow },
    /// The order was no longer pending — another worker already handled it.
    AlreadyHandled,
}

impl Store {
    // =========================================================================
    // Experiments
    // =========================================================================

    /// Idempotent insert keyed on `signal_id`: a lost uniqueness race
    /// re-reads and returns the existing row, so repeated calls are pure.
    pub async fn insert_experiment_if_absent(
        &self,
        signal_id: &str,
        variant: EngineVariant,
        assignment_hash: &str,
        split_percentage: f64,
        policy_version: &str,
        now_ms: i64,
    ) -> Result<ExperimentRow> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO experiments
                (id, signal_id, variant, assignment_hash, split_percentage, policy_version, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                signal_id,
                variant.as_str(),
                assignment_hash,
                split_percentage,
                policy_version,
                now_ms
            ],
        )
        .context("insert experiment")?;

        conn.query_row(
            "SELECT id, signal_id, variant, assignment_hash, split_percentage, policy_version, created_at_ms
             FROM experiments WHERE signal_id = ?1",
            params![signal_id],
            experiment_from_row,
        )
        .context("reread experiment")
    }

    pub async fn get_experiment_by_signal(&self, signal_id: &str) -> Result<Option<ExperimentRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT id, signal_id, variant, assignment_hash, split_percentage, policy_version, created_at_ms
             FROM experiments WHERE signal_id = ?1",
            params![signal_id],
            experiment_from_row,
        )
        .optional()
        .context("get experiment")
    }

    /// Experiment counts per variant since `since_ms`.
    pub async fn experiments_by_variant_since(&self, since_ms: i64) -> Result<Vec<(String, i64)>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT variant, COUNT(*) FROM experiments
             WHERE created_at_ms >= ?1 GROUP BY variant",
        )?;
        let rows = stmt.query_map(params![since_ms], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // =========================================================================
    // Execution policies
    // =========================================================================

    pub async fn insert_policy(&self, row: &PolicyRow) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO execution_policies
                (id, experiment_id, execution_mode, executed_engine, shadow_engine,
                 reason, policy_version, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.id,
                row.experiment_id,
                row.execution_mode.as_str(),
                row.executed_engine.map(|e| e.as_str()),
                row.shadow_engine.map(|e| e.as_str()),
                row.reason,
                row.policy_version,
                row.created_at_ms,
            ],
        )
        .context("insert policy")?;
        Ok(())
    }

    pub async fn get_policy_by_experiment(&self, experiment_id: &str) -> Result<Option<PolicyRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT id, experiment_id, execution_mode, executed_engine, shadow_engine,
                    reason, policy_version, created_at_ms
             FROM execution_policies WHERE experiment_id = ?1
             ORDER BY created_at_ms DESC LIMIT 1",
            params![experiment_id],
            policy_from_row,
        )
        .optional()
        .context("get policy")
    }

    // =========================================================================
    // Orders
    // =========================================================================

    /// Insert a paper entry order iff none exists yet for this
    /// (signal, engine, order_type). Returns `None` when the uniqueness
    /// constraint suppressed the insert, which is the at-most-once guarantee.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_entry_order(
        &self,
        signal_id: &str,
        engine: EngineVariant,
        experiment_id: &str,
        symbol: &str,
        option_symbol: &str,
        strike: f64,
        expiration: &str,
        option_type: OptionType,
        quantity: i64,
        setup_type: SetupType,
        now_ms: i64,
    ) -> Result<Option<OrderRow>> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock().await;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO orders
                    (id, signal_id, engine, experiment_id, symbol, option_symbol, strike,
                     expiration, option_type, quantity, order_type, status, setup_type, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'paper', 'pending_execution', ?11, ?12)",
                params![
                    id,
                    signal_id,
                    engine.as_str(),
                    experiment_id,
                    symbol,
                    option_symbol,
                    strike,
                    expiration,
                    option_type.as_str(),
                    quantity,
                    setup_type.as_str(),
                    now_ms,
                ],
            )
            .context("insert entry order")?;

        if changed == 0 {
            return Ok(None);
        }
        conn.query_row(
            &format!("SELECT {ORDER_COLS} FROM orders WHERE id = ?1"),
            params![id],
            order_from_row,
        )
        .map(Some)
        .context("reread entry order")
    }

    /// Insert an exit order (no signal, no uniqueness constraint pressure:
    /// NULL signal_ids are distinct under SQLite's UNIQUE semantics).
    pub async fn insert_exit_order(
        &self,
        position: &PositionRow,
        quantity: i64,
        now_ms: i64,
    ) -> Result<OrderRow> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO orders
                (id, signal_id, engine, experiment_id, symbol, option_symbol, strike,
                 expiration, option_type, quantity, order_type, status, setup_type, created_at_ms)
             VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'paper', 'pending_execution', ?10, ?11)",
            params![
                id,
                position.engine.map(|e| e.as_str()),
                position.experiment_id,
                position.symbol,
                position.option_symbol,
                position.strike,
                position.expiration,
                position.option_type.as_str(),
                quantity,
                position.setup_type.map(|s| s.as_str()),
                now_ms,
            ],
        )
        .context("insert exit order")?;

        conn.query_row(
            &format!("SELECT {ORDER_COLS} FROM orders WHERE id = ?1"),
            params![id],
            order_from_row,
        )
        .context("reread exit order")
    }

    /// Oldest `pending_execution` paper orders, FIFO.
    pub async fn pending_paper_orders(&self, limit: usize) -> Result<Vec<OrderRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ORDER_COLS} FROM orders
             WHERE status = 'pending_execution' AND order_type = 'paper'
             ORDER BY created_at_ms ASC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], order_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub async fn mark_order_failed(&self, order_id: &str) -> Result<bool> {
        let conn = self.lock().await;
        let changed = conn
            .execute(
                "UPDATE orders SET status = 'failed'
                 WHERE id = ?1 AND status = 'pending_execution'",
                params![order_id],
            )
            .context("mark order failed")?;
        Ok(changed == 1)
    }

    /// Count of paper fills since `since_ms` (daily-cap input).
    pub async fn count_fills_since(&self, since_ms: i64) -> Result<i64> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM trades t
             JOIN orders o ON o.id = t.order_id
             WHERE o.order_type = 'paper' AND t.fill_timestamp_ms >= ?1",
            params![since_ms],
            |r| r.get(0),
        )
        .context("count fills")
    }

    // =========================================================================
    // Paper fill — the single-transaction state transition
    // =========================================================================

    /// Fill a pending paper order at `fill_price`: insert the trade, flip the
    /// order to `filled`, and apply the position-side effect — all in one
    /// transaction. Entry fills open a position; exit fills close a
    /// `closing` reservation or accumulate realized P&L for partials.
    pub async fn apply_paper_fill(
        &self,
        order: &OrderRow,
        fill_price: f64,
        bias_snapshot: Option<&str>,
        now_ms: i64,
    ) -> Result<FillOutcome> {
        let mut conn = self.lock().await;
        let tx = conn.transaction().context("begin fill transaction")?;

        // Flip the order first; zero rows means a sibling got here already.
        let changed = tx.execute(
            "UPDATE orders SET status = 'filled'
             WHERE id = ?1 AND status = 'pending_execution'",
            params![order.id],
        )?;
        if changed == 0 {
            // Nothing to roll back — no writes happened.
            return Ok(FillOutcome::AlreadyHandled);
        }

        let trade = TradeRow {
            id: Uuid::new_v4().to_string(),
            order_id: order.id.clone(),
            fill_price,
            fill_quantity: order.quantity,
            fill_timestamp_ms: now_ms,
            engine: order.engine,
            experiment_id: order.experiment_id.clone(),
        };
        tx.execute(
            "INSERT INTO trades (id, order_id, fill_price, fill_quantity, fill_timestamp_ms, engine, experiment_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                trade.id,
                trade.order_id,
                trade.fill_price,
                trade.fill_quantity,
                trade.fill_timestamp_ms,
                trade.engine.map(|e| e.as_str()),
                trade.experiment_id,
            ],
        )?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {POSITION_COLS} FROM positions
                     WHERE option_symbol = ?1 AND status IN ('open', 'closing')
                     ORDER BY entry_timestamp_ms ASC LIMIT 1"
                ),
                params![order.option_symbol],
                position_from_row,
            )
            .optional()?;

        let outcome = match (order.is_exit(), existing) {
            // ── Exit fill closing a reservation ─────────────────────────
            (true, Some(pos)) if pos.status == PositionStatus::Closing => {
                let realized = (fill_price - pos.entry_price) * pos.quantity as f64 * 100.0;
                let total = pos.realized_pnl.unwrap_or(0.0) + realized;
                let guarded = tx.execute(
                    "UPDATE positions
                     SET status = 'closed', exit_timestamp_ms = ?2, realized_pnl = ?3,
                         current_price = ?4, last_updated_ms = ?5
                     WHERE id = ?1 AND status = 'closing'",
                    params![pos.id, now_ms, total, fill_price, now_ms],
                )?;
                if guarded == 0 {
                    // Reservation vanished under us; record and surface.
                    warn!(position_id = %pos.id, "closing reservation lost during fill");
                    FillOutcome::Unmatched { trade: trade.clone() }
                } else {
                    let closed = tx.query_row(
                        &format!("SELECT {POSITION_COLS} FROM positions WHERE id = ?1"),
                        params![pos.id],
                        position_from_row,
                    )?;
                    FillOutcome::Closed {
                        position: closed,
                        realized_pnl: realized,
                        trade: trade.clone(),
                    }
                }
            }
            // ── Exit fill against a reduced (still open) position ───────
            (true, Some(pos)) => {
                let realized = (fill_price - pos.entry_price) * order.quantity as f64 * 100.0;
                tx.execute(
                    "UPDATE positions
                     SET realized_pnl = COALESCE(realized_pnl, 0) + ?2, last_updated_ms = ?3
                     WHERE id = ?1",
                    params![pos.id, realized, now_ms],
                )?;
                let updated = tx.query_row(
                    &format!("SELECT {POSITION_COLS} FROM positions WHERE id = ?1"),
                    params![pos.id],
                    position_from_row,
                )?;
                FillOutcome::Reduced {
                    position: updated,
                    realized_pnl: realized,
                    trade: trade.clone(),
                }
            }
            // ── Exit fill with no position at all ───────────────────────
            (true, None) => {
                warn!(order_id = %order.id, option_symbol = %order.option_symbol,
                      "exit fill without a matching position");
                FillOutcome::Unmatched { trade: trade.clone() }
            }
            // ── Entry fill: open a new position ─────────────────────────
            (false, _) => {
                let position_id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO positions
                        (id, symbol, option_symbol, strike, expiration, option_type, quantity,
                         entry_price, entry_timestamp_ms, status, engine, experiment_id,
                         setup_type, entry_bias_snapshot, current_price, last_updated_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'open', ?10, ?11, ?12, ?13, ?14, ?15)",
                    params![
                        position_id,
                        order.symbol,
                        order.option_symbol,
                        order.strike,
                        order.expiration,
                        order.option_type.as_str(),
                        order.quantity,
                        fill_price,
                        now_ms,
                        order.engine.map(|e| e.as_str()),
                        order.experiment_id,
                        order.setup_type.map(|s| s.as_str()),
                        bias_snapshot,
                        fill_price,
                        now_ms,
                    ],
                )?;
                let position = tx.query_row(
                    &format!("SELECT {POSITION_COLS} FROM positions WHERE id = ?1"),
                    params![position_id],
                    position_from_row,
                )?;
                FillOutcome::Opened { position, trade: trade.clone() }
            }
        };

        tx.commit().context("commit fill transaction")?;
        Ok(outcome)
    }

    // =========================================================================
    // Positions
    // =========================================================================

    pub async fn open_positions(&self, limit: usize) -> Result<Vec<PositionRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POSITION_COLS} FROM positions
             WHERE status = 'open' ORDER BY entry_timestamp_ms ASC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], position_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub async fn get_position(&self, id: &str) -> Result<Option<PositionRow>> {
        let conn = self.lock().await;
        conn.query_row(
            &format!("SELECT {POSITION_COLS} FROM positions WHERE id = ?1"),
            params![id],
            position_from_row,
        )
        .optional()
        .context("get position")
    }

    pub async fn count_open_positions(&self) -> Result<i64> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM positions WHERE status IN ('open', 'closing')",
            [],
            |r| r.get(0),
        )
        .context("count open positions")
    }

    /// Realized P&L over closed positions since `since_ms`.
    pub async fn realized_pnl_since(&self, since_ms: i64) -> Result<f64> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT COALESCE(SUM(realized_pnl), 0) FROM positions
             WHERE status = 'closed' AND exit_timestamp_ms >= ?1",
            params![since_ms],
            |r| r.get(0),
        )
        .context("realized pnl")
    }

    /// One-way `open -> closing` reservation. True iff this caller won.
    pub async fn reserve_position_close(
        &self,
        position_id: &str,
        exit_reason: &str,
        now_ms: i64,
    ) -> Result<bool> {
        let conn = self.lock().await;
        let changed = conn
            .execute(
                "UPDATE positions
                 SET status = 'closing', exit_reason = ?2, last_updated_ms = ?3
                 WHERE id = ?1 AND status = 'open'",
                params![position_id, exit_reason, now_ms],
            )
            .context("reserve position close")?;
        Ok(changed == 1)
    }

    /// Guarded quantity decrement for a partial exit. True iff the position
    /// was still open with at least `exit_quantity` contracts.
    pub async fn reduce_position_quantity(
        &self,
        position_id: &str,
        exit_quantity: i64,
        now_ms: i64,
    ) -> Result<bool> {
        let conn = self.lock().await;
        let changed = conn
            .execute(
                "UPDATE positions
                 SET quantity = quantity - ?2, last_updated_ms = ?3
                 WHERE id = ?1 AND status = 'open' AND quantity >= ?2",
                params![position_id, exit_quantity, now_ms],
            )
            .context("reduce position quantity")?;
        Ok(changed == 1)
    }

    /// Mark-to-market update from the position refresher.
    pub async fn update_position_mark(
        &self,
        position_id: &str,
        price: f64,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE positions SET current_price = ?2, last_updated_ms = ?3 WHERE id = ?1",
            params![position_id, price, now_ms],
        )
        .context("update position mark")?;
        Ok(())
    }

    /// Tighten the tracked stop level; only ever moves toward entry.
    pub async fn update_position_stop(
        &self,
        position_id: &str,
        stop_level: f64,
        now_ms: i64,
    ) -> Result<bool> {
        let conn = self.lock().await;
        let changed = conn
            .execute(
                "UPDATE positions SET stop_level = ?2, last_updated_ms = ?3
                 WHERE id = ?1 AND status = 'open'
                   AND (stop_level IS NULL OR stop_level < ?2)",
                params![position_id, stop_level, now_ms],
            )
            .context("update position stop")?;
        Ok(changed == 1)
    }

    // =========================================================================
    // Exit rules
    // =========================================================================

    /// Current enabled exit rule, newest first.
    pub async fn current_exit_rule(&self) -> Result<Option<ExitRuleRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT id, profit_target_percent, stop_loss_percent, max_hold_time_hours,
                    min_dte_exit, enabled, created_at_ms
             FROM exit_rules WHERE enabled = 1
             ORDER BY created_at_ms DESC LIMIT 1",
            [],
            exit_rule_from_row,
        )
        .optional()
        .context("current exit rule")
    }

    /// Seed the configured default rule when the table is empty.
    pub async fn seed_exit_rule_if_missing(
        &self,
        profit_target_percent: f64,
        stop_loss_percent: f64,
        max_hold_time_hours: f64,
        min_dte_exit: i64,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM exit_rules", [], |r| r.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO exit_rules
                    (id, profit_target_percent, stop_loss_percent, max_hold_time_hours,
                     min_dte_exit, enabled, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    profit_target_percent,
                    stop_loss_percent,
                    max_hold_time_hours,
                    min_dte_exit,
                    now_ms
                ],
            )
            .context("seed exit rule")?;
        }
        Ok(())
    }

    // =========================================================================
    // Collaborator snapshots
    // =========================================================================

    /// Persist a dealer-gamma snapshot for later analysis; best-effort.
    pub async fn insert_gex_snapshot(&self, gex: &crate::market::GexData, now_ms: i64) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO gex_snapshots (id, symbol, gex_state, dollar_gamma, flip_point, as_of_ms, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                gex.symbol,
                gex.gex_state.to_string(),
                gex.dollar_gamma,
                gex.flip_point,
                gex.as_of_ms,
                now_ms,
            ],
        )
        .context("insert gex snapshot")?;
        Ok(())
    }

    /// Record a shadow engine's virtual entry for A/B comparison.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_shadow_position(
        &self,
        signal_id: &str,
        experiment_id: &str,
        engine: EngineVariant,
        symbol: &str,
        option_symbol: &str,
        strike: f64,
        expiration: &str,
        quantity: i64,
        entry_price: f64,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO shadow_positions
                (id, signal_id, experiment_id, engine, symbol, option_symbol, strike,
                 expiration, quantity, entry_price, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                Uuid::new_v4().to_string(),
                signal_id,
                experiment_id,
                engine.as_str(),
                symbol,
                option_symbol,
                strike,
                expiration,
                quantity,
                entry_price,
                now_ms,
            ],
        )
        .context("insert shadow position")?;
        Ok(())
    }

    // =========================================================================
    // Recommendation audit
    // =========================================================================

    /// Audit-persist an engine recommendation (shadow or primary).
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_recommendation(
        &self,
        signal_id: &str,
        experiment_id: &str,
        engine: EngineVariant,
        is_shadow: bool,
        symbol: &str,
        direction: &str,
        option_symbol: &str,
        strike: f64,
        expiration: &str,
        quantity: i64,
        entry_price: f64,
        rationale: &str,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO decision_recommendations
                (id, signal_id, experiment_id, engine, is_shadow, symbol, direction,
                 option_symbol, strike, expiration, quantity, entry_price, rationale, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                Uuid::new_v4().to_string(),
                signal_id,
                experiment_id,
                engine.as_str(),
                is_shadow as i64,
                symbol,
                direction,
                option_symbol,
                strike,
                expiration,
                quantity,
                entry_price,
                rationale,
                now_ms,
            ],
        )
        .context("insert recommendation")?;
        Ok(())
    }

    // =========================================================================
    // UI queries
    // =========================================================================

    pub async fn recent_orders(&self, limit: usize) -> Result<Vec<OrderRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ORDER_COLS} FROM orders ORDER BY created_at_ms DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], order_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub async fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, order_id, fill_price, fill_quantity, fill_timestamp_ms, engine, experiment_id
             FROM trades ORDER BY fill_timestamp_ms DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], trade_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub async fn recent_positions(&self, limit: usize) -> Result<Vec<PositionRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POSITION_COLS} FROM positions ORDER BY entry_timestamp_ms DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], position_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Orders filled within the trailing window, for the UI ticker.
    pub async fn recently_filled_orders(&self, since_ms: i64) -> Result<Vec<OrderRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ORDER_COLS} FROM orders o
             WHERE o.status = 'filled'
               AND EXISTS (SELECT 1 FROM trades t
                           WHERE t.order_id = o.id AND t.fill_timestamp_ms >= ?1)
             ORDER BY o.created_at_ms DESC"
        ))?;
        let rows = stmt.query_map(params![since_ms], order_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Filled paper order counts per engine since `since_ms`.
    pub async fn fills_by_engine_since(&self, since_ms: i64) -> Result<Vec<(String, i64)>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT COALESCE(o.engine, 'exit'), COUNT(*) FROM trades t
             JOIN orders o ON o.id = t.order_id
             WHERE t.fill_timestamp_ms >= ?1 GROUP BY o.engine",
        )?;
        let rows = stmt.query_map(params![since_ms], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

// =============================================================================
// Row mapping
// =============================================================================

const ORDER_COLS: &str = "id, signal_id, engine, experiment_id, symbol, option_symbol, strike, \
     expiration, option_type, quantity, order_type, status, setup_type, created_at_ms";

const POSITION_COLS: &str = "id, symbol, option_symbol, strike, expiration, option_type, \
     quantity, entry_price, entry_timestamp_ms, status, exit_reason, exit_timestamp_ms, \
     realized_pnl, engine, experiment_id, setup_type, entry_bias_snapshot, current_price, \
     stop_level, last_updated_ms";

fn experiment_from_row(r: &Row<'_>) -> rusqlite::Result<ExperimentRow> {
    let variant: String = r.get(2)?;
    Ok(ExperimentRow {
        id: r.get(0)?,
        signal_id: r.get(1)?,
        variant: EngineVariant::parse(&variant).unwrap_or(EngineVariant::A),
        assignment_hash: r.get(3)?,
        split_percentage: r.get(4)?,
        policy_version: r.get(5)?,
        created_at_ms: r.get(6)?,
    })
}

fn policy_from_row(r: &Row<'_>) -> rusqlite::Result<PolicyRow> {
    let mode: String = r.get(2)?;
    let executed: Option<String> = r.get(3)?;
    let shadow: Option<String> = r.get(4)?;
    Ok(PolicyRow {
        id: r.get(0)?,
        experiment_id: r.get(1)?,
        execution_mode: ExecutionMode::parse(&mode).unwrap_or(ExecutionMode::ShadowOnly),
        executed_engine: executed.as_deref().and_then(EngineVariant::parse),
        shadow_engine: shadow.as_deref().and_then(EngineVariant::parse),
        reason: r.get(5)?,
        policy_version: r.get(6)?,
        created_at_ms: r.get(7)?,
    })
}

fn order_from_row(r: &Row<'_>) -> rusqlite::Result<OrderRow> {
    let engine: Option<String> = r.get(2)?;
    let option_type: String = r.get(8)?;
    let status: String = r.get(11)?;
    let setup: Option<String> = r.get(12)?;
    Ok(OrderRow {
        id: r.get(0)?,
        signal_id: r.get(1)?,
        engine: engine.as_deref().and_then(EngineVariant::parse),
        experiment_id: r.get(3)?,
        symbol: r.get(4)?,
        option_symbol: r.get(5)?,
        strike: r.get(6)?,
        expiration: r.get(7)?,
        option_type: OptionType::parse(&option_type).unwrap_or(OptionType::Call),
        quantity: r.get(9)?,
        order_type: r.get(10)?,
        status: OrderStatus::parse(&status).unwrap_or(OrderStatus::PendingExecution),
        setup_type: setup.as_deref().and_then(SetupType::parse),
        created_at_ms: r.get(13)?,
    })
}

fn trade_from_row(r: &Row<'_>) -> rusqlite::Result<TradeRow> {
    let engine: Option<String> = r.get(5)?;
    Ok(TradeRow {
        id: r.get(0)?,
        order_id: r.get(1)?,
        fill_price: r.get(2)?,
        fill_quantity: r.get(3)?,
        fill_timestamp_ms: r.get(4)?,
        engine: engine.as_deref().and_then(EngineVariant::parse),
        experiment_id: r.get(6)?,
    })
}

fn exit_rule_from_row(r: &Row<'_>) -> rusqlite::Result<ExitRuleRow> {
    Ok(ExitRuleRow {
        id: r.get(0)?,
        profit_target_percent: r.get(1)?,
        stop_loss_percent: r.get(2)?,
        max_hold_time_hours: r.get(3)?,
        min_dte_exit: r.get(4)?,
        enabled: r.get::<_, i64>(5)? != 0,
        created_at_ms: r.get(6)?,
    })
}

fn position_from_row(r: &Row<'_>) -> rusqlite::Result<PositionRow> {
    let option_type: String = r.get(5)?;
    let status: String = r.get(9)?;
    let engine: Option<String> = r.get(13)?;
    let setup: Option<String> = r.get(15)?;
    Ok(PositionRow {
        id: r.get(0)?,
        symbol: r.get(1)?,
        option_symbol: r.get(2)?,
        strike: r.get(3)?,
        expiration: r.get(4)?,
        option_type: OptionType::parse(&option_type).unwrap_or(OptionType::Call),
        quantity: r.get(6)?,
        entry_price: r.get(7)?,
        entry_timestamp_ms: r.get(8)?,
        status: PositionStatus::parse(&status).unwrap_or(PositionStatus::Open),
        exit_reason: r.get(10)?,
        exit_timestamp_ms: r.get(11)?,
        realized_pnl: r.get(12)?,
        engine: engine.as_deref().and_then(EngineVariant::parse),
        experiment_id: r.get(14)?,
        setup_type: setup.as_deref().and_then(SetupType::parse),
        entry_bias_snapshot: r.get(16)?,
        current_price: r.get(17)?,
        stop_level: r.get(18)?,
        last_updated_ms: r.get(19)?,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest;
    use crate::ingest::NormalizedSignal;
    use crate::types::Direction;

    const NOW: i64 = 1_710_513_000_000;

    async fn store_with_signal() -> (Store, super::super::SignalRow) {
        let store = Store::open_in_memory().unwrap();
        let iso = ingest::iso_from_ms(NOW);
        let sig = NormalizedSignal {
            symbol: "SPY".to_string(),
            direction: Direction::Long,
            timeframe: "5m".to_string(),
            event_timestamp_ms: NOW,
            event_timestamp_iso: iso.clone(),
            fingerprint: ingest::fingerprint("SPY", Direction::Long, "5m", &iso),
        };
        let row = store.insert_signal(&sig, "{}", NOW).await.unwrap();
        (store, row)
    }

    async fn insert_test_entry_order(store: &Store, signal_id: &str) -> OrderRow {
        store
            .insert_entry_order(
                signal_id,
                EngineVariant::A,
                "exp-1",
                "SPY",
                "SPY240419C00500000",
                500.0,
                "2024-04-19",
                OptionType::Call,
                2,
                SetupType::Swing,
                NOW,
            )
            .await
            .unwrap()
            .expect("first insert should create the order")
    }

    #[tokio::test]
    async fn experiment_upsert_is_idempotent() {
        let (store, signal) = store_with_signal().await;
        let first = store
            .insert_experiment_if_absent(&signal.id, EngineVariant::A, "abc123", 0.5, "v1.0", NOW)
            .await
            .unwrap();
        let second = store
            .insert_experiment_if_absent(&signal.id, EngineVariant::B, "zzz999", 0.9, "v2.0", NOW + 1)
            .await
            .unwrap();
        // The second call returns the original row untouched.
        assert_eq!(first.id, second.id);
        assert_eq!(second.variant, EngineVariant::A);
        assert_eq!(second.assignment_hash, "abc123");
    }

    #[tokio::test]
    async fn entry_order_uniqueness_per_signal_engine() {
        let (store, signal) = store_with_signal().await;
        let first = insert_test_entry_order(&store, &signal.id).await;
        assert_eq!(first.status, OrderStatus::PendingExecution);

        // Re-running the orchestrator must not create a second order.
        let dup = store
            .insert_entry_order(
                &signal.id,
                EngineVariant::A,
                "exp-1",
                "SPY",
                "SPY240419C00500000",
                500.0,
                "2024-04-19",
                OptionType::Call,
                2,
                SetupType::Swing,
                NOW + 5,
            )
            .await
            .unwrap();
        assert!(dup.is_none());

        // A different engine may still enter.
        let other = store
            .insert_entry_order(
                &signal.id,
                EngineVariant::B,
                "exp-1",
                "SPY",
                "SPY240419C00500000",
                500.0,
                "2024-04-19",
                OptionType::Call,
                1,
                SetupType::Swing,
                NOW + 6,
            )
            .await
            .unwrap();
        assert!(other.is_some());
    }

    #[tokio::test]
    async fn entry_fill_opens_position_in_one_transaction() {
        let (store, signal) = store_with_signal().await;
        let order = insert_test_entry_order(&store, &signal.id).await;

        let outcome = store
            .apply_paper_fill(&order, 5.10, Some("{\"bias\":\"bullish\"}"), NOW + 10)
            .await
            .unwrap();
        match outcome {
            FillOutcome::Opened { position, trade } => {
                assert_eq!(position.status, PositionStatus::Open);
                assert_eq!(position.quantity, 2);
                assert!((position.entry_price - 5.10).abs() < 1e-9);
                assert_eq!(position.entry_bias_snapshot.as_deref(), Some("{\"bias\":\"bullish\"}"));
                assert!((trade.fill_price - 5.10).abs() < 1e-9);
                assert_eq!(trade.fill_quantity, 2);
            }
            other => panic!("expected Opened, got {other:?}"),
        }

        // Re-filling the same order is a no-op.
        let again = store.apply_paper_fill(&order, 5.10, None, NOW + 11).await.unwrap();
        assert!(matches!(again, FillOutcome::AlreadyHandled));
    }

    #[tokio::test]
    async fn exit_fill_closes_reserved_position() {
        let (store, signal) = store_with_signal().await;
        let order = insert_test_entry_order(&store, &signal.id).await;
        store.apply_paper_fill(&order, 5.00, None, NOW + 10).await.unwrap();

        let open = store.open_positions(10).await.unwrap();
        assert_eq!(open.len(), 1);
        let pos = &open[0];

        assert!(store
            .reserve_position_close(&pos.id, "STOP_LOSS_HIT", NOW + 20)
            .await
            .unwrap());
        // Second reservation loses the race.
        assert!(!store
            .reserve_position_close(&pos.id, "STOP_LOSS_HIT", NOW + 21)
            .await
            .unwrap());

        let exit = store.insert_exit_order(pos, pos.quantity, NOW + 22).await.unwrap();
        assert!(exit.is_exit());

        let outcome = store.apply_paper_fill(&exit, 2.00, None, NOW + 30).await.unwrap();
        match outcome {
            FillOutcome::Closed { position, realized_pnl, .. } => {
                assert_eq!(position.status, PositionStatus::Closed);
                // (2.00 - 5.00) * 2 * 100 = -600
                assert!((realized_pnl + 600.0).abs() < 1e-6);
                assert_eq!(position.exit_reason.as_deref(), Some("STOP_LOSS_HIT"));
                assert!(position.exit_timestamp_ms.is_some());
            }
            other => panic!("expected Closed, got {other:?}"),
        }

        assert_eq!(store.count_open_positions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn partial_exit_reduces_and_accumulates_pnl() {
        let (store, signal) = store_with_signal().await;
        let order = insert_test_entry_order(&store, &signal.id).await;
        store.apply_paper_fill(&order, 5.00, None, NOW + 10).await.unwrap();
        let pos = store.open_positions(10).await.unwrap().remove(0);

        // Reserve 1 of 2 contracts.
        assert!(store.reduce_position_quantity(&pos.id, 1, NOW + 20).await.unwrap());
        let exit = store.insert_exit_order(&pos, 1, NOW + 21).await.unwrap();

        let outcome = store.apply_paper_fill(&exit, 7.50, None, NOW + 30).await.unwrap();
        match outcome {
            FillOutcome::Reduced { position, realized_pnl, .. } => {
                assert_eq!(position.status, PositionStatus::Open);
                assert_eq!(position.quantity, 1);
                // (7.50 - 5.00) * 1 * 100 = 250
                assert!((realized_pnl - 250.0).abs() < 1e-6);
                assert!((position.realized_pnl.unwrap() - 250.0).abs() < 1e-6);
            }
            other => panic!("expected Reduced, got {other:?}"),
        }

        // Cannot reduce below remaining quantity.
        assert!(!store.reduce_position_quantity(&pos.id, 5, NOW + 40).await.unwrap());
    }

    #[tokio::test]
    async fn stop_level_only_tightens() {
        let (store, signal) = store_with_signal().await;
        let order = insert_test_entry_order(&store, &signal.id).await;
        store.apply_paper_fill(&order, 5.00, None, NOW + 10).await.unwrap();
        let pos = store.open_positions(10).await.unwrap().remove(0);

        assert!(store.update_position_stop(&pos.id, 3.00, NOW + 20).await.unwrap());
        assert!(store.update_position_stop(&pos.id, 3.50, NOW + 21).await.unwrap());
        // Widening is refused.
        assert!(!store.update_position_stop(&pos.id, 2.00, NOW + 22).await.unwrap());
    }

    #[tokio::test]
    async fn daily_fill_count_and_pnl_windows() {
        let (store, signal) = store_with_signal().await;
        let order = insert_test_entry_order(&store, &signal.id).await;
        store.apply_paper_fill(&order, 5.00, None, NOW + 10).await.unwrap();

        assert_eq!(store.count_fills_since(NOW).await.unwrap(), 1);
        assert_eq!(store.count_fills_since(NOW + 60_000).await.unwrap(), 0);
        assert!((store.realized_pnl_since(NOW).await.unwrap()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn exit_rule_seeding_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store
            .seed_exit_rule_if_missing(50.0, 50.0, 720.0, 7, NOW)
            .await
            .unwrap();
        store
            .seed_exit_rule_if_missing(99.0, 99.0, 1.0, 1, NOW + 1)
            .await
            .unwrap();

        let rule = store.current_exit_rule().await.unwrap().unwrap();
        assert_eq!(rule.profit_target_percent, Some(50.0));
        assert_eq!(rule.min_dte_exit, Some(7));
        assert!(rule.enabled);
    }
}
