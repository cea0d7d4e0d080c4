// =============================================================================
// Signal Store — durable SQLite layer shared by all workers
// =============================================================================
//
// A single `rusqlite::Connection` behind a tokio mutex, WAL journal mode.
// The schema is bootstrapped idempotently at open. All multi-row state
// transitions run inside one transaction, and claim-style updates report
// ownership through the changed-row count: zero rows means another worker
// won the race and the caller treats it as a no-op.
//
// Timestamps are stored as epoch milliseconds (UTC) so window queries
// (dedupe, retry gating, 24h summaries) are integer comparisons.
// =============================================================================

mod trading;

pub use trading::FillOutcome;

use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::ingest::NormalizedSignal;
use crate::types::{
    Direction, EngineVariant, ExecutionMode, OptionType, OrderStatus, PositionStatus, SetupType,
    SignalStatus,
};

/// Sliding dedupe window for identical (symbol, direction, timeframe).
pub const DEDUPE_WINDOW_MS: i64 = 60_000;

// =============================================================================
// Row types
// =============================================================================

/// A persisted trade signal.
#[derive(Debug, Clone, Serialize)]
pub struct SignalRow {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub timeframe: String,
    pub event_timestamp_ms: i64,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,
    pub status: SignalStatus,
    pub processed: bool,
    pub processing_lock: bool,
    pub queued_until_ms: Option<i64>,
    pub next_retry_at_ms: Option<i64>,
    pub processing_attempts: i64,
    pub experiment_id: Option<String>,
    pub processed_at_ms: Option<i64>,
    pub created_at_ms: i64,
}

/// Outcome class recorded for every webhook receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Accepted,
    Duplicate,
    InvalidSignature,
    InvalidPayload,
    Error,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Duplicate => "duplicate",
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidPayload => "invalid_payload",
            Self::Error => "error",
        }
    }
}

/// Append-only audit row for an HTTP receipt.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEventRow {
    pub request_id: String,
    pub signal_id: Option<String>,
    pub status: String,
    pub symbol: Option<String>,
    pub direction: Option<String>,
    pub timeframe: Option<String>,
    pub error_message: Option<String>,
    pub processing_time_ms: i64,
    pub created_at_ms: i64,
}

/// Deterministic A/B assignment for one signal.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentRow {
    pub id: String,
    pub signal_id: String,
    pub variant: EngineVariant,
    pub assignment_hash: String,
    pub split_percentage: f64,
    pub policy_version: String,
    pub created_at_ms: i64,
}

/// Persisted execution-policy decision for an experiment.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyRow {
    pub id: String,
    pub experiment_id: String,
    pub execution_mode: ExecutionMode,
    pub executed_engine: Option<EngineVariant>,
    pub shadow_engine: Option<EngineVariant>,
    pub reason: String,
    pub policy_version: String,
    pub created_at_ms: i64,
}

/// A paper order. Entry orders carry `signal_id` + `engine`; exit orders
/// carry neither.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRow {
    pub id: String,
    pub signal_id: Option<String>,
    pub engine: Option<EngineVariant>,
    pub experiment_id: Option<String>,
    pub symbol: String,
    pub option_symbol: String,
    pub strike: f64,
    pub expiration: String,
    pub option_type: OptionType,
    pub quantity: i64,
    pub order_type: String,
    pub status: OrderStatus,
    pub setup_type: Option<SetupType>,
    pub created_at_ms: i64,
}

impl OrderRow {
    /// Entry orders open positions; exit orders close or reduce them.
    pub fn is_exit(&self) -> bool {
        self.signal_id.is_none()
    }
}

/// A fill record, created iff an order transitioned to `filled`.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRow {
    pub id: String,
    pub order_id: String,
    pub fill_price: f64,
    pub fill_quantity: i64,
    pub fill_timestamp_ms: i64,
    pub engine: Option<EngineVariant>,
    pub experiment_id: Option<String>,
}

/// A paper position over one option contract.
#[derive(Debug, Clone, Serialize)]
pub struct PositionRow {
    pub id: String,
    pub symbol: String,
    pub option_symbol: String,
    pub strike: f64,
    pub expiration: String,
    pub option_type: OptionType,
    pub quantity: i64,
    pub entry_price: f64,
    pub entry_timestamp_ms: i64,
    pub status: PositionStatus,
    pub exit_reason: Option<String>,
    pub exit_timestamp_ms: Option<i64>,
    pub realized_pnl: Option<f64>,
    pub engine: Option<EngineVariant>,
    pub experiment_id: Option<String>,
    pub setup_type: Option<SetupType>,
    pub entry_bias_snapshot: Option<String>,
    pub current_price: Option<f64>,
    pub stop_level: Option<f64>,
    pub last_updated_ms: i64,
}

/// Policy row governing the exit monitor.
#[derive(Debug, Clone, Serialize)]
pub struct ExitRuleRow {
    pub id: String,
    pub profit_target_percent: Option<f64>,
    pub stop_loss_percent: Option<f64>,
    pub max_hold_time_hours: Option<f64>,
    pub min_dte_exit: Option<i64>,
    pub enabled: bool,
    pub created_at_ms: i64,
}

// =============================================================================
// Store
// =============================================================================

/// Shared handle to the SQLite store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at `path` and bootstrap the schema.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open store at {path}"))?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().context("open in-memory store")?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        bootstrap_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Insert a freshly normalized signal in `pending` state.
    pub async fn insert_signal(
        &self,
        sig: &NormalizedSignal,
        raw_payload: &str,
        now_ms: i64,
    ) -> Result<SignalRow> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO signals (
                id, symbol, direction, timeframe, event_timestamp_ms, fingerprint,
                raw_payload, status, processed, processing_lock, processing_attempts, created_at_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, 0, 0, ?8)",
            params![
                id,
                sig.symbol,
                sig.direction.as_str(),
                sig.timeframe,
                sig.event_timestamp_ms,
                sig.fingerprint,
                raw_payload,
                now_ms,
            ],
        )
        .context("insert signal")?;

        let row = conn
            .query_row(
                &format!("SELECT {SIGNAL_COLS} FROM signals WHERE id = ?1"),
                params![id],
                signal_from_row,
            )
            .context("reread inserted signal")?;
        Ok(row)
    }

    /// True when a signal with the same (symbol, direction, timeframe) was
    /// created within the sliding dedupe window.
    pub async fn has_recent_signal(
        &self,
        symbol: &str,
        direction: Direction,
        timeframe: &str,
        now_ms: i64,
    ) -> Result<bool> {
        let conn = self.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM signals
                 WHERE symbol = ?1 AND direction = ?2 AND timeframe = ?3
                   AND created_at_ms > ?4",
                params![
                    symbol,
                    direction.as_str(),
                    timeframe,
                    now_ms - DEDUPE_WINDOW_MS
                ],
                |r| r.get(0),
            )
            .context("dedupe window query")?;
        Ok(count > 0)
    }

    pub async fn get_signal(&self, id: &str) -> Result<Option<SignalRow>> {
        let conn = self.lock().await;
        conn.query_row(
            &format!("SELECT {SIGNAL_COLS} FROM signals WHERE id = ?1"),
            params![id],
            signal_from_row,
        )
        .optional()
        .context("get signal")
    }

    /// Transactionally claim up to `limit` processable signals.
    ///
    /// A row is claimable when it is unprocessed, unlocked, pending or
    /// awaiting retry, and both its queue delay and retry delay have
    /// elapsed. Rows another worker locks between the scan and the guarded
    /// update are skipped.
    pub async fn claim_signal_batch(&self, now_ms: i64, limit: usize) -> Result<Vec<SignalRow>> {
        let mut conn = self.lock().await;
        let tx = conn.transaction().context("begin claim transaction")?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare_cached(
                "SELECT id FROM signals
                 WHERE processed = 0
                   AND processing_lock = 0
                   AND status IN ('pending', 'failed')
                   AND (queued_until_ms IS NULL OR queued_until_ms <= ?1)
                   AND (next_retry_at_ms IS NULL OR next_retry_at_ms <= ?1)
                 ORDER BY created_at_ms ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now_ms, limit as i64], |r| r.get::<_, String>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let changed = tx.execute(
                "UPDATE signals SET processing_lock = 1 WHERE id = ?1 AND processing_lock = 0",
                params![id],
            )?;
            if changed == 1 {
                let row = tx.query_row(
                    &format!("SELECT {SIGNAL_COLS} FROM signals WHERE id = ?1"),
                    params![id],
                    signal_from_row,
                )?;
                claimed.push(row);
            }
        }

        tx.commit().context("commit claim transaction")?;
        Ok(claimed)
    }

    /// Mark a claimed signal processed with a terminal status.
    pub async fn mark_signal_processed(
        &self,
        id: &str,
        status: SignalStatus,
        experiment_id: Option<&str>,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE signals
             SET processed = 1, processing_lock = 0, status = ?2,
                 experiment_id = COALESCE(?3, experiment_id), processed_at_ms = ?4
             WHERE id = ?1",
            params![id, status.as_str(), experiment_id, now_ms],
        )
        .context("mark signal processed")?;
        Ok(())
    }

    /// Release a claimed signal after a failure, scheduling the next retry.
    pub async fn mark_signal_failed(&self, id: &str, next_retry_at_ms: i64) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE signals
             SET processing_lock = 0, status = 'failed',
                 processing_attempts = processing_attempts + 1,
                 next_retry_at_ms = ?2
             WHERE id = ?1",
            params![id, next_retry_at_ms],
        )
        .context("mark signal failed")?;
        Ok(())
    }

    /// Permanently fail a signal (retries exhausted).
    pub async fn mark_signal_dead(&self, id: &str, now_ms: i64) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE signals
             SET processed = 1, processing_lock = 0, status = 'failed', processed_at_ms = ?2
             WHERE id = ?1",
            params![id, now_ms],
        )
        .context("mark signal dead")?;
        Ok(())
    }

    /// Release a claimed signal untouched, queued until a later tick.
    /// Used for regime-delayed selections, which are not failures.
    pub async fn requeue_signal(&self, id: &str, queued_until_ms: i64) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE signals SET processing_lock = 0, queued_until_ms = ?2 WHERE id = ?1",
            params![id, queued_until_ms],
        )
        .context("requeue signal")?;
        Ok(())
    }

    /// Number of signals currently waiting to be claimed.
    pub async fn queue_depth(&self, now_ms: i64) -> Result<i64> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM signals
             WHERE processed = 0
               AND processing_lock = 0
               AND status = 'pending'
               AND (queued_until_ms IS NULL OR queued_until_ms <= ?1)
               AND (next_retry_at_ms IS NULL OR next_retry_at_ms <= ?1)",
            params![now_ms],
            |r| r.get(0),
        )
        .context("queue depth")
    }

    /// Timestamp of the most recently processed signal, for stall detection.
    pub async fn last_processed_at_ms(&self) -> Result<Option<i64>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT MAX(processed_at_ms) FROM signals WHERE processed = 1",
            [],
            |r| r.get(0),
        )
        .context("last processed timestamp")
    }

    // =========================================================================
    // Webhook audit
    // =========================================================================

    /// Append a webhook receipt to the audit log.
    pub async fn insert_webhook_event(&self, ev: &WebhookEventRow) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO webhook_events (
                request_id, signal_id, status, symbol, direction, timeframe,
                error_message, processing_time_ms, created_at_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ev.request_id,
                ev.signal_id,
                ev.status,
                ev.symbol,
                ev.direction,
                ev.timeframe,
                ev.error_message,
                ev.processing_time_ms,
                ev.created_at_ms,
            ],
        )
        .context("insert webhook event")?;
        Ok(())
    }

    /// Most recent webhook receipts, newest first.
    pub async fn recent_webhook_events(&self, limit: usize) -> Result<Vec<WebhookEventRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT request_id, signal_id, status, symbol, direction, timeframe,
                    error_message, processing_time_ms, created_at_ms
             FROM webhook_events ORDER BY created_at_ms DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            Ok(WebhookEventRow {
                request_id: r.get(0)?,
                signal_id: r.get(1)?,
                status: r.get(2)?,
                symbol: r.get(3)?,
                direction: r.get(4)?,
                timeframe: r.get(5)?,
                error_message: r.get(6)?,
                processing_time_ms: r.get(7)?,
                created_at_ms: r.get(8)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Per-status receipt counts since `since_ms`.
    pub async fn webhook_summary_since(&self, since_ms: i64) -> Result<Vec<(String, i64)>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT status, COUNT(*) FROM webhook_events
             WHERE created_at_ms >= ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![since_ms], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

// =============================================================================
// Schema
// =============================================================================

fn bootstrap_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS signals (
            id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            direction TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            event_timestamp_ms INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            raw_payload TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            processed INTEGER NOT NULL DEFAULT 0,
            processing_lock INTEGER NOT NULL DEFAULT 0,
            queued_until_ms INTEGER,
            next_retry_at_ms INTEGER,
            processing_attempts INTEGER NOT NULL DEFAULT 0,
            experiment_id TEXT,
            processed_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_signals_dedupe
            ON signals(symbol, direction, timeframe, created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_signals_queue
            ON signals(processed, processing_lock, status, created_at_ms);

        CREATE TABLE IF NOT EXISTS webhook_events (
            request_id TEXT PRIMARY KEY,
            signal_id TEXT,
            status TEXT NOT NULL,
            symbol TEXT,
            direction TEXT,
            timeframe TEXT,
            error_message TEXT,
            processing_time_ms INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_webhook_events_ts
            ON webhook_events(created_at_ms DESC);

        CREATE TABLE IF NOT EXISTS experiments (
            id TEXT PRIMARY KEY,
            signal_id TEXT NOT NULL UNIQUE,
            variant TEXT NOT NULL,
            assignment_hash TEXT NOT NULL,
            split_percentage REAL NOT NULL,
            policy_version TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS execution_policies (
            id TEXT PRIMARY KEY,
            experiment_id TEXT NOT NULL,
            execution_mode TEXT NOT NULL,
            executed_engine TEXT,
            shadow_engine TEXT,
            reason TEXT NOT NULL,
            policy_version TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_policies_experiment
            ON execution_policies(experiment_id);

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            signal_id TEXT,
            engine TEXT,
            experiment_id TEXT,
            symbol TEXT NOT NULL,
            option_symbol TEXT NOT NULL,
            strike REAL NOT NULL,
            expiration TEXT NOT NULL,
            option_type TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            order_type TEXT NOT NULL DEFAULT 'paper',
            status TEXT NOT NULL DEFAULT 'pending_execution',
            setup_type TEXT,
            created_at_ms INTEGER NOT NULL,
            UNIQUE(signal_id, engine, order_type)
        );
        CREATE INDEX IF NOT EXISTS idx_orders_pending
            ON orders(status, order_type, created_at_ms);

        CREATE TABLE IF NOT EXISTS trades (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            fill_price REAL NOT NULL,
            fill_quantity INTEGER NOT NULL,
            fill_timestamp_ms INTEGER NOT NULL,
            engine TEXT,
            experiment_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades(fill_timestamp_ms DESC);

        CREATE TABLE IF NOT EXISTS positions (
            id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            option_symbol TEXT NOT NULL,
            strike REAL NOT NULL,
            expiration TEXT NOT NULL,
            option_type TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            entry_price REAL NOT NULL,
            entry_timestamp_ms INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            exit_reason TEXT,
            exit_timestamp_ms INTEGER,
            realized_pnl REAL,
            engine TEXT,
            experiment_id TEXT,
            setup_type TEXT,
            entry_bias_snapshot TEXT,
            current_price REAL,
            stop_level REAL,
            last_updated_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_positions_status
            ON positions(status, entry_timestamp_ms);
        CREATE INDEX IF NOT EXISTS idx_positions_option
            ON positions(option_symbol, status);

        CREATE TABLE IF NOT EXISTS exit_rules (
            id TEXT PRIMARY KEY,
            profit_target_percent REAL,
            stop_loss_percent REAL,
            max_hold_time_hours REAL,
            min_dte_exit INTEGER,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS gex_snapshots (
            id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            gex_state TEXT NOT NULL,
            dollar_gamma REAL NOT NULL,
            flip_point REAL,
            as_of_ms INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_gex_snapshots_symbol
            ON gex_snapshots(symbol, created_at_ms DESC);

        -- Written by the options-flow collaborator; read-only here.
        CREATE TABLE IF NOT EXISTS options_flow_snapshots (
            id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS shadow_positions (
            id TEXT PRIMARY KEY,
            signal_id TEXT,
            experiment_id TEXT,
            engine TEXT NOT NULL,
            symbol TEXT NOT NULL,
            option_symbol TEXT NOT NULL,
            strike REAL NOT NULL,
            expiration TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            entry_price REAL NOT NULL,
            created_at_ms INTEGER NOT NULL
        );

        -- Filled by the shadow-execution collaborator when it simulates
        -- closes against shadow_positions.
        CREATE TABLE IF NOT EXISTS shadow_trades (
            id TEXT PRIMARY KEY,
            shadow_position_id TEXT NOT NULL,
            fill_price REAL NOT NULL,
            fill_quantity INTEGER NOT NULL,
            fill_timestamp_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS decision_recommendations (
            id TEXT PRIMARY KEY,
            signal_id TEXT,
            experiment_id TEXT,
            engine TEXT NOT NULL,
            is_shadow INTEGER NOT NULL DEFAULT 0,
            symbol TEXT NOT NULL,
            direction TEXT NOT NULL,
            option_symbol TEXT NOT NULL,
            strike REAL NOT NULL,
            expiration TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            entry_price REAL NOT NULL,
            rationale TEXT,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_recommendations_signal
            ON decision_recommendations(signal_id);",
    )
    .context("bootstrap schema")?;
    Ok(())
}

// =============================================================================
// Row mapping
// =============================================================================

pub(crate) const SIGNAL_COLS: &str = "id, symbol, direction, timeframe, event_timestamp_ms, \
     fingerprint, raw_payload, status, processed, processing_lock, queued_until_ms, \
     next_retry_at_ms, processing_attempts, experiment_id, processed_at_ms, created_at_ms";

pub(crate) fn signal_from_row(r: &Row<'_>) -> rusqlite::Result<SignalRow> {
    let direction: String = r.get(2)?;
    let status: String = r.get(7)?;
    Ok(SignalRow {
        id: r.get(0)?,
        symbol: r.get(1)?,
        direction: Direction::parse(&direction).unwrap_or(Direction::Long),
        timeframe: r.get(3)?,
        event_timestamp_ms: r.get(4)?,
        fingerprint: r.get(5)?,
        raw_payload: r.get(6)?,
        status: SignalStatus::parse(&status).unwrap_or(SignalStatus::Pending),
        processed: r.get::<_, i64>(8)? != 0,
        processing_lock: r.get::<_, i64>(9)? != 0,
        queued_until_ms: r.get(10)?,
        next_retry_at_ms: r.get(11)?,
        processing_attempts: r.get(12)?,
        experiment_id: r.get(13)?,
        processed_at_ms: r.get(14)?,
        created_at_ms: r.get(15)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
