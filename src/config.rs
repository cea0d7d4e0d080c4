// =============================================================================
// Application Configuration — environment-driven, validated at boot
// =============================================================================
//
// Every recognized option is read once at startup into an immutable
// `AppConfig`. Validation failures are fatal: the process logs the problem
// and exits non-zero rather than running with a half-configured engine.
//
// The parsing layer is injected (`from_vars`) so tests can feed a plain map
// instead of mutating process-global environment variables.
// =============================================================================

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::types::AppMode;

/// Minimum accepted JWT secret length.
const MIN_JWT_SECRET_LEN: usize = 32;

/// Top-level configuration for the Meridian engine.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // --- Process -------------------------------------------------------------
    pub port: u16,
    pub app_mode: AppMode,
    /// Deployment environment label (`development`, `production`, ...).
    pub app_env: String,

    // --- Stores --------------------------------------------------------------
    /// SQLite database path.
    pub database_url: String,
    /// Redis connection URL; required when `app_env == "production"`.
    pub redis_url: Option<String>,

    // --- Secrets -------------------------------------------------------------
    pub jwt_secret: String,
    /// When set, webhook requests carrying a signature header are verified.
    pub hmac_secret: Option<String>,

    // --- Experimentation -----------------------------------------------------
    /// Fraction of signals assigned to engine A, in [0, 1].
    pub ab_split_percentage: f64,
    pub policy_version: String,

    // --- Orchestrator --------------------------------------------------------
    pub orchestrator_batch_size: usize,
    pub orchestrator_concurrency: usize,
    pub orchestrator_signal_timeout_ms: u64,
    pub orchestrator_retry_delay_ms: u64,
    pub orchestrator_interval_ms: u64,

    // --- Paper executor ------------------------------------------------------
    pub paper_executor_interval_ms: u64,
    pub paper_executor_batch_size: usize,

    // --- Exit monitor / refresher -------------------------------------------
    pub exit_monitor_interval_ms: u64,
    pub position_refresh_interval_ms: u64,

    // --- Queue monitor -------------------------------------------------------
    pub queue_depth_alert: i64,
    pub queue_depth_duration_sec: u64,

    // --- Risk limits ---------------------------------------------------------
    /// Maximum capital allocated to a single position (dollars).
    pub max_position_size: f64,
    pub max_daily_trades: i64,
    /// Maximum cumulative realized daily loss (dollars, positive number).
    pub max_daily_loss: f64,
    pub max_open_positions: i64,

    // --- Default exit rule ---------------------------------------------------
    pub profit_target_pct: f64,
    pub stop_loss_pct: f64,
    pub time_stop_dte: i64,
    pub max_hold_days: i64,

    // --- Confluence ----------------------------------------------------------
    /// Minimum aligned confluence score engine B requires.
    pub confluence_min_threshold: f64,
    pub enable_confluence_gate: bool,
    pub enable_confluence_sizing: bool,

    // --- Feature flags -------------------------------------------------------
    pub enable_orchestrator: bool,
    pub enable_exit_decision_engine: bool,
    pub enable_dual_paper_trading: bool,

    // --- Market data ---------------------------------------------------------
    /// Base URL of the market-data vendor gateway. When unset, the static
    /// provider is used (local development and tests).
    pub market_data_base_url: Option<String>,
    pub market_data_timeout_ms: u64,
}

impl AppConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Read configuration through an injected variable source.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = get("DATABASE_URL")
            .filter(|s| !s.trim().is_empty())
            .context("DATABASE_URL is required")?;

        let jwt_secret = get("JWT_SECRET").unwrap_or_default();
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            bail!(
                "JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} characters (got {})",
                jwt_secret.len()
            );
        }

        let app_mode_raw = get("APP_MODE").unwrap_or_else(|| "PAPER".to_string());
        let app_mode = AppMode::parse(&app_mode_raw)
            .with_context(|| format!("APP_MODE must be PAPER or LIVE (got '{app_mode_raw}')"))?;

        let app_env = get("APP_ENV").unwrap_or_else(|| "development".to_string());
        let redis_url = get("REDIS_URL").filter(|s| !s.trim().is_empty());
        if app_env == "production" && redis_url.is_none() {
            bail!("REDIS_URL is required in production");
        }

        let ab_split_percentage =
            parse_or(&get, "AB_SPLIT_PERCENTAGE", 0.5_f64)?.clamp(0.0, 1.0);

        let config = Self {
            port: parse_or(&get, "PORT", 3001_u16)?,
            app_mode,
            app_env,
            database_url,
            redis_url,
            jwt_secret,
            hmac_secret: get("HMAC_SECRET").filter(|s| !s.trim().is_empty()),
            ab_split_percentage,
            policy_version: get("POLICY_VERSION").unwrap_or_else(|| "v1.0".to_string()),
            orchestrator_batch_size: parse_or(&get, "ORCHESTRATOR_BATCH_SIZE", 20_usize)?,
            orchestrator_concurrency: parse_or(&get, "ORCHESTRATOR_CONCURRENCY", 5_usize)?.max(1),
            orchestrator_signal_timeout_ms: parse_or(
                &get,
                "ORCHESTRATOR_SIGNAL_TIMEOUT_MS",
                30_000_u64,
            )?,
            orchestrator_retry_delay_ms: parse_or(&get, "ORCHESTRATOR_RETRY_DELAY_MS", 5_000_u64)?,
            orchestrator_interval_ms: parse_or(&get, "ORCHESTRATOR_INTERVAL_MS", 5_000_u64)?,
            paper_executor_interval_ms: parse_or(&get, "PAPER_EXECUTOR_INTERVAL", 5_000_u64)?,
            paper_executor_batch_size: parse_or(&get, "PAPER_EXECUTOR_BATCH_SIZE", 10_usize)?,
            exit_monitor_interval_ms: parse_or(&get, "EXIT_MONITOR_INTERVAL", 15_000_u64)?,
            position_refresh_interval_ms: parse_or(
                &get,
                "POSITION_REFRESH_INTERVAL_MS",
                30_000_u64,
            )?,
            queue_depth_alert: parse_or(&get, "PROCESSING_QUEUE_DEPTH_ALERT", 50_i64)?,
            queue_depth_duration_sec: parse_or(&get, "PROCESSING_QUEUE_DEPTH_DURATION_SEC", 120_u64)?,
            max_position_size: parse_or(&get, "MAX_POSITION_SIZE", 5_000.0_f64)?,
            max_daily_trades: parse_or(&get, "MAX_DAILY_TRADES", 20_i64)?,
            max_daily_loss: parse_or(&get, "MAX_DAILY_LOSS", 1_000.0_f64)?,
            max_open_positions: parse_or(&get, "MAX_OPEN_POSITIONS", 10_i64)?,
            profit_target_pct: parse_or(&get, "PROFIT_TARGET_PCT", 50.0_f64)?,
            stop_loss_pct: parse_or(&get, "STOP_LOSS_PCT", 50.0_f64)?,
            time_stop_dte: parse_or(&get, "TIME_STOP_DTE", 7_i64)?,
            max_hold_days: parse_or(&get, "MAX_HOLD_DAYS", 30_i64)?,
            confluence_min_threshold: parse_or(&get, "CONFLUENCE_MIN_THRESHOLD", 50.0_f64)?,
            enable_confluence_gate: parse_flag(&get, "ENABLE_CONFLUENCE_GATE", true),
            enable_confluence_sizing: parse_flag(&get, "ENABLE_CONFLUENCE_SIZING", false),
            enable_orchestrator: parse_flag(&get, "ENABLE_ORCHESTRATOR", true),
            enable_exit_decision_engine: parse_flag(&get, "ENABLE_EXIT_DECISION_ENGINE", true),
            enable_dual_paper_trading: parse_flag(&get, "ENABLE_DUAL_PAPER_TRADING", false),
            market_data_base_url: get("MARKET_DATA_BASE_URL").filter(|s| !s.trim().is_empty()),
            market_data_timeout_ms: parse_or(&get, "MARKET_DATA_TIMEOUT_MS", 5_000_u64)?,
        };

        if config.app_mode == AppMode::Live {
            warn!("APP_MODE=LIVE requested, but this core only supports paper execution");
        }

        info!(
            app_mode = %config.app_mode,
            app_env = %config.app_env,
            ab_split = config.ab_split_percentage,
            batch = config.orchestrator_batch_size,
            concurrency = config.orchestrator_concurrency,
            "configuration loaded"
        );

        Ok(config)
    }
}

/// Parse an optional env var, falling back to `default` when absent or empty.
fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key).filter(|s| !s.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}='{raw}': {e}")),
        None => Ok(default),
    }
}

/// Boolean flags accept `1/0`, `true/false`, `yes/no` (case-insensitive).
fn parse_flag(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match get(key) {
        Some(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes"),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, &'static str> {
        let mut vars = HashMap::new();
        vars.insert("DATABASE_URL", "/tmp/meridian-test.db");
        vars.insert("JWT_SECRET", "0123456789abcdef0123456789abcdef");
        vars
    }

    fn from_map(vars: &HashMap<&'static str, &'static str>) -> Result<AppConfig> {
        AppConfig::from_vars(|key| vars.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = from_map(&base_vars()).unwrap();
        assert_eq!(cfg.port, 3001);
        assert_eq!(cfg.app_mode, AppMode::Paper);
        assert_eq!(cfg.orchestrator_batch_size, 20);
        assert_eq!(cfg.orchestrator_concurrency, 5);
        assert_eq!(cfg.paper_executor_batch_size, 10);
        assert_eq!(cfg.max_open_positions, 10);
        assert!((cfg.ab_split_percentage - 0.5).abs() < f64::EPSILON);
        assert!(cfg.enable_orchestrator);
        assert!(!cfg.enable_dual_paper_trading);
    }

    #[test]
    fn missing_database_url_is_fatal() {
        let mut vars = base_vars();
        vars.remove("DATABASE_URL");
        assert!(from_map(&vars).is_err());
    }

    #[test]
    fn short_jwt_secret_is_fatal() {
        let mut vars = base_vars();
        vars.insert("JWT_SECRET", "too-short");
        assert!(from_map(&vars).is_err());
    }

    #[test]
    fn invalid_app_mode_is_fatal() {
        let mut vars = base_vars();
        vars.insert("APP_MODE", "BACKTEST");
        assert!(from_map(&vars).is_err());
    }

    #[test]
    fn production_requires_redis() {
        let mut vars = base_vars();
        vars.insert("APP_ENV", "production");
        assert!(from_map(&vars).is_err());

        vars.insert("REDIS_URL", "redis://127.0.0.1:6379");
        let cfg = from_map(&vars).unwrap();
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
    }

    #[test]
    fn split_percentage_is_clamped() {
        let mut vars = base_vars();
        vars.insert("AB_SPLIT_PERCENTAGE", "1.7");
        let cfg = from_map(&vars).unwrap();
        assert!((cfg.ab_split_percentage - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn overrides_parse() {
        let mut vars = base_vars();
        vars.insert("ORCHESTRATOR_BATCH_SIZE", "7");
        vars.insert("ORCHESTRATOR_CONCURRENCY", "3");
        vars.insert("MAX_DAILY_TRADES", "5");
        vars.insert("ENABLE_DUAL_PAPER_TRADING", "true");
        vars.insert("CONFLUENCE_MIN_THRESHOLD", "65");
        vars.insert("ENABLE_CONFLUENCE_SIZING", "1");
        let cfg = from_map(&vars).unwrap();
        assert_eq!(cfg.orchestrator_batch_size, 7);
        assert_eq!(cfg.orchestrator_concurrency, 3);
        assert_eq!(cfg.max_daily_trades, 5);
        assert!(cfg.enable_dual_paper_trading);
        assert!((cfg.confluence_min_threshold - 65.0).abs() < f64::EPSILON);
        assert!(cfg.enable_confluence_sizing);
        assert!(cfg.enable_confluence_gate);
    }
}
