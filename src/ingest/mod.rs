// =============================================================================
// Webhook Ingest — permissive payload normalization
// =============================================================================
//
// External alerting tools emit loosely-typed JSON with many alias spellings
// (`ticker` vs `symbol`, `side` vs `direction`, `tf` vs `timeframe`). This
// module maps those aliases onto one canonical record with an explicit
// result type; no field probing happens anywhere else in the engine.
//
// The fingerprint computed here is the engine's idempotency key: it feeds
// both the 60-second dedupe window and the deterministic A/B assignment
// hash, so its inputs (symbol, direction, canonical timeframe, canonical
// timestamp) must never change shape.
// =============================================================================

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::Direction;

/// Accepted alias keys for the instrument symbol, in precedence order.
const SYMBOL_KEYS: [&str; 3] = ["symbol", "ticker", "instrument"];

/// Accepted alias keys for the trade direction.
const DIRECTION_KEYS: [&str; 5] = ["direction", "side", "trend", "bias", "action"];

/// Accepted alias keys for the timeframe.
const TIMEFRAME_KEYS: [&str; 4] = ["timeframe", "tf", "interval", "resolution"];

/// Accepted alias keys for the event timestamp.
const TIMESTAMP_KEYS: [&str; 3] = ["timestamp", "time", "event_time"];

/// Timestamps below this magnitude are interpreted as seconds, not millis.
const MS_THRESHOLD: i64 = 1_000_000_000_000;

// =============================================================================
// Result types
// =============================================================================

/// A webhook payload reduced to the canonical signal record.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedSignal {
    pub symbol: String,
    pub direction: Direction,
    /// Canonical timeframe, e.g. `5m`, `4h`, `1d`.
    pub timeframe: String,
    /// Event timestamp in epoch milliseconds (UTC).
    pub event_timestamp_ms: i64,
    /// RFC 3339 rendering of the event timestamp; fingerprint input.
    pub event_timestamp_iso: String,
    /// SHA-256 hex over `symbol:direction:timeframe:timestamp_iso`.
    pub fingerprint: String,
}

/// Why a payload was rejected at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    MissingSymbol,
    InvalidSymbol,
    MissingDirection,
    InvalidDirection,
    MissingTimeframe,
    InvalidTimeframe,
    InvalidTimestamp,
    NotAnObject,
}

/// Boundary rejection carrying the offending field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub field: &'static str,
}

impl ValidationError {
    fn new(kind: ValidationErrorKind, field: &'static str) -> Self {
        Self { kind, field }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self.kind {
            ValidationErrorKind::MissingSymbol => "missing symbol",
            ValidationErrorKind::InvalidSymbol => "symbol must be 1-20 characters",
            ValidationErrorKind::MissingDirection => "missing direction",
            ValidationErrorKind::InvalidDirection => "unrecognized direction value",
            ValidationErrorKind::MissingTimeframe => "missing timeframe",
            ValidationErrorKind::InvalidTimeframe => "unrecognized timeframe value",
            ValidationErrorKind::InvalidTimestamp => "unparseable timestamp",
            ValidationErrorKind::NotAnObject => "payload must be a JSON object",
        };
        write!(f, "{msg} (field: {})", self.field)
    }
}

impl std::error::Error for ValidationError {}

// =============================================================================
// Normalization
// =============================================================================

/// Normalize a raw webhook payload into a canonical signal record.
///
/// `now_ms` supplies the fallback event timestamp so the function stays pure
/// and replayable in tests.
pub fn normalize(payload: &Value, now_ms: i64) -> Result<NormalizedSignal, ValidationError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| ValidationError::new(ValidationErrorKind::NotAnObject, "$"))?;

    // ── Symbol ──────────────────────────────────────────────────────────
    let raw_symbol = first_string(obj, &SYMBOL_KEYS)
        .ok_or_else(|| ValidationError::new(ValidationErrorKind::MissingSymbol, "symbol"))?;
    let symbol = raw_symbol.trim().to_uppercase();
    if symbol.is_empty() || symbol.len() > 20 {
        return Err(ValidationError::new(
            ValidationErrorKind::InvalidSymbol,
            "symbol",
        ));
    }

    // ── Direction ───────────────────────────────────────────────────────
    let raw_direction = first_string(obj, &DIRECTION_KEYS)
        .ok_or_else(|| ValidationError::new(ValidationErrorKind::MissingDirection, "direction"))?;
    let direction = map_direction(&raw_direction).ok_or_else(|| {
        ValidationError::new(ValidationErrorKind::InvalidDirection, "direction")
    })?;

    // ── Timeframe ───────────────────────────────────────────────────────
    let raw_timeframe = first_scalar(obj, &TIMEFRAME_KEYS)
        .ok_or_else(|| ValidationError::new(ValidationErrorKind::MissingTimeframe, "timeframe"))?;
    let timeframe = normalize_timeframe(&raw_timeframe).ok_or_else(|| {
        ValidationError::new(ValidationErrorKind::InvalidTimeframe, "timeframe")
    })?;

    // ── Timestamp ───────────────────────────────────────────────────────
    let event_timestamp_ms = match first_scalar(obj, &TIMESTAMP_KEYS) {
        Some(raw) => normalize_timestamp(&raw).ok_or_else(|| {
            ValidationError::new(ValidationErrorKind::InvalidTimestamp, "timestamp")
        })?,
        None => now_ms,
    };
    let event_timestamp_iso = iso_from_ms(event_timestamp_ms);

    let fingerprint = fingerprint(&symbol, direction, &timeframe, &event_timestamp_iso);

    Ok(NormalizedSignal {
        symbol,
        direction,
        timeframe,
        event_timestamp_ms,
        event_timestamp_iso,
        fingerprint,
    })
}

/// Stable content hash of a signal: SHA-256 hex over the canonical fields.
pub fn fingerprint(
    symbol: &str,
    direction: Direction,
    timeframe: &str,
    timestamp_iso: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{symbol}:{direction}:{timeframe}:{timestamp_iso}").as_bytes());
    hex::encode(hasher.finalize())
}

/// RFC 3339 rendering with millisecond precision and a `Z` suffix.
pub fn iso_from_ms(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => Utc
            .timestamp_millis_opt(0)
            .unwrap()
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

// =============================================================================
// Field extraction helpers
// =============================================================================

fn first_string(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Like `first_string` but tolerates numeric values (e.g. `"timeframe": 5`).
fn first_scalar(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    let value = keys.iter().find_map(|k| obj.get(*k))?;
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Map the many direction alias spellings onto `long` / `short`.
fn map_direction(raw: &str) -> Option<Direction> {
    match raw.trim().to_lowercase().as_str() {
        "long" | "call" | "buy" | "bull" | "up" => Some(Direction::Long),
        "short" | "put" | "sell" | "bear" | "down" => Some(Direction::Short),
        _ => None,
    }
}

// =============================================================================
// Timeframe canonicalization
// =============================================================================

/// Canonicalize a timeframe-like value to its most compact unit form.
///
/// Accepts a bare minute count (`"5"`, `5`), or `N(m|h|d|w)` in any case.
/// `60` and `"60m"` both canonicalize to `1h` so equivalent spellings share
/// one fingerprint.
pub fn normalize_timeframe(raw: &str) -> Option<String> {
    let trimmed = raw.trim().to_lowercase();
    if trimmed.is_empty() {
        return None;
    }

    let minutes: u64 = if let Ok(n) = trimmed.parse::<u64>() {
        n
    } else {
        let (digits, unit) = trimmed.split_at(trimmed.len() - 1);
        let n: u64 = digits.trim().parse().ok()?;
        match unit {
            "m" => n,
            "h" => n.checked_mul(60)?,
            "d" => n.checked_mul(1_440)?,
            "w" => n.checked_mul(10_080)?,
            _ => return None,
        }
    };

    if minutes == 0 {
        return None;
    }

    Some(compact_timeframe(minutes))
}

/// Render a minute count in the largest exact unit.
fn compact_timeframe(minutes: u64) -> String {
    if minutes % 10_080 == 0 {
        format!("{}w", minutes / 10_080)
    } else if minutes % 1_440 == 0 {
        format!("{}d", minutes / 1_440)
    } else if minutes % 60 == 0 {
        format!("{}h", minutes / 60)
    } else {
        format!("{minutes}m")
    }
}

/// Total minutes represented by a canonical timeframe string.
pub fn timeframe_minutes(timeframe: &str) -> Option<u64> {
    let trimmed = timeframe.trim().to_lowercase();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(n) = trimmed.parse::<u64>() {
        return Some(n);
    }
    let (digits, unit) = trimmed.split_at(trimmed.len() - 1);
    let n: u64 = digits.trim().parse().ok()?;
    match unit {
        "m" => Some(n),
        "h" => n.checked_mul(60),
        "d" => n.checked_mul(1_440),
        "w" => n.checked_mul(10_080),
        _ => None,
    }
}

// =============================================================================
// Timestamp normalization
// =============================================================================

/// Accepts epoch seconds, epoch milliseconds, or an RFC 3339 / ISO string.
fn normalize_timestamp(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();

    if let Ok(n) = trimmed.parse::<i64>() {
        if n <= 0 {
            return None;
        }
        // Sub-10^12 numerics are seconds; upscale to milliseconds.
        return Some(if n < MS_THRESHOLD { n * 1_000 } else { n });
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f <= 0.0 {
            return None;
        }
        let n = f as i64;
        return Some(if n < MS_THRESHOLD { n * 1_000 } else { n });
    }

    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

// =============================================================================
// Tests
// =============================================================================
