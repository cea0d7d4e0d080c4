// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Public endpoints: POST /webhook (signal ingestion, optional HMAC) and
// GET /health. Everything else requires a verified bearer token via the
// `AuthClaims` extractor. CORS is permissive for development.
//
// Webhook timing discipline: `processing_time_ms` is measured from handler
// entry (before signature verification) to response construction, on every
// path including failures, and the same value lands in the audit row.
// =============================================================================

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::{verify_hmac_signature, AuthClaims};
use crate::ingest;
use crate::store::{WebhookEventRow, WebhookStatus};

/// Signature header carried by signing webhook senders.
const SIGNATURE_HEADER: &str = "x-webhook-signature";
/// Rolling window for the monitoring summaries.
const DAY_MS: i64 = 24 * 60 * 60 * 1_000;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        // ── Authenticated ───────────────────────────────────────────
        .route("/monitoring/status", get(monitoring_status))
        .route("/orders", get(orders))
        // ── Realtime WebSocket ──────────────────────────────────────
        .route("/v1/realtime", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "server_time": Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Webhook ingestion (public, optionally HMAC-verified)
// =============================================================================

async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let started = std::time::Instant::now();
    let request_id = Uuid::new_v4().to_string();
    let now_ms = Utc::now().timestamp_millis();

    // ── 1. Signature verification ───────────────────────────────────────
    if let Some(secret) = &state.config.hmac_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if let Some(signature) = signature {
            if !verify_hmac_signature(&body, signature, secret) {
                warn!(%request_id, "webhook signature verification failed");
                audit(
                    &state,
                    &request_id,
                    WebhookStatus::InvalidSignature,
                    None,
                    None,
                    Some("HMAC signature mismatch"),
                    started,
                    now_ms,
                )
                .await;
                return reply(
                    StatusCode::UNAUTHORIZED,
                    json!({
                        "status": "REJECTED",
                        "reason": "invalid_signature",
                        "request_id": request_id,
                    }),
                );
            }
        }
    }

    // ── 2-3. Parse + normalize ──────────────────────────────────────────
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            audit(
                &state,
                &request_id,
                WebhookStatus::InvalidPayload,
                None,
                None,
                Some(&format!("invalid JSON: {e}")),
                started,
                now_ms,
            )
            .await;
            return reply(
                StatusCode::BAD_REQUEST,
                json!({
                    "status": "REJECTED",
                    "reason": "invalid_payload",
                    "request_id": request_id,
                }),
            );
        }
    };

    let normalized = match ingest::normalize(&payload, now_ms) {
        Ok(normalized) => normalized,
        Err(e) => {
            audit(
                &state,
                &request_id,
                WebhookStatus::InvalidPayload,
                None,
                None,
                Some(&e.to_string()),
                started,
                now_ms,
            )
            .await;
            return reply(
                StatusCode::BAD_REQUEST,
                json!({
                    "status": "REJECTED",
                    "reason": e.to_string(),
                    "request_id": request_id,
                }),
            );
        }
    };

    // ── 4. Dedupe window ────────────────────────────────────────────────
    let duplicate = match state
        .store
        .has_recent_signal(
            &normalized.symbol,
            normalized.direction,
            &normalized.timeframe,
            now_ms,
        )
        .await
    {
        Ok(duplicate) => duplicate,
        Err(e) => return internal_error(&state, &request_id, &normalized, e, started, now_ms).await,
    };

    if duplicate {
        audit(
            &state,
            &request_id,
            WebhookStatus::Duplicate,
            Some(&normalized),
            None,
            None,
            started,
            now_ms,
        )
        .await;
        return reply(
            StatusCode::OK,
            json!({
                "status": "DUPLICATE",
                "request_id": request_id,
                "processing_time_ms": started.elapsed().as_millis() as i64,
            }),
        );
    }

    // ── 5. Persist ──────────────────────────────────────────────────────
    let raw_payload = payload.to_string();
    let signal = match state
        .store
        .insert_signal(&normalized, &raw_payload, now_ms)
        .await
    {
        Ok(signal) => signal,
        Err(e) => return internal_error(&state, &request_id, &normalized, e, started, now_ms).await,
    };

    info!(
        %request_id,
        signal_id = %signal.id,
        symbol = %signal.symbol,
        direction = %signal.direction,
        timeframe = %signal.timeframe,
        "signal accepted"
    );
    audit(
        &state,
        &request_id,
        WebhookStatus::Accepted,
        Some(&normalized),
        Some(&signal.id),
        None,
        started,
        now_ms,
    )
    .await;

    reply(
        StatusCode::OK,
        json!({
            "status": "ACCEPTED",
            "signal_id": signal.id,
            "request_id": request_id,
            "processing_time_ms": started.elapsed().as_millis() as i64,
        }),
    )
}

async fn internal_error(
    state: &Arc<AppState>,
    request_id: &str,
    normalized: &ingest::NormalizedSignal,
    e: anyhow::Error,
    started: std::time::Instant,
    now_ms: i64,
) -> axum::response::Response {
    error!(%request_id, error = %e, "webhook processing error");
    audit(
        state,
        request_id,
        WebhookStatus::Error,
        Some(normalized),
        None,
        Some(&format!("{e:#}")),
        started,
        now_ms,
    )
    .await;
    reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({
            "status": "ERROR",
            "request_id": request_id,
        }),
    )
}

#[allow(clippy::too_many_arguments)]
async fn audit(
    state: &Arc<AppState>,
    request_id: &str,
    status: WebhookStatus,
    normalized: Option<&ingest::NormalizedSignal>,
    signal_id: Option<&str>,
    error_message: Option<&str>,
    started: std::time::Instant,
    now_ms: i64,
) {
    let row = WebhookEventRow {
        request_id: request_id.to_string(),
        signal_id: signal_id.map(|s| s.to_string()),
        status: status.as_str().to_string(),
        symbol: normalized.map(|n| n.symbol.clone()),
        direction: normalized.map(|n| n.direction.to_string()),
        timeframe: normalized.map(|n| n.timeframe.clone()),
        error_message: error_message.map(|s| s.to_string()),
        processing_time_ms: started.elapsed().as_millis() as i64,
        created_at_ms: now_ms,
    };
    // The audit row is best-effort: losing it must not change the response.
    if let Err(e) = state.store.insert_webhook_event(&row).await {
        error!(%request_id, error = %e, "failed to audit webhook event");
    }
}

fn reply(status: StatusCode, body: serde_json::Value) -> axum::response::Response {
    (status, Json(body)).into_response()
}

// =============================================================================
// Monitoring (authenticated)
// =============================================================================

async fn monitoring_status(
    _auth: AuthClaims,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let now_ms = Utc::now().timestamp_millis();
    let since = now_ms - DAY_MS;

    let recent = state.store.recent_webhook_events(20).await.unwrap_or_default();
    let summary: serde_json::Map<String, serde_json::Value> = state
        .store
        .webhook_summary_since(since)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|(status, count)| (status, json!(count)))
        .collect();

    let by_variant: serde_json::Map<String, serde_json::Value> = state
        .store
        .experiments_by_variant_since(since)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|(variant, count)| (variant, json!(count)))
        .collect();
    let fills_by_engine: serde_json::Map<String, serde_json::Value> = state
        .store
        .fills_by_engine_since(since)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|(engine, count)| (engine, json!(count)))
        .collect();

    let breaker = state.market.breaker_snapshot();
    let provider_down = breaker
        .as_ref()
        .map(|b| b.state == crate::market::BreakerState::Open)
        .unwrap_or(false);

    let queue = state
        .queue_monitor
        .read()
        .as_ref()
        .and_then(|m| m.snapshot());
    let risk_limits = state.risk.limits(now_ms).await.unwrap_or_default();

    Json(json!({
        "timestamp": now_ms,
        "uptime_secs": state.uptime_secs(),
        "webhooks": {
            "recent": recent,
            "summary_24h": summary,
        },
        "engines": {
            "by_variant_24h": by_variant,
            "fills_by_engine_24h": fills_by_engine,
        },
        "websocket": {
            "connected_clients": state.realtime.connected_clients(),
        },
        "providers": {
            "name": state.market.provider_name(),
            "circuit_breakers": breaker,
            "down": provider_down,
        },
        "workers": state.workers.snapshot(),
        "queue": queue,
        "risk": risk_limits,
    }))
}

// =============================================================================
// Orders / trades / positions (authenticated)
// =============================================================================

async fn orders(_auth: AuthClaims, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now_ms = Utc::now().timestamp_millis();
    let orders = state.store.recent_orders(100).await.unwrap_or_default();
    let trades = state.store.recent_trades(100).await.unwrap_or_default();
    let positions = state.store.recent_positions(100).await.unwrap_or_default();
    let recently_filled = state
        .store
        .recently_filled_orders(now_ms - DAY_MS)
        .await
        .unwrap_or_default();

    Json(json!({
        "orders": orders,
        "trades": trades,
        "positions": positions,
        "recently_filled": recently_filled,
    }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::market::StaticMarketData;
    use crate::realtime::RealtimeHub;
    use crate::risk::RiskGate;
    use crate::store::Store;
    use crate::worker::WorkerRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use hmac::Mac;
    use std::collections::HashMap;
    use tower::ServiceExt;

    const JWT_SECRET: &str = "0123456789abcdef0123456789abcdef";
    const HMAC_SECRET: &str = "webhook-hmac-secret";

    fn build_state(with_hmac: bool) -> Arc<AppState> {
        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("DATABASE_URL", ":memory:".to_string());
        vars.insert("JWT_SECRET", JWT_SECRET.to_string());
        if with_hmac {
            vars.insert("HMAC_SECRET", HMAC_SECRET.to_string());
        }
        let config = AppConfig::from_vars(|k| vars.get(k).cloned()).unwrap();

        let store = Store::open_in_memory().unwrap();
        let risk = RiskGate::new(store.clone(), &config);
        Arc::new(AppState::new(
            config,
            store,
            Arc::new(StaticMarketData::new()),
            Arc::new(RealtimeHub::new()),
            risk,
            Arc::new(WorkerRegistry::new()),
        ))
    }

    async fn post_webhook(
        app: Router,
        body: &str,
        signature: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header(SIGNATURE_HEADER, sig);
        }
        let response = app
            .oneshot(builder.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn valid_payload_is_accepted_with_signal_id() {
        let state = build_state(false);
        let app = router(state.clone());
        let body = r#"{"symbol":"SPY","direction":"long","timeframe":"5m","timestamp":"2024-03-15T14:30:00Z"}"#;

        let (status, json) = post_webhook(app, body, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ACCEPTED");
        assert!(json["signal_id"].as_str().is_some());
        assert!(json["processing_time_ms"].as_i64().is_some());

        // Audit row exists with status accepted.
        let events = state.store.recent_webhook_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, "accepted");
        assert!(events[0].signal_id.is_some());
    }

    #[tokio::test]
    async fn second_identical_payload_is_duplicate() {
        let state = build_state(false);
        let body = r#"{"symbol":"SPY","direction":"long","timeframe":"5m"}"#;

        let (status, json) = post_webhook(router(state.clone()), body, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ACCEPTED");

        let (status, json) = post_webhook(router(state.clone()), body, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "DUPLICATE");

        // Exactly one signal row survived both posts.
        let depth = state
            .store
            .queue_depth(Utc::now().timestamp_millis())
            .await
            .unwrap();
        assert_eq!(depth, 1);
    }

    #[tokio::test]
    async fn missing_fields_reject_with_400() {
        let state = build_state(false);
        let (status, json) =
            post_webhook(router(state.clone()), r#"{"direction":"long"}"#, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "REJECTED");

        let events = state.store.recent_webhook_events(10).await.unwrap();
        assert_eq!(events[0].status, "invalid_payload");
    }

    #[tokio::test]
    async fn malformed_json_rejects_with_400() {
        let state = build_state(false);
        let (status, json) = post_webhook(router(state), "not json at all", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "REJECTED");
        assert_eq!(json["reason"], "invalid_payload");
    }

    #[tokio::test]
    async fn bad_signature_rejects_with_401_and_no_signal() {
        let state = build_state(true);
        let body = r#"{"symbol":"SPY","direction":"long","timeframe":"5m"}"#;

        let (status, json) =
            post_webhook(router(state.clone()), body, Some("deadbeef")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["status"], "REJECTED");
        assert_eq!(json["reason"], "invalid_signature");

        let events = state.store.recent_webhook_events(10).await.unwrap();
        assert_eq!(events[0].status, "invalid_signature");
        let depth = state
            .store
            .queue_depth(Utc::now().timestamp_millis())
            .await
            .unwrap();
        assert_eq!(depth, 0);
    }

    #[tokio::test]
    async fn good_signature_is_accepted() {
        let state = build_state(true);
        let body = r#"{"symbol":"SPY","direction":"long","timeframe":"5m"}"#;

        let mut mac =
            hmac::Hmac::<sha2::Sha256>::new_from_slice(HMAC_SECRET.as_bytes()).unwrap();
        mac.update(body.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let (status, json) = post_webhook(router(state), body, Some(&signature)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ACCEPTED");
    }

    #[tokio::test]
    async fn protected_endpoints_require_bearer_token() {
        let state = build_state(false);
        for uri in ["/monitoring/status", "/orders"] {
            let response = router(state.clone())
                .oneshot(
                    Request::builder()
                        .method("GET")
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
    }

    #[tokio::test]
    async fn valid_token_reads_monitoring_status() {
        let state = build_state(false);
        let claims = crate::auth::Claims {
            sub: "user-1".to_string(),
            email: String::new(),
            role: "admin".to_string(),
            exp: Utc::now().timestamp() + 3_600,
        };
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .unwrap();

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/monitoring/status")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json["webhooks"]["recent"].is_array());
        assert!(json["websocket"]["connected_clients"].is_number());
        assert!(json["providers"]["name"].is_string());
    }
}
