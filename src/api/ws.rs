// =============================================================================
// Realtime WebSocket — push feed for position and risk events
// =============================================================================
//
// Clients connect to `/v1/realtime?token=<jwt>` and receive every event the
// workers publish through the realtime hub (position updates, position
// closes, risk frames). The handler:
//
//   - validates the token before upgrading;
//   - forwards hub broadcasts as text frames;
//   - answers Ping with Pong and honors Close;
//   - keeps the hub's connected-client counter accurate.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::auth::verify_token;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if verify_token(&token, &state.config.jwt_secret).is_none() {
        warn!("realtime connection rejected: invalid token");
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("realtime connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_connection(socket, state))
        .into_response()
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let connected = state.realtime.client_connected();
    debug!(connected, "realtime client connected");

    let mut events = state.realtime.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(payload) => {
                        if sender.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "realtime client lagging — events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ignore client text/binary
                    Some(Err(e)) => {
                        debug!(error = %e, "realtime receive error");
                        break;
                    }
                }
            }
        }
    }

    let remaining = state.realtime.client_disconnected();
    debug!(remaining, "realtime client disconnected");
}
