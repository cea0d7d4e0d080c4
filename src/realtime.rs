// =============================================================================
// Realtime Hub — broadcast channel feeding the /v1/realtime WebSocket
// =============================================================================
//
// Workers publish position and risk events; every connected WebSocket
// client holds a broadcast receiver. Publishing never blocks and never
// fails: with no subscribers the send is simply dropped.
// =============================================================================

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::PositionRow;

/// Buffered events per subscriber before lagging clients drop messages.
const CHANNEL_CAPACITY: usize = 256;

/// Push event delivered to realtime clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    PositionUpdate {
        position: PositionRow,
    },
    PositionClosed {
        position: PositionRow,
        realized_pnl: f64,
    },
    RiskUpdate {
        open_positions: i64,
        daily_pnl: f64,
        queue_depth: i64,
    },
}

pub struct RealtimeHub {
    tx: broadcast::Sender<String>,
    connected: AtomicUsize,
    sequence: AtomicU64,
}

impl RealtimeHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            connected: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    /// Subscribe a new WebSocket client.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn client_connected(&self) -> usize {
        self.connected.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn client_disconnected(&self) -> usize {
        self.connected.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    pub fn connected_clients(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn publish(&self, event: &RealtimeEvent) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut value) = serde_json::to_value(event) {
            if let Some(obj) = value.as_object_mut() {
                obj.insert("sequence".to_string(), serde_json::json!(seq));
            }
            // No receivers is fine; drop the event.
            let _ = self.tx.send(value.to_string());
        }
    }

    pub fn publish_position_update(&self, position: &PositionRow) {
        self.publish(&RealtimeEvent::PositionUpdate {
            position: position.clone(),
        });
    }

    pub fn publish_position_closed(&self, position: &PositionRow, realized_pnl: f64) {
        self.publish(&RealtimeEvent::PositionClosed {
            position: position.clone(),
            realized_pnl,
        });
    }

    pub fn publish_risk_update(&self, open_positions: i64, daily_pnl: f64, queue_depth: i64) {
        self.publish(&RealtimeEvent::RiskUpdate {
            open_positions,
            daily_pnl,
            queue_depth,
        });
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers_with_sequence() {
        let hub = RealtimeHub::new();
        let mut rx = hub.subscribe();

        hub.publish_risk_update(2, -150.0, 0);
        hub.publish_risk_update(2, -150.0, 1);

        let first: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "risk_update");
        assert_eq!(first["sequence"], 0);

        let second: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second["sequence"], 1);
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let hub = RealtimeHub::new();
        hub.publish_risk_update(0, 0.0, 0);
        assert_eq!(hub.connected_clients(), 0);
    }

    #[test]
    fn connection_counter_tracks_clients() {
        let hub = RealtimeHub::new();
        assert_eq!(hub.client_connected(), 1);
        assert_eq!(hub.client_connected(), 2);
        assert_eq!(hub.client_disconnected(), 1);
        assert_eq!(hub.connected_clients(), 1);
    }
}
