// =============================================================================
// Health / Queue Monitor — heartbeat, depth alarms, stall detection
// =============================================================================
//
// Every heartbeat the monitor reads the signal queue depth. A depth above
// the alert threshold must persist for the configured duration before a
// warning fires, and warnings are rate-limited by a 15-minute cooldown so
// a saturated queue does not spam the alert stream.
//
// The monitor also labels pipeline liveness: `idle` when the queue is
// empty, `stalled` when signals are waiting but nothing has been processed
// for several heartbeats.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::config::AppConfig;
use crate::realtime::RealtimeHub;
use crate::store::Store;

/// Minimum spacing between queue-depth warnings.
const ALERT_COOLDOWN_MS: i64 = 15 * 60 * 1_000;
/// Queue liveness is `stalled` after this long with waiting work and no
/// completed processing.
const STALL_AFTER_MS: i64 = 5 * 60 * 1_000;

/// Pipeline liveness label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueHealth {
    Healthy,
    Idle,
    Stalled,
}

/// Snapshot served on /monitoring/status.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub depth: i64,
    pub health: QueueHealth,
    pub last_processed_at_ms: Option<i64>,
    pub alerting: bool,
}

#[derive(Default)]
struct AlertState {
    over_threshold_since_ms: Option<i64>,
    last_alert_at_ms: Option<i64>,
    alerting: bool,
}

pub struct QueueMonitor {
    store: Store,
    broker: Arc<dyn Broker>,
    realtime: Arc<RealtimeHub>,
    depth_alert: i64,
    alert_duration_ms: i64,
    state: Mutex<AlertState>,
    last_snapshot: Mutex<Option<QueueSnapshot>>,
}

impl QueueMonitor {
    pub fn new(
        store: Store,
        broker: Arc<dyn Broker>,
        realtime: Arc<RealtimeHub>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            broker,
            realtime,
            depth_alert: config.queue_depth_alert,
            alert_duration_ms: (config.queue_depth_duration_sec * 1_000) as i64,
            state: Mutex::new(AlertState::default()),
            last_snapshot: Mutex::new(None),
        }
    }

    /// Most recent heartbeat's snapshot, for the monitoring endpoint.
    pub fn snapshot(&self) -> Option<QueueSnapshot> {
        self.last_snapshot.lock().clone()
    }

    /// One heartbeat.
    pub async fn run_once(&self) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let depth = self.store.queue_depth(now_ms).await?;
        let last_processed = self.store.last_processed_at_ms().await?;

        let alerting = self.update_alert_state(depth, now_ms).await?;

        let health = if depth == 0 {
            QueueHealth::Idle
        } else {
            let stalled = last_processed
                .map(|at| now_ms - at > STALL_AFTER_MS)
                .unwrap_or(true);
            if stalled {
                QueueHealth::Stalled
            } else {
                QueueHealth::Healthy
            }
        };

        if health == QueueHealth::Stalled {
            warn!(depth, ?last_processed, "signal pipeline appears stalled");
        }
        debug!(depth, ?health, "queue heartbeat");

        // Push a risk frame so dashboards track depth without polling.
        let open = self.store.count_open_positions().await.unwrap_or(0);
        let daily_pnl = self
            .store
            .realized_pnl_since(crate::risk::day_start_ms(now_ms))
            .await
            .unwrap_or(0.0);
        self.realtime.publish_risk_update(open, daily_pnl, depth);

        *self.last_snapshot.lock() = Some(QueueSnapshot {
            depth,
            health,
            last_processed_at_ms: last_processed,
            alerting,
        });
        Ok(())
    }

    /// Duration-gated, cooldown-limited depth alarm. Returns whether the
    /// alarm is currently raised.
    async fn update_alert_state(&self, depth: i64, now_ms: i64) -> Result<bool> {
        let (should_fire, alerting) = {
            let mut state = self.state.lock();
            if depth <= self.depth_alert {
                state.over_threshold_since_ms = None;
                state.alerting = false;
                (false, false)
            } else {
                let since = *state.over_threshold_since_ms.get_or_insert(now_ms);
                if now_ms - since < self.alert_duration_ms {
                    (false, state.alerting)
                } else {
                    state.alerting = true;
                    let cooled = state
                        .last_alert_at_ms
                        .map(|at| now_ms - at >= ALERT_COOLDOWN_MS)
                        .unwrap_or(true);
                    if cooled {
                        state.last_alert_at_ms = Some(now_ms);
                    }
                    (cooled, true)
                }
            }
        };

        if should_fire {
            warn!(
                depth,
                threshold = self.depth_alert,
                "signal queue depth above threshold"
            );
            self.broker
                .publish(
                    "alerts",
                    &json!({
                        "kind": "queue_depth",
                        "depth": depth,
                        "threshold": self.depth_alert,
                        "at_ms": now_ms,
                    }),
                )
                .await
                .ok();
        }
        Ok(alerting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::AppConfig;
    use crate::ingest::{self, NormalizedSignal};
    use crate::types::Direction;
    use std::collections::HashMap;

    fn config(alert: &str, duration_sec: &str) -> AppConfig {
        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("DATABASE_URL", ":memory:".to_string());
        vars.insert("JWT_SECRET", "0123456789abcdef0123456789abcdef".to_string());
        vars.insert("PROCESSING_QUEUE_DEPTH_ALERT", alert.to_string());
        vars.insert("PROCESSING_QUEUE_DEPTH_DURATION_SEC", duration_sec.to_string());
        AppConfig::from_vars(|k| vars.get(k).cloned()).unwrap()
    }

    async fn seed_signals(store: &Store, count: usize) {
        let now = Utc::now().timestamp_millis();
        for i in 0..count {
            let iso = ingest::iso_from_ms(now + i as i64);
            let sig = NormalizedSignal {
                symbol: format!("SYM{i}"),
                direction: Direction::Long,
                timeframe: "5m".to_string(),
                event_timestamp_ms: now + i as i64,
                event_timestamp_iso: iso.clone(),
                fingerprint: ingest::fingerprint(&format!("SYM{i}"), Direction::Long, "5m", &iso),
            };
            store.insert_signal(&sig, "{}", now).await.unwrap();
        }
    }

    #[tokio::test]
    async fn empty_queue_reports_idle() {
        let store = Store::open_in_memory().unwrap();
        let broker = Arc::new(MemoryBroker::new());
        let monitor = QueueMonitor::new(
            store,
            broker,
            Arc::new(RealtimeHub::new()),
            &config("50", "120"),
        );
        monitor.run_once().await.unwrap();
        let snap = monitor.snapshot().unwrap();
        assert_eq!(snap.depth, 0);
        assert_eq!(snap.health, QueueHealth::Idle);
        assert!(!snap.alerting);
    }

    #[tokio::test]
    async fn depth_over_threshold_requires_duration_before_alert() {
        let store = Store::open_in_memory().unwrap();
        seed_signals(&store, 3).await;
        let broker = Arc::new(MemoryBroker::new());
        // Threshold 1, duration 0s: the first over-threshold heartbeat alerts.
        let monitor = QueueMonitor::new(
            store,
            broker.clone(),
            Arc::new(RealtimeHub::new()),
            &config("1", "0"),
        );

        monitor.run_once().await.unwrap();
        assert!(monitor.snapshot().unwrap().alerting);
        assert_eq!(broker.stream_entries("alerts").len(), 1);

        // Cooldown suppresses an immediate repeat.
        monitor.run_once().await.unwrap();
        assert_eq!(broker.stream_entries("alerts").len(), 1);
        assert!(monitor.snapshot().unwrap().alerting);
    }

    #[tokio::test]
    async fn long_duration_gate_defers_alert() {
        let store = Store::open_in_memory().unwrap();
        seed_signals(&store, 3).await;
        let broker = Arc::new(MemoryBroker::new());
        let monitor = QueueMonitor::new(
            store,
            broker.clone(),
            Arc::new(RealtimeHub::new()),
            &config("1", "3600"),
        );

        monitor.run_once().await.unwrap();
        // Over threshold but the hour-long gate has not elapsed.
        assert!(!monitor.snapshot().unwrap().alerting);
        assert!(broker.stream_entries("alerts").is_empty());
    }

    #[tokio::test]
    async fn waiting_work_with_no_processing_reads_stalled() {
        let store = Store::open_in_memory().unwrap();
        seed_signals(&store, 2).await;
        let monitor = QueueMonitor::new(
            store,
            Arc::new(MemoryBroker::new()),
            Arc::new(RealtimeHub::new()),
            &config("50", "120"),
        );
        monitor.run_once().await.unwrap();
        // Signals waiting, nothing ever processed: stalled.
        assert_eq!(monitor.snapshot().unwrap().health, QueueHealth::Stalled);
    }
}
