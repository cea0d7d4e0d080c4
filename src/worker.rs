// =============================================================================
// Worker Harness — periodic ticks with status tracking and graceful drain
// =============================================================================
//
// Every background worker (orchestrator, paper executor, exit monitor,
// refresher, queue monitor) runs through this harness:
//
//   - a tokio interval drives the tick closure;
//   - each tick's outcome lands in a shared `WorkerStatus` the monitoring
//     endpoint reads;
//   - failed ticks back off exponentially (capped) before the next attempt;
//   - `stop_and_drain` flips a watch channel and waits for the in-flight
//     tick up to a deadline.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Extra-delay ceiling after consecutive tick failures.
const MAX_TICK_BACKOFF_MS: u64 = 60_000;

/// Live status of one background worker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub last_run_at_ms: Option<i64>,
    pub last_duration_ms: Option<u64>,
    pub last_error_at_ms: Option<i64>,
    pub last_error: Option<String>,
    pub backoff_ms: u64,
}

/// Registry of worker statuses, keyed by worker name.
#[derive(Default)]
pub struct WorkerRegistry {
    statuses: RwLock<HashMap<String, Arc<RwLock<WorkerStatus>>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, name: &str) -> Arc<RwLock<WorkerStatus>> {
        let status = Arc::new(RwLock::new(WorkerStatus::default()));
        self.statuses
            .write()
            .insert(name.to_string(), status.clone());
        status
    }

    /// Snapshot of every worker's status for the monitoring endpoint.
    pub fn snapshot(&self) -> HashMap<String, WorkerStatus> {
        self.statuses
            .read()
            .iter()
            .map(|(name, status)| (name.clone(), status.read().clone()))
            .collect()
    }
}

/// Handle to a spawned worker, used for graceful shutdown.
pub struct WorkerHandle {
    pub name: String,
    shutdown_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop the tick loop and wait up to `timeout_ms` for the in-flight tick
    /// to finish. Returns true when the worker drained cleanly.
    pub async fn stop_and_drain(self, timeout_ms: u64) -> bool {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.join).await {
            Ok(_) => {
                info!(worker = %self.name, "worker drained");
                true
            }
            Err(_) => {
                warn!(worker = %self.name, timeout_ms, "worker did not drain before deadline");
                false
            }
        }
    }
}

/// Spawn a periodic worker. The tick closure is invoked once per interval;
/// an `Err` tick is logged, recorded, and delays the next tick by a capped
/// exponential backoff.
pub fn spawn_worker<F, Fut>(
    name: &str,
    interval_ms: u64,
    registry: &WorkerRegistry,
    tick: F,
) -> WorkerHandle
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let status = registry.register(name);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let worker_name = name.to_string();

    let join = tokio::spawn(async move {
        info!(worker = %worker_name, interval_ms, "worker started");
        let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
            if *shutdown_rx.borrow() {
                break;
            }

            let started = std::time::Instant::now();
            {
                let mut s = status.write();
                s.running = true;
                s.last_run_at_ms = Some(Utc::now().timestamp_millis());
            }

            let result = tick().await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(()) => {
                    consecutive_errors = 0;
                    let mut s = status.write();
                    s.running = false;
                    s.last_duration_ms = Some(elapsed_ms);
                    s.backoff_ms = 0;
                    debug!(worker = %worker_name, elapsed_ms, "tick complete");
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff_ms = (interval_ms.saturating_mul(1 << consecutive_errors.min(6)))
                        .min(MAX_TICK_BACKOFF_MS);
                    {
                        let mut s = status.write();
                        s.running = false;
                        s.last_duration_ms = Some(elapsed_ms);
                        s.last_error_at_ms = Some(Utc::now().timestamp_millis());
                        s.last_error = Some(format!("{e:#}"));
                        s.backoff_ms = backoff_ms;
                    }
                    error!(worker = %worker_name, error = %e, backoff_ms, "tick failed");

                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        info!(worker = %worker_name, "worker stopped");
    });

    WorkerHandle {
        name: name.to_string(),
        shutdown_tx,
        join,
    }
}
