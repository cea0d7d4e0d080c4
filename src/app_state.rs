// =============================================================================
// Central Application State — Meridian Options Nexus
// =============================================================================
//
// The wiring hub handed to the HTTP layer. Subsystems are injected at
// construction (no globals): the store, the market-data provider, the
// realtime hub, the risk gate, and the worker registry the monitoring
// endpoint reads. Workers receive their own dependencies directly at
// construction in main.
// =============================================================================

use std::sync::Arc;

use crate::config::AppConfig;
use crate::market::MarketDataProvider;
use crate::monitor::QueueMonitor;
use crate::realtime::RealtimeHub;
use crate::risk::RiskGate;
use crate::store::Store;
use crate::worker::WorkerRegistry;

pub struct AppState {
    pub config: AppConfig,
    pub store: Store,
    pub market: Arc<dyn MarketDataProvider>,
    pub realtime: Arc<RealtimeHub>,
    pub risk: RiskGate,
    pub workers: Arc<WorkerRegistry>,
    /// Set after the queue monitor is constructed; the monitoring endpoint
    /// reads its latest snapshot.
    pub queue_monitor: parking_lot::RwLock<Option<Arc<QueueMonitor>>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Store,
        market: Arc<dyn MarketDataProvider>,
        realtime: Arc<RealtimeHub>,
        risk: RiskGate,
        workers: Arc<WorkerRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            market,
            realtime,
            risk,
            workers,
            queue_monitor: parking_lot::RwLock::new(None),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn attach_queue_monitor(&self, monitor: Arc<QueueMonitor>) {
        *self.queue_monitor.write() = Some(monitor);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
