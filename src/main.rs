// =============================================================================
// Meridian Options Nexus — Main Entry Point
// =============================================================================
//
// Boot sequence: load + validate config (fatal on error), open the store,
// connect the broker, wire the collaborators, start the API server, spawn
// the background workers, then wait for Ctrl+C and drain every worker
// gracefully.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod auth;
mod bias;
mod broker;
mod config;
mod engines;
mod exits;
mod experiment;
mod ingest;
mod market;
mod monitor;
mod orchestrator;
mod paper;
mod policy;
mod realtime;
mod refresher;
mod risk;
mod shadow;
mod store;
mod strike;
mod types;
mod worker;

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::bias::BrokerBiasReader;
use crate::broker::{Broker, MemoryBroker, RedisBroker};
use crate::config::AppConfig;
use crate::engines::engine_a::MomentumEngine;
use crate::engines::engine_b::ConfluenceEngine;
use crate::engines::EngineCoordinator;
use crate::exits::monitor::ExitMonitor;
use crate::market::coalesce::GexCoalescer;
use crate::market::http::HttpMarketData;
use crate::market::{MarketDataProvider, StaticMarketData};
use crate::monitor::QueueMonitor;
use crate::orchestrator::Orchestrator;
use crate::paper::PaperExecutor;
use crate::realtime::RealtimeHub;
use crate::refresher::PositionRefresher;
use crate::risk::RiskGate;
use crate::store::Store;
use crate::worker::{spawn_worker, WorkerHandle, WorkerRegistry};

/// Per-engine evaluation timeout inside the coordinator.
const ENGINE_TIMEOUT_MS: u64 = 10_000;
/// Drain budget per worker at shutdown.
const DRAIN_TIMEOUT_MS: u64 = 10_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Options Nexus — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration — refusing to start");
            std::process::exit(1);
        }
    };

    // ── 2. Store ─────────────────────────────────────────────────────────
    let store = Store::open(&config.database_url)?;
    store
        .seed_exit_rule_if_missing(
            config.profit_target_pct,
            config.stop_loss_pct,
            (config.max_hold_days * 24) as f64,
            config.time_stop_dte,
            Utc::now().timestamp_millis(),
        )
        .await?;
    info!(path = %config.database_url, "store opened");

    // ── 3. Broker ────────────────────────────────────────────────────────
    let broker: Arc<dyn Broker> = match &config.redis_url {
        Some(url) => Arc::new(RedisBroker::connect(url).await?),
        None => {
            warn!("REDIS_URL not set — using in-process broker");
            Arc::new(MemoryBroker::new())
        }
    };

    // ── 4. Market data ───────────────────────────────────────────────────
    let market: Arc<dyn MarketDataProvider> = match &config.market_data_base_url {
        Some(base_url) => Arc::new(HttpMarketData::new(
            base_url.clone(),
            config.market_data_timeout_ms,
        )),
        None => {
            warn!("MARKET_DATA_BASE_URL not set — using static provider");
            Arc::new(StaticMarketData::new())
        }
    };
    let gex = Arc::new(GexCoalescer::new());

    // ── 5. Shared state ──────────────────────────────────────────────────
    let bias = Arc::new(BrokerBiasReader::new(broker.clone()));
    let realtime = Arc::new(RealtimeHub::new());
    let registry = Arc::new(WorkerRegistry::new());
    let risk = RiskGate::new(store.clone(), &config);

    let state = Arc::new(AppState::new(
        config.clone(),
        store.clone(),
        market.clone(),
        realtime.clone(),
        risk.clone(),
        registry.clone(),
    ));

    // ── 6. Engines & orchestrator ────────────────────────────────────────
    let budget = risk.entry_budget();
    let confluence = crate::engines::engine_b::ConfluenceSettings {
        min_threshold: config.confluence_min_threshold,
        gate_enabled: config.enable_confluence_gate,
        sizing_enabled: config.enable_confluence_sizing,
    };
    let coordinator = Arc::new(EngineCoordinator::new(
        Arc::new(MomentumEngine::new(budget)),
        Arc::new(ConfluenceEngine::new(budget, confluence)),
        ENGINE_TIMEOUT_MS,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        coordinator,
        market.clone(),
        gex,
        bias.clone(),
        risk.clone(),
        &config,
    ));

    // ── 7. API server ────────────────────────────────────────────────────
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 8. Background workers ────────────────────────────────────────────
    let mut handles: Vec<WorkerHandle> = Vec::new();

    if config.enable_orchestrator {
        let orch = orchestrator.clone();
        handles.push(spawn_worker(
            "orchestrator",
            config.orchestrator_interval_ms,
            &registry,
            move || {
                let orch = orch.clone();
                async move { orch.run_once().await }
            },
        ));
    } else {
        warn!("orchestrator disabled by flag");
    }

    let paper = Arc::new(PaperExecutor::new(
        store.clone(),
        market.clone(),
        realtime.clone(),
        risk.clone(),
        bias.clone(),
        &config,
    ));
    {
        let paper = paper.clone();
        handles.push(spawn_worker(
            "paper_executor",
            config.paper_executor_interval_ms,
            &registry,
            move || {
                let paper = paper.clone();
                async move { paper.run_once().await }
            },
        ));
    }

    let exit_monitor = Arc::new(ExitMonitor::new(
        store.clone(),
        market.clone(),
        bias.clone(),
        realtime.clone(),
        &config,
    ));
    {
        let exit_monitor = exit_monitor.clone();
        handles.push(spawn_worker(
            "exit_monitor",
            config.exit_monitor_interval_ms,
            &registry,
            move || {
                let exit_monitor = exit_monitor.clone();
                async move { exit_monitor.run_once().await }
            },
        ));
    }

    let refresher = Arc::new(PositionRefresher::new(
        store.clone(),
        market.clone(),
        realtime.clone(),
    ));
    {
        let refresher = refresher.clone();
        handles.push(spawn_worker(
            "position_refresher",
            config.position_refresh_interval_ms,
            &registry,
            move || {
                let refresher = refresher.clone();
                async move { refresher.run_once().await }
            },
        ));
    }

    let queue_monitor = Arc::new(QueueMonitor::new(
        store.clone(),
        broker.clone(),
        realtime.clone(),
        &config,
    ));
    state.attach_queue_monitor(queue_monitor.clone());
    {
        let queue_monitor = queue_monitor.clone();
        handles.push(spawn_worker(
            "queue_monitor",
            60_000,
            &registry,
            move || {
                let queue_monitor = queue_monitor.clone();
                async move { queue_monitor.run_once().await }
            },
        ));
    }

    info!(
        workers = handles.len(),
        mode = %config.app_mode,
        "all subsystems running — press Ctrl+C to stop"
    );

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — draining workers");

    for handle in handles {
        handle.stop_and_drain(DRAIN_TIMEOUT_MS).await;
    }

    info!("Meridian Options Nexus shut down complete.");
    Ok(())
}
