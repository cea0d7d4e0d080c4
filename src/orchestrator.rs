// =============================================================================
// Orchestrator — per-signal pipeline with bounded fan-out
// =============================================================================
//
// Each tick: claim a batch of processable signals, then drive every signal
// through context -> experiment -> policy -> engines -> orders -> shadow ->
// mark-processed, with up to N signals in flight and a wall-clock timeout
// per signal.
//
// Failure discipline: collaborator errors never escape a signal's pipeline.
// A failed or timed-out signal is released with a capped-exponential
// next_retry_at; a gamma-delayed selection is requeued untouched; a logical
// rejection is terminal with no retry.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::bias::BiasReader;
use crate::config::AppConfig;
use crate::engines::{EngineCoordinator, EngineOutcome, MarketContext, TradeRecommendation};
use crate::experiment::ExperimentManager;
use crate::market::coalesce::GexCoalescer;
use crate::market::MarketDataProvider;
use crate::policy::PolicyEngine;
use crate::risk::RiskGate;
use crate::shadow::ShadowExecutor;
use crate::store::{PolicyRow, SignalRow, Store};
use crate::types::{EngineVariant, ExecutionMode, SignalStatus};

/// Retries before a signal is declared dead.
const MAX_PROCESSING_ATTEMPTS: i64 = 5;
/// Exponent cap for retry backoff.
const MAX_BACKOFF_EXPONENT: u32 = 6;
/// Hard ceiling on a single retry delay.
const MAX_BACKOFF_MS: u64 = 600_000;
/// How long a gamma-delayed signal waits before the next attempt.
const REGIME_DELAY_MS: i64 = 600_000;
/// Neutral IV percentile used until a vol collaborator supplies one.
const DEFAULT_IV_PERCENTILE: f64 = 50.0;

/// Capped exponential retry delay: B*2, B*4, ... B*2^n, never decreasing.
pub fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    let exp = attempt.clamp(1, MAX_BACKOFF_EXPONENT);
    base_ms.saturating_mul(1u64 << exp).min(MAX_BACKOFF_MS)
}

/// Terminal fate of one signal in one orchestrator pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalFate {
    Approved,
    Rejected(String),
    Delayed(String),
}

pub struct Orchestrator {
    store: Store,
    experiments: ExperimentManager,
    policy: PolicyEngine,
    coordinator: Arc<EngineCoordinator>,
    market: Arc<dyn MarketDataProvider>,
    gex: Arc<GexCoalescer>,
    bias: Arc<dyn BiasReader>,
    risk: RiskGate,
    shadow: ShadowExecutor,
    batch_size: usize,
    concurrency: usize,
    signal_timeout_ms: u64,
    retry_base_ms: u64,
    split: f64,
    policy_version: String,
    dual_paper_trading: bool,
    /// Rolling average pipeline latency (ms), for monitoring.
    avg_latency_ms: RwLock<f64>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        coordinator: Arc<EngineCoordinator>,
        market: Arc<dyn MarketDataProvider>,
        gex: Arc<GexCoalescer>,
        bias: Arc<dyn BiasReader>,
        risk: RiskGate,
        config: &AppConfig,
    ) -> Self {
        Self {
            experiments: ExperimentManager::new(store.clone()),
            policy: PolicyEngine::new(
                store.clone(),
                config.app_mode,
                config.policy_version.clone(),
            ),
            shadow: ShadowExecutor::new(store.clone()),
            store,
            coordinator,
            market,
            gex,
            bias,
            risk,
            batch_size: config.orchestrator_batch_size,
            concurrency: config.orchestrator_concurrency,
            signal_timeout_ms: config.orchestrator_signal_timeout_ms,
            retry_base_ms: config.orchestrator_retry_delay_ms,
            split: config.ab_split_percentage,
            policy_version: config.policy_version.clone(),
            dual_paper_trading: config.enable_dual_paper_trading,
            avg_latency_ms: RwLock::new(0.0),
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        *self.avg_latency_ms.read()
    }

    /// One tick: claim a batch, fan out with bounded concurrency, and wait
    /// for every claimed signal to reach a terminal or requeued state.
    pub async fn run_once(self: Arc<Self>) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let batch = self.store.claim_signal_batch(now_ms, self.batch_size).await?;
        if batch.is_empty() {
            return Ok(());
        }
        debug!(count = batch.len(), "orchestrator claimed batch");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(batch.len());

        for signal in batch {
            let this = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                // Semaphore closed only on runtime teardown.
                let Ok(_permit) = semaphore.acquire().await else { return };
                this.run_signal(signal).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Drive one claimed signal to completion, including the failure path.
    async fn run_signal(&self, signal: SignalRow) {
        let started = std::time::Instant::now();
        let deadline = Duration::from_millis(self.signal_timeout_ms);

        let result = timeout(deadline, self.process_signal(&signal)).await;
        let elapsed_ms = started.elapsed().as_millis() as f64;
        {
            let mut avg = self.avg_latency_ms.write();
            *avg = if *avg == 0.0 { elapsed_ms } else { *avg * 0.9 + elapsed_ms * 0.1 };
        }

        match result {
            Ok(Ok(SignalFate::Approved)) => {
                info!(signal_id = %signal.id, elapsed_ms, "signal approved");
            }
            Ok(Ok(SignalFate::Rejected(reason))) => {
                info!(signal_id = %signal.id, %reason, "signal rejected");
            }
            Ok(Ok(SignalFate::Delayed(reason))) => {
                info!(signal_id = %signal.id, %reason, "signal requeued (regime delay)");
            }
            Ok(Err(e)) => {
                warn!(signal_id = %signal.id, error = %e, "signal pipeline failed");
                self.handle_failure(&signal).await;
            }
            Err(_) => {
                warn!(signal_id = %signal.id, timeout_ms = self.signal_timeout_ms,
                      "signal pipeline timed out");
                self.handle_failure(&signal).await;
            }
        }
    }

    async fn handle_failure(&self, signal: &SignalRow) {
        let now_ms = Utc::now().timestamp_millis();
        let attempt = signal.processing_attempts + 1;
        let result = if attempt >= MAX_PROCESSING_ATTEMPTS {
            self.store.mark_signal_dead(&signal.id, now_ms).await
        } else {
            let delay = backoff_delay_ms(self.retry_base_ms, attempt as u32);
            self.store
                .mark_signal_failed(&signal.id, now_ms + delay as i64)
                .await
        };
        if let Err(e) = result {
            warn!(signal_id = %signal.id, error = %e, "failed to record signal failure");
        }
    }

    // =========================================================================
    // The per-signal pipeline
    // =========================================================================

    async fn process_signal(&self, signal: &SignalRow) -> Result<SignalFate> {
        let ctx = self.build_context(signal).await?;

        // ── Experiment + policy ─────────────────────────────────────────
        let experiment = self
            .experiments
            .create_experiment(signal, self.split, &self.policy_version)
            .await?;
        let policy = self
            .policy
            .get_execution_policy(&experiment, self.coordinator.availability())
            .await?;

        // ── Engines ─────────────────────────────────────────────────────
        let (outcome_a, outcome_b) = self.coordinator.invoke(signal, &ctx).await;

        // A gamma delay on the executed engine requeues the whole signal.
        let executed_outcome = match policy.executed_engine {
            Some(EngineVariant::A) => Some(&outcome_a),
            Some(EngineVariant::B) => Some(&outcome_b),
            None => None,
        };
        if let Some(EngineOutcome::Delayed(reason)) = executed_outcome {
            let now_ms = Utc::now().timestamp_millis();
            self.store
                .requeue_signal(&signal.id, now_ms + REGIME_DELAY_MS)
                .await?;
            return Ok(SignalFate::Delayed(reason.clone()));
        }

        // ── Annotate recommendations with shadow flags ──────────────────
        let recommendations = annotate_shadows(
            &policy,
            outcome_a.recommendation().cloned(),
            outcome_b.recommendation().cloned(),
            &experiment.id,
        );

        // ── Persist audit + orders ──────────────────────────────────────
        let now_ms = Utc::now().timestamp_millis();
        let mut approved = false;
        let mut reject_reason = "no executable recommendation".to_string();

        for rec in &recommendations {
            if rec.is_shadow {
                // Shadow handling: audit-store unless dual-paper semantics
                // (a collaborator decision) take over.
                if !self.dual_paper_trading {
                    self.shadow.record(signal, rec).await?;
                }
                continue;
            }

            self.store
                .insert_recommendation(
                    &signal.id,
                    &experiment.id,
                    rec.engine,
                    false,
                    &rec.symbol,
                    rec.direction.as_str(),
                    &rec.option_symbol,
                    rec.strike,
                    &rec.expiration,
                    rec.quantity,
                    rec.entry_price,
                    &rec.rationale.join("; "),
                    now_ms,
                )
                .await?;

            // ── Risk gate before the entry order ────────────────────────
            let (allowed, reason) = self.risk.can_enter(now_ms).await?;
            if !allowed {
                reject_reason = reason.unwrap_or_else(|| "risk gate".to_string());
                continue;
            }

            let inserted = self
                .store
                .insert_entry_order(
                    &signal.id,
                    rec.engine,
                    &experiment.id,
                    &rec.symbol,
                    &rec.option_symbol,
                    rec.strike,
                    &rec.expiration,
                    rec.option_type,
                    rec.quantity,
                    rec.setup_type,
                    now_ms,
                )
                .await?;

            match inserted {
                Some(order) => {
                    approved = true;
                    info!(
                        signal_id = %signal.id,
                        order_id = %order.id,
                        engine = %rec.engine,
                        contract = %rec.option_symbol,
                        quantity = rec.quantity,
                        "paper entry order created"
                    );
                }
                None => {
                    // Uniqueness suppressed the insert: a previous pass
                    // already entered for this engine. Still approved.
                    approved = true;
                    debug!(signal_id = %signal.id, engine = %rec.engine,
                           "entry order already exists — skipping");
                }
            }
        }

        // Engines that returned nothing for the executed slot -> rejected.
        if !approved {
            if let Some(EngineOutcome::Pass(reason)) = executed_outcome {
                reject_reason = reason.clone();
            }
        }

        let status = if approved {
            SignalStatus::Approved
        } else {
            SignalStatus::Rejected
        };
        self.store
            .mark_signal_processed(&signal.id, status, Some(&experiment.id), now_ms)
            .await?;

        Ok(if approved {
            SignalFate::Approved
        } else {
            SignalFate::Rejected(reject_reason)
        })
    }

    // =========================================================================
    // Context assembly
    // =========================================================================

    async fn build_context(&self, signal: &SignalRow) -> Result<MarketContext> {
        let spot_price = self
            .market
            .stock_price(&signal.symbol)
            .await
            .context("spot price unavailable")?;

        let chain = self
            .market
            .options_chain(&signal.symbol)
            .await
            .context("options chain unavailable")?;

        // Session label is best-effort: unknown hours degrade to regular.
        let hours = self.market.market_hours().await.unwrap_or(crate::market::MarketHours {
            is_market_open: true,
            minutes_until_close: 240,
        });
        let session = if hours.is_market_open { "regular" } else { "closed" };

        // GEX is advisory: a failed snapshot degrades to neutral.
        let gex = match self.gex.get(self.market.as_ref(), &signal.symbol).await {
            Ok(data) => {
                // Keep the analysis trail; losing it never blocks the signal.
                self.store
                    .insert_gex_snapshot(&data, Utc::now().timestamp_millis())
                    .await
                    .ok();
                data
            }
            Err(e) => {
                debug!(symbol = %signal.symbol, error = %e, "gex unavailable — neutral");
                crate::market::GexData {
                    symbol: signal.symbol.clone(),
                    gex_state: crate::types::GexState::Neutral,
                    dollar_gamma: 0.0,
                    flip_point: None,
                    as_of_ms: 0,
                }
            }
        };

        // Bias snapshot is best-effort.
        let bias = self.bias.current_state(&signal.symbol).await.unwrap_or(None);
        let regime = crate::bias::regime_hint(bias.as_ref());

        let today = Utc
            .timestamp_millis_opt(signal.event_timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now)
            .date_naive();

        Ok(MarketContext {
            spot_price,
            session: session.to_string(),
            minutes_until_close: hours.minutes_until_close,
            regime,
            gex,
            iv_percentile: DEFAULT_IV_PERCENTILE,
            bias,
            chain,
            today,
        })
    }
}

/// Apply the execution policy's shadow semantics to both recommendations.
fn annotate_shadows(
    policy: &PolicyRow,
    rec_a: Option<TradeRecommendation>,
    rec_b: Option<TradeRecommendation>,
    experiment_id: &str,
) -> Vec<TradeRecommendation> {
    let mut recommendations = Vec::new();
    for mut rec in [rec_a, rec_b].into_iter().flatten() {
        rec.experiment_id = Some(experiment_id.to_string());
        rec.is_shadow = match policy.execution_mode {
            ExecutionMode::ShadowOnly => true,
            ExecutionMode::EngineAPrimary => rec.engine == EngineVariant::B,
            ExecutionMode::EngineBPrimary => rec.engine == EngineVariant::A,
            ExecutionMode::SplitCapital => false,
        };
        recommendations.push(rec);
    }
    recommendations
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bias::NullBiasReader;
    use crate::config::AppConfig;
    use crate::engines::engine_a::MomentumEngine;
    use crate::engines::engine_b::ConfluenceEngine;
    use crate::ingest::{self, NormalizedSignal};
    use crate::market::StaticMarketData;
    use crate::strike::RiskBudget;
    use crate::types::{Direction, GexState, OrderStatus};
    use std::collections::HashMap;

    fn test_config() -> AppConfig {
        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("DATABASE_URL", ":memory:".to_string());
        vars.insert("JWT_SECRET", "0123456789abcdef0123456789abcdef".to_string());
        vars.insert("ORCHESTRATOR_SIGNAL_TIMEOUT_MS", "2000".to_string());
        AppConfig::from_vars(|k| vars.get(k).cloned()).unwrap()
    }

    fn budget() -> RiskBudget {
        RiskBudget {
            max_premium_loss: 5_000.0,
            max_capital_allocation: 5_000.0,
        }
    }

    async fn insert_signal(store: &Store, symbol: &str) -> SignalRow {
        let now = Utc::now().timestamp_millis();
        let iso = ingest::iso_from_ms(now);
        let sig = NormalizedSignal {
            symbol: symbol.to_string(),
            direction: Direction::Long,
            timeframe: "1h".to_string(),
            event_timestamp_ms: now,
            event_timestamp_iso: iso.clone(),
            fingerprint: ingest::fingerprint(symbol, Direction::Long, "1h", &iso),
        };
        store.insert_signal(&sig, "{}", now).await.unwrap()
    }

    fn orchestrator_with(market: Arc<StaticMarketData>, store: Store) -> Arc<Orchestrator> {
        let config = test_config();
        let coordinator = Arc::new(EngineCoordinator::new(
            Arc::new(MomentumEngine::new(budget())),
            Arc::new(ConfluenceEngine::new(budget(), Default::default())),
            1_000,
        ));
        let risk = RiskGate::new(store.clone(), &config);
        Arc::new(Orchestrator::new(
            store,
            coordinator,
            market,
            Arc::new(GexCoalescer::new()),
            Arc::new(NullBiasReader),
            risk,
            &config,
        ))
    }

    /// Swing-grade chain with a forward expiration relative to today.
    fn liquid_chain(today: chrono::NaiveDate) -> Vec<crate::market::OptionRow> {
        let expiration = today + chrono::Duration::days(45);
        vec![crate::market::OptionRow {
            option_symbol: "SPY_SWING_C505".to_string(),
            underlying: "SPY".to_string(),
            strike: 505.0,
            expiration,
            option_type: crate::types::OptionType::Call,
            bid: 4.90,
            ask: 5.10,
            last: 5.00,
            delta: 0.32,
            gamma: 0.01,
            theta: -0.05,
            vega: 0.5,
            iv: 0.22,
            open_interest: 1_500,
            volume: 300,
        }]
    }

    #[tokio::test]
    async fn happy_path_creates_experiment_policy_and_one_order() {
        let store = Store::open_in_memory().unwrap();
        let market = Arc::new(StaticMarketData::new());
        market.set_price("SPY", 500.0);
        market.set_chain("SPY", liquid_chain(Utc::now().date_naive()));

        let signal = insert_signal(&store, "SPY").await;
        let orch = orchestrator_with(market, store.clone());
        orch.clone().run_once().await.unwrap();

        let processed = store.get_signal(&signal.id).await.unwrap().unwrap();
        assert!(processed.processed);
        assert_eq!(processed.status, SignalStatus::Approved);
        assert!(processed.experiment_id.is_some());

        let experiment = store.get_experiment_by_signal(&signal.id).await.unwrap().unwrap();
        let policy = store
            .get_policy_by_experiment(&experiment.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(policy.execution_mode, ExecutionMode::EngineAPrimary);
        assert_eq!(policy.executed_engine, Some(EngineVariant::A));

        let orders = store.recent_orders(10).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].engine, Some(EngineVariant::A));
        assert_eq!(orders[0].status, OrderStatus::PendingExecution);

        // A second tick is a no-op: nothing left to claim, still one order.
        orch.clone().run_once().await.unwrap();
        assert_eq!(store.recent_orders(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_chain_rejects_without_order() {
        let store = Store::open_in_memory().unwrap();
        let market = Arc::new(StaticMarketData::new());
        market.set_price("SPY", 500.0);
        market.set_chain("SPY", Vec::new());

        let signal = insert_signal(&store, "SPY").await;
        let orch = orchestrator_with(market, store.clone());
        orch.clone().run_once().await.unwrap();

        let processed = store.get_signal(&signal.id).await.unwrap().unwrap();
        assert!(processed.processed);
        assert_eq!(processed.status, SignalStatus::Rejected);
        assert!(store.recent_orders(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gamma_delay_requeues_instead_of_processing() {
        let store = Store::open_in_memory().unwrap();
        let market = Arc::new(StaticMarketData::new());
        market.set_price("SPY", 500.0);
        market.set_chain("SPY", liquid_chain(Utc::now().date_naive()));
        market.set_gex(
            "SPY",
            crate::market::GexData {
                symbol: "SPY".to_string(),
                gex_state: GexState::PositiveHigh,
                dollar_gamma: 2.0e9,
                flip_point: None,
                as_of_ms: Utc::now().timestamp_millis(),
            },
        );

        let signal = insert_signal(&store, "SPY").await;
        let orch = orchestrator_with(market, store.clone());
        orch.clone().run_once().await.unwrap();

        let row = store.get_signal(&signal.id).await.unwrap().unwrap();
        assert!(!row.processed, "delayed signal must not be processed");
        assert!(!row.processing_lock, "lock must be released");
        assert!(row.queued_until_ms.is_some());
        assert!(store.recent_orders(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_market_data_schedules_retry() {
        let store = Store::open_in_memory().unwrap();
        // No price fixture: stock_price errors.
        let market = Arc::new(StaticMarketData::new());

        let signal = insert_signal(&store, "SPY").await;
        let orch = orchestrator_with(market, store.clone());
        orch.clone().run_once().await.unwrap();

        let row = store.get_signal(&signal.id).await.unwrap().unwrap();
        assert!(!row.processed);
        assert_eq!(row.processing_attempts, 1);
        assert!(row.next_retry_at_ms.is_some());
    }

    #[tokio::test]
    async fn risk_cap_rejects_entry() {
        let store = Store::open_in_memory().unwrap();
        let market = Arc::new(StaticMarketData::new());
        market.set_price("SPY", 500.0);
        market.set_chain("SPY", liquid_chain(Utc::now().date_naive()));

        // Zero open-position cap blocks every entry.
        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("DATABASE_URL", ":memory:".to_string());
        vars.insert("JWT_SECRET", "0123456789abcdef0123456789abcdef".to_string());
        vars.insert("MAX_OPEN_POSITIONS", "0".to_string());
        let config = AppConfig::from_vars(|k| vars.get(k).cloned()).unwrap();

        let coordinator = Arc::new(EngineCoordinator::new(
            Arc::new(MomentumEngine::new(budget())),
            Arc::new(ConfluenceEngine::new(budget(), Default::default())),
            1_000,
        ));
        let risk = RiskGate::new(store.clone(), &config);
        let orch = Arc::new(Orchestrator::new(
            store.clone(),
            coordinator,
            market,
            Arc::new(GexCoalescer::new()),
            Arc::new(NullBiasReader),
            risk,
            &config,
        ));

        let signal = insert_signal(&store, "SPY").await;
        orch.clone().run_once().await.unwrap();

        let row = store.get_signal(&signal.id).await.unwrap().unwrap();
        assert_eq!(row.status, SignalStatus::Rejected);
        assert!(store.recent_orders(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shadow_engine_recommendation_is_recorded_not_ordered() {
        let store = Store::open_in_memory().unwrap();
        let market = Arc::new(StaticMarketData::new());
        market.set_price("SPY", 500.0);
        let today = Utc::now().date_naive();

        // Chain serves both horizons: engine A picks the swing contract,
        // engine B (extended horizon) the position contract.
        let mut chain = liquid_chain(today);
        let position_exp = today + chrono::Duration::days(95);
        chain.push(crate::market::OptionRow {
            option_symbol: "SPY_POS_C510".to_string(),
            underlying: "SPY".to_string(),
            strike: 510.0,
            expiration: position_exp,
            option_type: crate::types::OptionType::Call,
            bid: 7.90,
            ask: 8.20,
            last: 8.05,
            delta: 0.40,
            gamma: 0.008,
            theta: -0.04,
            vega: 0.8,
            iv: 0.20,
            open_interest: 800,
            volume: 60,
        });
        market.set_chain("SPY", chain);

        // Bullish bias with strong confluence arms engine B.
        let broker = Arc::new(crate::broker::MemoryBroker::new());
        broker.put(
            "bias:SPY",
            r#"{"symbol":"SPY","bias":"bullish","confluence_score":80.0,"as_of_ms":1}"#,
        );

        let config = test_config();
        let coordinator = Arc::new(EngineCoordinator::new(
            Arc::new(MomentumEngine::new(budget())),
            Arc::new(ConfluenceEngine::new(budget(), Default::default())),
            1_000,
        ));
        let risk = RiskGate::new(store.clone(), &config);
        let orch = Arc::new(Orchestrator::new(
            store.clone(),
            coordinator,
            market,
            Arc::new(GexCoalescer::new()),
            Arc::new(crate::bias::BrokerBiasReader::new(broker)),
            risk,
            &config,
        ));

        let signal = insert_signal(&store, "SPY").await;
        orch.clone().run_once().await.unwrap();

        // Only engine A's recommendation became an order.
        let orders = store.recent_orders(10).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].engine, Some(EngineVariant::A));

        // Engine B's landed as a shadow entry instead.
        let conn = store.lock().await;
        let shadows: i64 = conn
            .query_row("SELECT COUNT(*) FROM shadow_positions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(shadows, 1);
        let shadow_recs: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM decision_recommendations WHERE is_shadow = 1 AND engine = 'B'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(shadow_recs, 1);
        drop(conn);

        let processed = store.get_signal(&signal.id).await.unwrap().unwrap();
        assert_eq!(processed.status, SignalStatus::Approved);
    }

    #[tokio::test]
    async fn full_signal_lifecycle_entry_to_stop_loss_close() {
        let store = Store::open_in_memory().unwrap();
        store
            .seed_exit_rule_if_missing(50.0, 50.0, 720.0, 3, 0)
            .await
            .unwrap();

        let market = Arc::new(StaticMarketData::new());
        market.set_price("SPY", 500.0);
        let today = Utc::now().date_naive();
        let chain = liquid_chain(today);
        let contract = chain[0].clone();
        market.set_chain("SPY", chain);
        let quote_key = crate::market::static_quote_key(
            "SPY",
            contract.strike,
            contract.expiration,
            contract.option_type,
        );
        market.set_quote(
            &quote_key,
            crate::market::OptionQuote { bid: 4.90, ask: 5.10, mid: 5.00 },
        );

        let config = test_config();
        let risk = RiskGate::new(store.clone(), &config);
        let realtime = Arc::new(crate::realtime::RealtimeHub::new());

        // 1. Orchestrator approves the signal and creates one entry order.
        let signal = insert_signal(&store, "SPY").await;
        let orch = orchestrator_with(market.clone(), store.clone());
        orch.clone().run_once().await.unwrap();
        assert_eq!(
            store.get_signal(&signal.id).await.unwrap().unwrap().status,
            SignalStatus::Approved
        );

        // 2. Paper executor fills the entry and opens a position.
        let paper = crate::paper::PaperExecutor::new(
            store.clone(),
            market.clone(),
            realtime.clone(),
            risk.clone(),
            Arc::new(NullBiasReader),
            &config,
        );
        paper.run_once().await.unwrap();
        let position = store.open_positions(10).await.unwrap().remove(0);
        assert_eq!(store.recent_trades(10).await.unwrap().len(), 1);

        // 3. Price collapses; the exit monitor reserves a full stop-loss exit.
        market.set_quote(
            &quote_key,
            crate::market::OptionQuote { bid: 1.95, ask: 2.05, mid: 2.00 },
        );
        let exit_monitor = crate::exits::monitor::ExitMonitor::new(
            store.clone(),
            market.clone(),
            Arc::new(NullBiasReader),
            realtime.clone(),
            &config,
        );
        exit_monitor.run_once().await.unwrap();
        let reserved = store.get_position(&position.id).await.unwrap().unwrap();
        assert_eq!(reserved.status, crate::types::PositionStatus::Closing);

        // 4. The executor fills the exit order and closes the position.
        paper.run_once().await.unwrap();
        let closed = store.get_position(&position.id).await.unwrap().unwrap();
        assert_eq!(closed.status, crate::types::PositionStatus::Closed);
        assert!(closed.realized_pnl.unwrap() < 0.0);
        assert_eq!(closed.exit_reason.as_deref(), Some("STOP_LOSS_HIT"));
        assert_eq!(store.recent_trades(10).await.unwrap().len(), 2);
    }

    #[test]
    fn backoff_is_monotone_and_capped() {
        let base = 5_000;
        let mut last = 0;
        for attempt in 1..=10 {
            let delay = backoff_delay_ms(base, attempt);
            assert!(delay >= last, "delay must never decrease");
            assert!(delay <= MAX_BACKOFF_MS);
            last = delay;
        }
        assert_eq!(backoff_delay_ms(base, 1), 10_000);
        assert_eq!(backoff_delay_ms(base, 2), 20_000);
        assert_eq!(backoff_delay_ms(base, 3), 40_000);
    }
}
