// =============================================================================
// Engine Coordinator — run both decision engines in parallel, under timeout
// =============================================================================
//
// The two engines are opaque behind `EngineAdapter`. The coordinator invokes
// both concurrently with independent wall-clock timeouts; one engine timing
// out or erroring never aborts its sibling. The coordinator itself performs
// no mutation — annotation (shadow flags, experiment ids) happens in the
// orchestrator.
// =============================================================================

pub mod engine_a;
pub mod engine_b;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use tokio::time::{timeout, Duration};
use tracing::warn;

use crate::bias::UnifiedBiasState;
use crate::market::{GexData, OptionRow};
use crate::store::SignalRow;
use crate::types::{Direction, EngineVariant, OptionType, Regime, SetupType};

/// Everything the engines may consult for one signal. Built once by the
/// orchestrator; engines never fetch on their own.
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub spot_price: f64,
    /// Session label: `regular` or `closed`.
    pub session: String,
    pub minutes_until_close: i64,
    pub regime: Regime,
    pub gex: GexData,
    /// Underlying IV percentile in [0, 100].
    pub iv_percentile: f64,
    pub bias: Option<UnifiedBiasState>,
    pub chain: Vec<OptionRow>,
    pub today: NaiveDate,
}

/// A concrete trade proposal from one engine.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecommendation {
    pub symbol: String,
    pub direction: Direction,
    pub option_type: OptionType,
    pub option_symbol: String,
    pub strike: f64,
    /// Expiration date as `YYYY-MM-DD`.
    pub expiration: String,
    pub quantity: i64,
    pub entry_price: f64,
    pub engine: EngineVariant,
    pub setup_type: SetupType,
    /// Set by the orchestrator from the execution policy.
    pub is_shadow: bool,
    pub experiment_id: Option<String>,
    pub rationale: Vec<String>,
}

/// Per-engine result for one signal.
#[derive(Debug, Clone)]
pub enum EngineOutcome {
    Recommend(TradeRecommendation),
    /// The engine declined: logical rejection, no retry.
    Pass(String),
    /// The gamma regime delayed the entry: requeue quietly, no failure.
    Delayed(String),
}

impl EngineOutcome {
    pub fn recommendation(&self) -> Option<&TradeRecommendation> {
        match self {
            Self::Recommend(rec) => Some(rec),
            _ => None,
        }
    }

    pub fn is_delayed(&self) -> bool {
        matches!(self, Self::Delayed(_))
    }
}

#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn variant(&self) -> EngineVariant;
    fn name(&self) -> &'static str;

    /// Evaluate one signal against the market context.
    async fn evaluate(&self, signal: &SignalRow, ctx: &MarketContext) -> Result<EngineOutcome>;
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct EngineCoordinator {
    engine_a: Arc<dyn EngineAdapter>,
    engine_b: Arc<dyn EngineAdapter>,
    engine_timeout_ms: u64,
}

impl EngineCoordinator {
    pub fn new(
        engine_a: Arc<dyn EngineAdapter>,
        engine_b: Arc<dyn EngineAdapter>,
        engine_timeout_ms: u64,
    ) -> Self {
        Self {
            engine_a,
            engine_b,
            engine_timeout_ms,
        }
    }

    pub fn availability(&self) -> crate::policy::EngineAvailability {
        crate::policy::EngineAvailability {
            engine_a: true,
            engine_b: true,
        }
    }

    /// Run both engines concurrently. Failure or timeout of one engine
    /// degrades that engine to a pass without touching the other.
    pub async fn invoke(
        &self,
        signal: &SignalRow,
        ctx: &MarketContext,
    ) -> (EngineOutcome, EngineOutcome) {
        let deadline = Duration::from_millis(self.engine_timeout_ms);

        let run_a = timeout(deadline, self.engine_a.evaluate(signal, ctx));
        let run_b = timeout(deadline, self.engine_b.evaluate(signal, ctx));
        let (result_a, result_b) = tokio::join!(run_a, run_b);

        (
            flatten(self.engine_a.name(), signal, result_a),
            flatten(self.engine_b.name(), signal, result_b),
        )
    }
}

fn flatten(
    engine: &str,
    signal: &SignalRow,
    result: std::result::Result<Result<EngineOutcome>, tokio::time::error::Elapsed>,
) -> EngineOutcome {
    match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            warn!(engine, signal_id = %signal.id, error = %e, "engine evaluation failed");
            EngineOutcome::Pass(format!("{engine} error: {e}"))
        }
        Err(_) => {
            warn!(engine, signal_id = %signal.id, "engine evaluation timed out");
            EngineOutcome::Pass(format!("{engine} timed out"))
        }
    }
}

// =============================================================================
// Shared helpers for the concrete engines
// =============================================================================

/// Rough expected move (%) per setup horizon, used by the strike scorer.
pub(crate) fn expected_move_pct(setup: SetupType) -> f64 {
    match setup {
        SetupType::ScalpGuarded => 0.5,
        SetupType::Swing => 2.0,
        SetupType::Position => 5.0,
        SetupType::Leaps => 12.0,
    }
}

/// Expected hold in minutes per setup horizon.
pub(crate) fn expected_hold_min(setup: SetupType) -> f64 {
    match setup {
        SetupType::ScalpGuarded => 60.0,
        SetupType::Swing => 3.0 * 24.0 * 60.0,
        SetupType::Position => 14.0 * 24.0 * 60.0,
        SetupType::Leaps => 90.0 * 24.0 * 60.0,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{GexState, SignalStatus};

    pub(crate) fn test_signal(symbol: &str, direction: Direction, timeframe: &str) -> SignalRow {
        SignalRow {
            id: "sig-1".to_string(),
            symbol: symbol.to_string(),
            direction,
            timeframe: timeframe.to_string(),
            event_timestamp_ms: 1_710_513_000_000,
            fingerprint: "fp".to_string(),
            raw_payload: None,
            status: SignalStatus::Pending,
            processed: false,
            processing_lock: true,
            queued_until_ms: None,
            next_retry_at_ms: None,
            processing_attempts: 0,
            experiment_id: None,
            processed_at_ms: None,
            created_at_ms: 1_710_513_000_000,
        }
    }

    pub(crate) fn test_context(chain: Vec<OptionRow>) -> MarketContext {
        MarketContext {
            spot_price: 500.0,
            session: "regular".to_string(),
            minutes_until_close: 240,
            regime: Regime::Bull,
            gex: GexData {
                symbol: "SPY".to_string(),
                gex_state: GexState::Neutral,
                dollar_gamma: 0.0,
                flip_point: None,
                as_of_ms: 0,
            },
            iv_percentile: 40.0,
            bias: None,
            chain,
            today: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
        }
    }

    pub(crate) fn swing_call_chain() -> Vec<OptionRow> {
        let expiration = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap() + chrono::Duration::days(45);
        vec![OptionRow {
            option_symbol: "SPY240429C00505000".to_string(),
            underlying: "SPY".to_string(),
            strike: 505.0,
            expiration,
            option_type: OptionType::Call,
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

    struct StubEngine {
        variant: EngineVariant,
        outcome: EngineOutcome,
        delay_ms: u64,
    }

    #[async_trait]
    impl EngineAdapter for StubEngine {
        fn variant(&self) -> EngineVariant {
            self.variant
        }
        fn name(&self) -> &'static str {
            "stub"
        }
        async fn evaluate(&self, _: &SignalRow, _: &MarketContext) -> Result<EngineOutcome> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            Ok(self.outcome.clone())
        }
    }

    struct FailingEngine;

    #[async_trait]
    impl EngineAdapter for FailingEngine {
        fn variant(&self) -> EngineVariant {
            EngineVariant::B
        }
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn evaluate(&self, _: &SignalRow, _: &MarketContext) -> Result<EngineOutcome> {
            anyhow::bail!("vendor unavailable")
        }
    }

    #[tokio::test]
    async fn sibling_survives_engine_failure() {
        let a = Arc::new(StubEngine {
            variant: EngineVariant::A,
            outcome: EngineOutcome::Pass("no edge".to_string()),
            delay_ms: 0,
        });
        let coordinator = EngineCoordinator::new(a, Arc::new(FailingEngine), 1_000);

        let signal = test_signal("SPY", Direction::Long, "5m");
        let ctx = test_context(Vec::new());
        let (outcome_a, outcome_b) = coordinator.invoke(&signal, &ctx).await;

        assert!(matches!(outcome_a, EngineOutcome::Pass(_)));
        match outcome_b {
            EngineOutcome::Pass(reason) => assert!(reason.contains("vendor unavailable")),
            other => panic!("expected pass, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_engine_times_out_without_aborting_sibling() {
        let a = Arc::new(StubEngine {
            variant: EngineVariant::A,
            outcome: EngineOutcome::Pass("fast".to_string()),
            delay_ms: 0,
        });
        let b = Arc::new(StubEngine {
            variant: EngineVariant::B,
            outcome: EngineOutcome::Pass("slow".to_string()),
            delay_ms: 500,
        });
        let coordinator = EngineCoordinator::new(a, b, 50);

        let signal = test_signal("SPY", Direction::Long, "5m");
        let ctx = test_context(Vec::new());
        let (outcome_a, outcome_b) = coordinator.invoke(&signal, &ctx).await;

        match outcome_a {
            EngineOutcome::Pass(reason) => assert_eq!(reason, "fast"),
            other => panic!("expected pass, got {other:?}"),
        }
        match outcome_b {
            EngineOutcome::Pass(reason) => assert!(reason.contains("timed out")),
            other => panic!("expected timeout pass, got {other:?}"),
        }
    }
}
