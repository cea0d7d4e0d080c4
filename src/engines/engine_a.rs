// =============================================================================
// Engine A — momentum engine
// =============================================================================
//
// Trades in the signal's direction on the signal's own horizon. Confidence
// starts from a base and moves with bias alignment and session quality;
// the strike selector does the heavy lifting from there.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::bias::BiasDirection;
use crate::store::SignalRow;
use crate::strike::{select_strike, RiskBudget, SelectionOutcome, StrikeRequest};
use crate::types::{Direction, EngineVariant, OptionType, SetupType};

use super::{expected_hold_min, expected_move_pct, EngineAdapter, EngineOutcome, MarketContext, TradeRecommendation};

/// Base confidence before context adjustments.
const BASE_CONFIDENCE: f64 = 60.0;
/// Minimum confidence required to trade at all.
const MIN_CONFIDENCE: f64 = 45.0;

pub struct MomentumEngine {
    budget: RiskBudget,
}

impl MomentumEngine {
    pub fn new(budget: RiskBudget) -> Self {
        Self { budget }
    }

    fn confidence(&self, signal: &SignalRow, ctx: &MarketContext) -> f64 {
        let mut confidence = BASE_CONFIDENCE;

        // Bias alignment moves the needle both ways.
        if let Some(bias) = &ctx.bias {
            let aligned = matches!(
                (signal.direction, bias.bias),
                (Direction::Long, BiasDirection::Bullish)
                    | (Direction::Short, BiasDirection::Bearish)
            );
            let contra = matches!(
                (signal.direction, bias.bias),
                (Direction::Long, BiasDirection::Bearish)
                    | (Direction::Short, BiasDirection::Bullish)
            );
            if aligned {
                confidence += bias.confluence_score * 0.25;
            } else if contra {
                confidence -= bias.confluence_score * 0.35;
            }
        }

        // Entries into the close get a haircut.
        if ctx.minutes_until_close < 30 {
            confidence -= 15.0;
        }

        confidence.clamp(0.0, 100.0)
    }
}

#[async_trait]
impl EngineAdapter for MomentumEngine {
    fn variant(&self) -> EngineVariant {
        EngineVariant::A
    }

    fn name(&self) -> &'static str {
        "momentum"
    }

    async fn evaluate(&self, signal: &SignalRow, ctx: &MarketContext) -> Result<EngineOutcome> {
        if ctx.session == "closed" {
            return Ok(EngineOutcome::Pass("market closed".to_string()));
        }

        let confidence = self.confidence(signal, ctx);
        if confidence < MIN_CONFIDENCE {
            return Ok(EngineOutcome::Pass(format!(
                "confidence {confidence:.0} below floor {MIN_CONFIDENCE:.0}"
            )));
        }

        let setup_type = SetupType::from_timeframe(&signal.timeframe);
        let direction = OptionType::from_direction(signal.direction);

        let request = StrikeRequest {
            symbol: signal.symbol.clone(),
            spot_price: ctx.spot_price,
            direction,
            setup_type,
            signal_confidence: confidence,
            expected_hold_min: expected_hold_min(setup_type),
            expected_move_pct: expected_move_pct(setup_type),
            regime: ctx.regime,
            gex_state: ctx.gex.gex_state,
            iv_percentile: ctx.iv_percentile,
            event_risk: Vec::new(),
            risk_budget: self.budget,
            chain: ctx.chain.clone(),
            today: ctx.today,
        };

        match select_strike(&request) {
            SelectionOutcome::Selected(sel) => {
                let mut rationale = vec![format!(
                    "momentum {} {} setup={} confidence={confidence:.0}",
                    signal.symbol, signal.direction, setup_type
                )];
                rationale.extend(sel.rationale.clone());

                debug!(
                    signal_id = %signal.id,
                    contract = %sel.contract.option_symbol,
                    contracts = sel.contracts,
                    "momentum engine recommends"
                );

                Ok(EngineOutcome::Recommend(TradeRecommendation {
                    symbol: signal.symbol.clone(),
                    direction: signal.direction,
                    option_type: direction,
                    option_symbol: sel.contract.option_symbol.clone(),
                    strike: sel.contract.strike,
                    expiration: sel.contract.expiration.format("%Y-%m-%d").to_string(),
                    quantity: sel.contracts,
                    entry_price: sel.contract.mid(),
                    engine: EngineVariant::A,
                    setup_type,
                    is_shadow: false,
                    experiment_id: None,
                    rationale,
                }))
            }
            SelectionOutcome::Delayed { reason } => Ok(EngineOutcome::Delayed(reason)),
            SelectionOutcome::Failed { reason, rationale } => Ok(EngineOutcome::Pass(format!(
                "strike selection failed: {reason} ({})",
                rationale.join("; ")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bias::UnifiedBiasState;
    use crate::engines::tests::{swing_call_chain, test_context, test_signal};
    use crate::types::GexState;

    fn engine() -> MomentumEngine {
        MomentumEngine::new(RiskBudget {
            max_premium_loss: 2_000.0,
            max_capital_allocation: 5_000.0,
        })
    }

    #[tokio::test]
    async fn recommends_in_direction_on_liquid_chain() {
        let signal = test_signal("SPY", Direction::Long, "1h");
        let ctx = test_context(swing_call_chain());

        let outcome = engine().evaluate(&signal, &ctx).await.unwrap();
        match outcome {
            EngineOutcome::Recommend(rec) => {
                assert_eq!(rec.engine, EngineVariant::A);
                assert_eq!(rec.option_type, OptionType::Call);
                assert_eq!(rec.setup_type, SetupType::Swing);
                assert!(rec.quantity >= 1);
                assert!(!rec.is_shadow);
            }
            other => panic!("expected recommendation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn passes_when_market_closed() {
        let signal = test_signal("SPY", Direction::Long, "1h");
        let mut ctx = test_context(swing_call_chain());
        ctx.session = "closed".to_string();
        assert!(matches!(
            engine().evaluate(&signal, &ctx).await.unwrap(),
            EngineOutcome::Pass(_)
        ));
    }

    #[tokio::test]
    async fn contra_bias_kills_confidence() {
        let signal = test_signal("SPY", Direction::Long, "1h");
        let mut ctx = test_context(swing_call_chain());
        ctx.bias = Some(UnifiedBiasState {
            symbol: "SPY".to_string(),
            bias: BiasDirection::Bearish,
            confluence_score: 90.0,
            thesis_valid: true,
            htf_invalidation: false,
            as_of_ms: 0,
        });
        match engine().evaluate(&signal, &ctx).await.unwrap() {
            EngineOutcome::Pass(reason) => assert!(reason.contains("confidence")),
            other => panic!("expected pass, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn gamma_delay_propagates() {
        let signal = test_signal("SPY", Direction::Long, "1h");
        let mut ctx = test_context(swing_call_chain());
        ctx.gex.gex_state = GexState::PositiveHigh;
        assert!(engine().evaluate(&signal, &ctx).await.unwrap().is_delayed());
    }

    #[tokio::test]
    async fn empty_chain_passes_with_reason() {
        let signal = test_signal("SPY", Direction::Long, "1h");
        let ctx = test_context(Vec::new());
        match engine().evaluate(&signal, &ctx).await.unwrap() {
            EngineOutcome::Pass(reason) => assert!(reason.contains("NO_VALID_STRIKE")),
            other => panic!("expected pass, got {other:?}"),
        }
    }
}
