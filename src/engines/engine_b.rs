// =============================================================================
// Engine B — confluence engine
// =============================================================================
//
// The contrast experiment to momentum: only trades when the bias
// aggregator's confluence is strong and aligned, trades one horizon longer
// than the signal's own, and sizes at half the momentum budget. The A/B
// comparison is precisely about whether that selectivity earns its keep.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::bias::BiasDirection;
use crate::store::SignalRow;
use crate::strike::{select_strike, RiskBudget, SelectionOutcome, StrikeRequest};
use crate::types::{Direction, EngineVariant, OptionType, SetupType};

use super::{expected_hold_min, expected_move_pct, EngineAdapter, EngineOutcome, MarketContext, TradeRecommendation};

/// Fraction of the configured budget this engine deploys.
const BUDGET_FRACTION: f64 = 0.5;

/// Confluence behavior knobs, taken from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ConfluenceSettings {
    /// Minimum aligned confluence score to trade.
    pub min_threshold: f64,
    /// When off, alignment is still required but the threshold is not.
    pub gate_enabled: bool,
    /// When on, position size scales with the confluence score.
    pub sizing_enabled: bool,
}

impl Default for ConfluenceSettings {
    fn default() -> Self {
        Self {
            min_threshold: 50.0,
            gate_enabled: true,
            sizing_enabled: false,
        }
    }
}

pub struct ConfluenceEngine {
    budget: RiskBudget,
    settings: ConfluenceSettings,
}

impl ConfluenceEngine {
    pub fn new(budget: RiskBudget, settings: ConfluenceSettings) -> Self {
        Self {
            budget: RiskBudget {
                max_premium_loss: budget.max_premium_loss * BUDGET_FRACTION,
                max_capital_allocation: budget.max_capital_allocation * BUDGET_FRACTION,
            },
            settings,
        }
    }

    /// One horizon longer than the signal's own frame.
    fn extend_horizon(setup: SetupType) -> SetupType {
        match setup {
            SetupType::ScalpGuarded => SetupType::Swing,
            SetupType::Swing => SetupType::Position,
            SetupType::Position | SetupType::Leaps => SetupType::Leaps,
        }
    }
}

#[async_trait]
impl EngineAdapter for ConfluenceEngine {
    fn variant(&self) -> EngineVariant {
        EngineVariant::B
    }

    fn name(&self) -> &'static str {
        "confluence"
    }

    async fn evaluate(&self, signal: &SignalRow, ctx: &MarketContext) -> Result<EngineOutcome> {
        if ctx.session == "closed" {
            return Ok(EngineOutcome::Pass("market closed".to_string()));
        }

        let Some(bias) = &ctx.bias else {
            return Ok(EngineOutcome::Pass("no bias state available".to_string()));
        };

        let aligned = matches!(
            (signal.direction, bias.bias),
            (Direction::Long, BiasDirection::Bullish) | (Direction::Short, BiasDirection::Bearish)
        );
        if !aligned {
            return Ok(EngineOutcome::Pass(format!(
                "bias {:?} not aligned with {} signal",
                bias.bias, signal.direction
            )));
        }
        if self.settings.gate_enabled && bias.confluence_score < self.settings.min_threshold {
            return Ok(EngineOutcome::Pass(format!(
                "confluence {:.0} below floor {:.0}",
                bias.confluence_score, self.settings.min_threshold
            )));
        }

        let setup_type = Self::extend_horizon(SetupType::from_timeframe(&signal.timeframe));
        let direction = OptionType::from_direction(signal.direction);

        let request = StrikeRequest {
            symbol: signal.symbol.clone(),
            spot_price: ctx.spot_price,
            direction,
            setup_type,
            signal_confidence: bias.confluence_score,
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
                // Optional confluence-proportional sizing, floored at one.
                let quantity = if self.settings.sizing_enabled {
                    (((sel.contracts as f64) * bias.confluence_score / 100.0).floor() as i64)
                        .max(1)
                } else {
                    sel.contracts
                };

                let mut rationale = vec![format!(
                    "confluence {} {} setup={} confluence={:.0}",
                    signal.symbol, signal.direction, setup_type, bias.confluence_score
                )];
                rationale.extend(sel.rationale.clone());

                debug!(
                    signal_id = %signal.id,
                    contract = %sel.contract.option_symbol,
                    contracts = quantity,
                    "confluence engine recommends"
                );

                Ok(EngineOutcome::Recommend(TradeRecommendation {
                    symbol: signal.symbol.clone(),
                    direction: signal.direction,
                    option_type: direction,
                    option_symbol: sel.contract.option_symbol.clone(),
                    strike: sel.contract.strike,
                    expiration: sel.contract.expiration.format("%Y-%m-%d").to_string(),
                    quantity,
                    entry_price: sel.contract.mid(),
                    engine: EngineVariant::B,
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
    use crate::engines::tests::{test_context, test_signal};
    use crate::market::OptionRow;
    use chrono::NaiveDate;

    fn bias(direction: BiasDirection, confluence: f64) -> UnifiedBiasState {
        UnifiedBiasState {
            symbol: "SPY".to_string(),
            bias: direction,
            confluence_score: confluence,
            thesis_valid: true,
            htf_invalidation: false,
            as_of_ms: 0,
        }
    }

    /// Chain with a POSITION-grade contract (90 dte, mid-delta).
    fn position_call_chain() -> Vec<OptionRow> {
        let expiration =
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap() + chrono::Duration::days(95);
        vec![OptionRow {
            option_symbol: "SPY240618C00510000".to_string(),
            underlying: "SPY".to_string(),
            strike: 510.0,
            expiration,
            option_type: OptionType::Call,
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
        }]
    }

    fn engine() -> ConfluenceEngine {
        ConfluenceEngine::new(
            RiskBudget {
                max_premium_loss: 4_000.0,
                max_capital_allocation: 8_000.0,
            },
            ConfluenceSettings::default(),
        )
    }

    #[tokio::test]
    async fn requires_bias_state() {
        let signal = test_signal("SPY", Direction::Long, "1h");
        let ctx = test_context(position_call_chain());
        match engine().evaluate(&signal, &ctx).await.unwrap() {
            EngineOutcome::Pass(reason) => assert!(reason.contains("no bias")),
            other => panic!("expected pass, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn misaligned_bias_passes() {
        let signal = test_signal("SPY", Direction::Long, "1h");
        let mut ctx = test_context(position_call_chain());
        ctx.bias = Some(bias(BiasDirection::Bearish, 90.0));
        match engine().evaluate(&signal, &ctx).await.unwrap() {
            EngineOutcome::Pass(reason) => assert!(reason.contains("not aligned")),
            other => panic!("expected pass, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn weak_confluence_passes() {
        let signal = test_signal("SPY", Direction::Long, "1h");
        let mut ctx = test_context(position_call_chain());
        ctx.bias = Some(bias(BiasDirection::Bullish, 30.0));
        match engine().evaluate(&signal, &ctx).await.unwrap() {
            EngineOutcome::Pass(reason) => assert!(reason.contains("confluence")),
            other => panic!("expected pass, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn aligned_confluence_trades_extended_horizon() {
        // A 1h (swing) signal trades the POSITION horizon under engine B.
        let signal = test_signal("SPY", Direction::Long, "1h");
        let mut ctx = test_context(position_call_chain());
        ctx.bias = Some(bias(BiasDirection::Bullish, 80.0));
        match engine().evaluate(&signal, &ctx).await.unwrap() {
            EngineOutcome::Recommend(rec) => {
                assert_eq!(rec.engine, EngineVariant::B);
                assert_eq!(rec.setup_type, SetupType::Position);
                assert!(rec.quantity >= 1);
            }
            other => panic!("expected recommendation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabled_gate_waives_threshold_but_not_alignment() {
        let signal = test_signal("SPY", Direction::Long, "1h");
        let mut ctx = test_context(position_call_chain());
        ctx.bias = Some(bias(BiasDirection::Bullish, 30.0));

        let engine = ConfluenceEngine::new(
            RiskBudget {
                max_premium_loss: 4_000.0,
                max_capital_allocation: 8_000.0,
            },
            ConfluenceSettings {
                min_threshold: 50.0,
                gate_enabled: false,
                sizing_enabled: false,
            },
        );
        assert!(matches!(
            engine.evaluate(&signal, &ctx).await.unwrap(),
            EngineOutcome::Recommend(_)
        ));

        // Misaligned bias still passes even with the gate off.
        ctx.bias = Some(bias(BiasDirection::Bearish, 90.0));
        assert!(matches!(
            engine.evaluate(&signal, &ctx).await.unwrap(),
            EngineOutcome::Pass(_)
        ));
    }

    #[tokio::test]
    async fn sizing_scales_quantity_with_confluence() {
        let signal = test_signal("SPY", Direction::Long, "1h");
        let mut ctx = test_context(position_call_chain());
        ctx.bias = Some(bias(BiasDirection::Bullish, 60.0));

        let sized = ConfluenceEngine::new(
            RiskBudget {
                max_premium_loss: 10_000.0,
                max_capital_allocation: 10_000.0,
            },
            ConfluenceSettings {
                min_threshold: 50.0,
                gate_enabled: true,
                sizing_enabled: true,
            },
        );
        // Budget halves to 5 000; premium ~805 -> 6 contracts; 60% -> 3.
        match sized.evaluate(&signal, &ctx).await.unwrap() {
            EngineOutcome::Recommend(rec) => assert_eq!(rec.quantity, 3),
            other => panic!("expected recommendation, got {other:?}"),
        }
    }

    #[test]
    fn horizon_extension_is_monotone() {
        assert_eq!(
            ConfluenceEngine::extend_horizon(SetupType::ScalpGuarded),
            SetupType::Swing
        );
        assert_eq!(
            ConfluenceEngine::extend_horizon(SetupType::Swing),
            SetupType::Position
        );
        assert_eq!(
            ConfluenceEngine::extend_horizon(SetupType::Leaps),
            SetupType::Leaps
        );
    }
}
