// =============================================================================
// Bias Aggregator — read contract + exit adjustment layer
// =============================================================================
//
// The bias aggregator itself is an external collaborator; the engine only
// reads its published state. Snapshots are attached best-effort to market
// context at entry time and consulted by the exit monitor, where a hard
// flip against an open position can force an exit ahead of the tier
// evaluator.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broker::Broker;
use crate::store::PositionRow;
use crate::types::{ExitAction, OptionType, Urgency};

/// Direction of the aggregated bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiasDirection {
    Bullish,
    Bearish,
    Neutral,
}

/// Published state of the bias aggregator for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedBiasState {
    pub symbol: String,
    pub bias: BiasDirection,
    /// Confluence score in [0, 100].
    pub confluence_score: f64,
    /// Whether the aggregator still considers the original thesis valid.
    #[serde(default = "default_true")]
    pub thesis_valid: bool,
    /// Higher-timeframe invalidation flag.
    #[serde(default)]
    pub htf_invalidation: bool,
    pub as_of_ms: i64,
}

fn default_true() -> bool {
    true
}

#[async_trait]
pub trait BiasReader: Send + Sync {
    /// Current aggregated state for a symbol, if the aggregator has one.
    async fn current_state(&self, symbol: &str) -> Result<Option<UnifiedBiasState>>;
}

/// Reads bias snapshots that the aggregator publishes into the broker.
pub struct BrokerBiasReader {
    broker: Arc<dyn Broker>,
}

impl BrokerBiasReader {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl BiasReader for BrokerBiasReader {
    async fn current_state(&self, symbol: &str) -> Result<Option<UnifiedBiasState>> {
        let raw = self.broker.get(&format!("bias:{symbol}")).await?;
        let Some(raw) = raw else { return Ok(None) };
        match serde_json::from_str::<UnifiedBiasState>(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                debug!(symbol, error = %e, "unparseable bias snapshot — ignoring");
                Ok(None)
            }
        }
    }
}

/// Reader that always reports no bias; used when no broker is wired.
pub struct NullBiasReader;

#[async_trait]
impl BiasReader for NullBiasReader {
    async fn current_state(&self, _symbol: &str) -> Result<Option<UnifiedBiasState>> {
        Ok(None)
    }
}

/// Map the aggregated bias onto a coarse regime hint for strike selection
/// and exit evaluation.
pub fn regime_hint(bias: Option<&UnifiedBiasState>) -> crate::types::Regime {
    use crate::types::Regime;
    match bias {
        Some(b) if b.bias == BiasDirection::Bullish && b.confluence_score >= 75.0 => {
            Regime::StrongBull
        }
        Some(b) if b.bias == BiasDirection::Bullish => Regime::Bull,
        Some(b) if b.bias == BiasDirection::Bearish && b.confluence_score >= 75.0 => {
            Regime::StrongBear
        }
        Some(b) if b.bias == BiasDirection::Bearish => Regime::Bear,
        _ => Regime::Choppy,
    }
}

// =============================================================================
// Exit adjustment
// =============================================================================

/// Confluence score above which a contra bias forces a full exit.
const FORCE_EXIT_CONFLUENCE: f64 = 75.0;
/// Confluence score above which a contra bias trims half the position.
const TRIM_CONFLUENCE: f64 = 55.0;

/// A forced adjustment from the bias layer, applied before tier evaluation.
#[derive(Debug, Clone)]
pub struct BiasAdjustment {
    pub action: ExitAction,
    pub urgency: Urgency,
    pub size_percent: Option<f64>,
    pub reason_code: String,
}

/// Bias-aware exit override: a strong aggregated bias against the position's
/// direction forces a full or partial exit with a reason code.
pub fn exit_adjustment(
    position: &PositionRow,
    bias: &UnifiedBiasState,
) -> Option<BiasAdjustment> {
    let contra = match (position.option_type, bias.bias) {
        (OptionType::Call, BiasDirection::Bearish) => true,
        (OptionType::Put, BiasDirection::Bullish) => true,
        _ => false,
    };
    if !contra {
        return None;
    }

    if bias.confluence_score >= FORCE_EXIT_CONFLUENCE {
        return Some(BiasAdjustment {
            action: ExitAction::FullExit,
            urgency: Urgency::High,
            size_percent: None,
            reason_code: "BIAS_FLIP_FULL".to_string(),
        });
    }
    if bias.confluence_score >= TRIM_CONFLUENCE {
        return Some(BiasAdjustment {
            action: ExitAction::PartialExit,
            urgency: Urgency::Medium,
            size_percent: Some(50.0),
            reason_code: "BIAS_FLIP_TRIM".to_string(),
        });
    }
    None
}
