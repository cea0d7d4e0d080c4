// =============================================================================
// Policy Engine — decides which engine's recommendation executes
// =============================================================================
//
// Given an experiment and the runtime availability of each engine, the
// policy engine picks an execution mode and persists the decision. Two
// invariants are enforced before anything is written:
//
//   1. SHADOW_ONLY never names an executed engine.
//   2. The executed engine and shadow engine are never the same.
// =============================================================================

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::store::{ExperimentRow, PolicyRow, Store};
use crate::types::{AppMode, EngineVariant, ExecutionMode};

/// Runtime availability of the two engine adapters.
#[derive(Debug, Clone, Copy)]
pub struct EngineAvailability {
    pub engine_a: bool,
    pub engine_b: bool,
}

pub struct PolicyEngine {
    store: Store,
    app_mode: AppMode,
    policy_version: String,
}

impl PolicyEngine {
    pub fn new(store: Store, app_mode: AppMode, policy_version: String) -> Self {
        Self {
            store,
            app_mode,
            policy_version,
        }
    }

    /// Fetch-or-create the execution policy for an experiment.
    ///
    /// Replays return the previously persisted decision so a retried signal
    /// sees the same policy it saw the first time.
    pub async fn get_execution_policy(
        &self,
        experiment: &ExperimentRow,
        availability: EngineAvailability,
    ) -> Result<PolicyRow> {
        if let Some(existing) = self.store.get_policy_by_experiment(&experiment.id).await? {
            return Ok(existing);
        }

        let decision = decide(self.app_mode, availability);
        validate(&decision)?;

        let row = PolicyRow {
            id: Uuid::new_v4().to_string(),
            experiment_id: experiment.id.clone(),
            execution_mode: decision.execution_mode,
            executed_engine: decision.executed_engine,
            shadow_engine: decision.shadow_engine,
            reason: decision.reason,
            policy_version: self.policy_version.clone(),
            created_at_ms: Utc::now().timestamp_millis(),
        };
        self.store.insert_policy(&row).await?;

        debug!(
            experiment_id = %experiment.id,
            mode = %row.execution_mode,
            executed = ?row.executed_engine,
            shadow = ?row.shadow_engine,
            "execution policy persisted"
        );
        Ok(row)
    }
}

/// An undecorated policy decision, before persistence.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub execution_mode: ExecutionMode,
    pub executed_engine: Option<EngineVariant>,
    pub shadow_engine: Option<EngineVariant>,
    pub reason: String,
}

/// Pure decision function.
///
/// Paper mode with engine A available arms A as primary (B shadows when it
/// is up); anything else collapses to shadow-only.
pub fn decide(app_mode: AppMode, availability: EngineAvailability) -> PolicyDecision {
    if app_mode == AppMode::Paper && availability.engine_a {
        let shadow = availability.engine_b.then_some(EngineVariant::B);
        PolicyDecision {
            execution_mode: ExecutionMode::EngineAPrimary,
            executed_engine: Some(EngineVariant::A),
            shadow_engine: shadow,
            reason: if shadow.is_some() {
                "paper mode: engine A primary, engine B shadowing".to_string()
            } else {
                "paper mode: engine A primary, engine B unavailable".to_string()
            },
        }
    } else {
        PolicyDecision {
            execution_mode: ExecutionMode::ShadowOnly,
            executed_engine: None,
            shadow_engine: None,
            reason: "execution disarmed: shadow-only".to_string(),
        }
    }
}

/// Invariant checks; violations are programming errors surfaced loudly.
pub fn validate(decision: &PolicyDecision) -> Result<()> {
    if decision.execution_mode == ExecutionMode::ShadowOnly && decision.executed_engine.is_some() {
        bail!("SHADOW_ONLY policy must not name an executed engine");
    }
    if let (Some(executed), Some(shadow)) = (decision.executed_engine, decision.shadow_engine) {
        if executed == shadow {
            bail!("executed engine and shadow engine must differ");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: EngineAvailability = EngineAvailability {
        engine_a: true,
        engine_b: true,
    };

    #[test]
    fn paper_mode_with_a_available_arms_a_primary() {
        let d = decide(AppMode::Paper, BOTH);
        assert_eq!(d.execution_mode, ExecutionMode::EngineAPrimary);
        assert_eq!(d.executed_engine, Some(EngineVariant::A));
        assert_eq!(d.shadow_engine, Some(EngineVariant::B));
        validate(&d).unwrap();
    }

    #[test]
    fn missing_b_drops_shadow() {
        let d = decide(
            AppMode::Paper,
            EngineAvailability {
                engine_a: true,
                engine_b: false,
            },
        );
        assert_eq!(d.execution_mode, ExecutionMode::EngineAPrimary);
        assert_eq!(d.shadow_engine, None);
        validate(&d).unwrap();
    }

    #[test]
    fn missing_a_collapses_to_shadow_only() {
        let d = decide(
            AppMode::Paper,
            EngineAvailability {
                engine_a: false,
                engine_b: true,
            },
        );
        assert_eq!(d.execution_mode, ExecutionMode::ShadowOnly);
        assert_eq!(d.executed_engine, None);
        assert_eq!(d.shadow_engine, None);
        validate(&d).unwrap();
    }

    #[test]
    fn live_mode_is_shadow_only() {
        let d = decide(AppMode::Live, BOTH);
        assert_eq!(d.execution_mode, ExecutionMode::ShadowOnly);
        validate(&d).unwrap();
    }

    #[test]
    fn validate_rejects_shadow_only_with_executed() {
        let d = PolicyDecision {
            execution_mode: ExecutionMode::ShadowOnly,
            executed_engine: Some(EngineVariant::A),
            shadow_engine: None,
            reason: String::new(),
        };
        assert!(validate(&d).is_err());
    }

    #[test]
    fn validate_rejects_same_executed_and_shadow() {
        let d = PolicyDecision {
            execution_mode: ExecutionMode::EngineAPrimary,
            executed_engine: Some(EngineVariant::A),
            shadow_engine: Some(EngineVariant::A),
            reason: String::new(),
        };
        assert!(validate(&d).is_err());
    }

    #[tokio::test]
    async fn policy_is_persisted_once_per_experiment() {
        let store = Store::open_in_memory().unwrap();
        let experiment = ExperimentRow {
            id: "exp-1".to_string(),
            signal_id: "sig-1".to_string(),
            variant: EngineVariant::A,
            assignment_hash: "abc".to_string(),
            split_percentage: 0.5,
            policy_version: "v1.0".to_string(),
            created_at_ms: 0,
        };

        let engine = PolicyEngine::new(store.clone(), AppMode::Paper, "v1.0".to_string());
        let first = engine.get_execution_policy(&experiment, BOTH).await.unwrap();
        // A later call with different availability replays the stored row.
        let second = engine
            .get_execution_policy(
                &experiment,
                EngineAvailability {
                    engine_a: false,
                    engine_b: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.execution_mode, ExecutionMode::EngineAPrimary);
    }
}
