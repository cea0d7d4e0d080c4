// =============================================================================
// Experiment Manager — deterministic, replayable A/B assignment
// =============================================================================
//
// Every signal gets exactly one experiment row. The variant is a pure
// function of (signal_id, fingerprint, split): the SHA-256 assignment hash
// is bucketed into 10 000 slots and compared against the split threshold,
// so re-running assignment for the same signal always lands on the same
// engine. Persistence is an upsert keyed on signal_id — a lost uniqueness
// race re-reads and returns the existing row.
// =============================================================================

use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::store::{ExperimentRow, SignalRow, Store};
use crate::types::EngineVariant;

/// Number of assignment buckets; the split threshold is expressed in these.
const BUCKETS: u64 = 10_000;

/// SHA-256 hex over `signal_id:fingerprint`.
pub fn assignment_hash(signal_id: &str, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{signal_id}:{fingerprint}").as_bytes());
    hex::encode(hasher.finalize())
}

/// Pure bucketing: variant A iff the hash's leading 64 bits, mod 10 000,
/// fall below the split threshold.
pub fn variant_assignment(hash_hex: &str, split: f64) -> EngineVariant {
    let prefix = hash_hex.get(0..16).unwrap_or("0");
    let bucket = u64::from_str_radix(prefix, 16).unwrap_or(0) % BUCKETS;
    let threshold = (split.clamp(0.0, 1.0) * BUCKETS as f64).round() as u64;
    if bucket < threshold {
        EngineVariant::A
    } else {
        EngineVariant::B
    }
}

/// Creates and replays experiment assignments against the store.
pub struct ExperimentManager {
    store: Store,
}

impl ExperimentManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Idempotent on `signal_id`: repeated calls with any arguments return
    /// the originally persisted row.
    pub async fn create_experiment(
        &self,
        signal: &SignalRow,
        split: f64,
        policy_version: &str,
    ) -> Result<ExperimentRow> {
        let hash = assignment_hash(&signal.id, &signal.fingerprint);
        let variant = variant_assignment(&hash, split);

        let row = self
            .store
            .insert_experiment_if_absent(
                &signal.id,
                variant,
                &hash,
                split.clamp(0.0, 1.0),
                policy_version,
                Utc::now().timestamp_millis(),
            )
            .await?;

        debug!(
            signal_id = %signal.id,
            variant = %row.variant,
            hash = %&hash[..12],
            split,
            "experiment assignment"
        );
        Ok(row)
    }
}
