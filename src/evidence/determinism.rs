// ================================================================================================
// Determinism Signatures
// ================================================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    engine::SimulationOutcomes,
    evidence::canonical,
    orchestrator::run::RunConfig,
    telemetry::TelemetrySummary,
    types::{RunId, Seed},
};

/// Hash of the deterministic subset of a RunConfig.
pub fn compute_run_config_hash(config: &RunConfig) -> String {
    canonical::sha256_hex(&config.hashable_view())
}

/// Hash of aggregated outcomes.
///
/// Variance metrics are deliberately excluded: ensemble refinement must not
/// retroactively change a run-level signature.
pub fn compute_result_hash(outcomes: &SimulationOutcomes) -> String {
    canonical::sha256_hex(&json!({
        "primary_outcome": outcomes.primary_outcome,
        "primary_outcome_probability": outcomes.primary_outcome_probability,
        "outcome_distribution": outcomes.outcome_distribution,
        "key_metrics": outcomes.key_metrics,
    }))
}

/// Hash of the telemetry structural summary. The full blob is content-addressed
/// separately; the summary hash is what determinism comparisons use.
pub fn compute_telemetry_hash(summary: &TelemetrySummary) -> String {
    canonical::hash_canonical(summary)
}

/// The signature triple a run is verified against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeterminismSignature {
    pub run_config_hash: String,
    pub result_hash: String,
    pub telemetry_hash: String,
    pub seed_used: u64,
    pub algorithm: String,
    pub computed_at: DateTime<Utc>,
}

impl DeterminismSignature {
    pub fn build(
        config: &RunConfig,
        outcomes: &SimulationOutcomes,
        summary: &TelemetrySummary,
        seed: Seed,
    ) -> Self {
        Self {
            run_config_hash: compute_run_config_hash(config),
            result_hash: compute_result_hash(outcomes),
            telemetry_hash: compute_telemetry_hash(summary),
            seed_used: seed.0,
            algorithm: "sha256".to_string(),
            computed_at: Utc::now(),
        }
    }
}

/// Outcome of comparing two runs for deterministic reproducibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeterminismComparisonResult {
    pub run_id_a: RunId,
    pub run_id_b: RunId,
    pub config_hash_match: bool,
    pub result_hash_match: bool,
    pub telemetry_hash_match: bool,
    pub is_deterministic: bool,
    pub differences: Vec<String>,
}

/// Two runs are deterministic iff they share `run_config_hash`, `seed_used`, and
/// `result_hash`. A telemetry-hash mismatch is reported but does not by itself break
/// determinism when the summary is intentionally coarse.
pub fn compare(
    run_id_a: RunId,
    sig_a: &DeterminismSignature,
    run_id_b: RunId,
    sig_b: &DeterminismSignature,
) -> DeterminismComparisonResult {
    let config_hash_match = sig_a.run_config_hash == sig_b.run_config_hash;
    let result_hash_match = sig_a.result_hash == sig_b.result_hash;
    let telemetry_hash_match = sig_a.telemetry_hash == sig_b.telemetry_hash;
    let seeds_match = sig_a.seed_used == sig_b.seed_used;

    let mut differences = Vec::new();
    if !config_hash_match {
        differences.push("run_config_hash mismatch".to_string());
    }
    if !result_hash_match {
        differences.push("result_hash mismatch".to_string());
    }
    if !telemetry_hash_match {
        differences.push("telemetry_hash mismatch".to_string());
    }
    if !seeds_match {
        differences.push(format!(
            "seeds differ: {} vs {}",
            sig_a.seed_used, sig_b.seed_used
        ));
    }

    DeterminismComparisonResult {
        run_id_a,
        run_id_b,
        config_hash_match,
        result_hash_match,
        telemetry_hash_match,
        is_deterministic: config_hash_match && result_hash_match && seeds_match,
        differences,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn outcomes(p: f64) -> SimulationOutcomes {
        SimulationOutcomes {
            primary_outcome: "choice_0".to_string(),
            primary_outcome_probability: p,
            outcome_distribution: [("choice_0".to_string(), p)].into_iter().collect(),
            key_metrics: Vec::new(),
            environment_state: BTreeMap::new(),
        }
    }

    fn summary() -> TelemetrySummary {
        TelemetrySummary {
            keyframe_count: 6,
            delta_count: 45,
            total_events: 0,
            tick_count: 50,
            agent_count: 100,
        }
    }

    #[test]
    fn identical_inputs_yield_identical_signatures() {
        let config = RunConfig::default();
        let a = DeterminismSignature::build(&config, &outcomes(0.8), &summary(), Seed(7));
        let b = DeterminismSignature::build(&config, &outcomes(0.8), &summary(), Seed(7));
        let result = compare(RunId::new(), &a, RunId::new(), &b);
        assert!(result.is_deterministic);
        assert!(result.differences.is_empty());
    }

    #[test]
    fn changing_any_config_field_changes_the_config_hash() {
        let base = RunConfig::default();
        let variants = [
            RunConfig {
                horizon: base.horizon + 1,
                ..base.clone()
            },
            RunConfig {
                max_agents: base.max_agents + 1,
                ..base.clone()
            },
            RunConfig {
                keyframe_interval: base.keyframe_interval,
                tick_rate: base.tick_rate + 1,
                ..base.clone()
            },
        ];
        let base_hash = compute_run_config_hash(&base);
        for variant in &variants {
            assert_ne!(base_hash, compute_run_config_hash(variant));
        }
    }

    #[test]
    fn seed_mismatch_breaks_determinism() {
        let config = RunConfig::default();
        let a = DeterminismSignature::build(&config, &outcomes(0.8), &summary(), Seed(7));
        let b = DeterminismSignature::build(&config, &outcomes(0.8), &summary(), Seed(8));
        let result = compare(RunId::new(), &a, RunId::new(), &b);
        assert!(!result.is_deterministic);
        assert!(result.differences.iter().any(|d| d.contains("seeds differ")));
    }

    #[test]
    fn result_divergence_is_enumerated() {
        let config = RunConfig::default();
        let a = DeterminismSignature::build(&config, &outcomes(0.8), &summary(), Seed(7));
        let b = DeterminismSignature::build(&config, &outcomes(0.6), &summary(), Seed(7));
        let result = compare(RunId::new(), &a, RunId::new(), &b);
        assert!(!result.is_deterministic);
        assert_eq!(result.differences, vec!["result_hash mismatch".to_string()]);
    }
}
