// ================================================================================================
// Evidence Packs
// ================================================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    engine::StageCounters,
    error::{EvidenceError, WorldlineResult},
    evidence::{determinism::DeterminismSignature, reliability::ReliabilityScore},
    gateway::{LeakageGuardStats, manifest::ManifestEntry},
    orchestrator::run::{Run, RunConfig, RunStatus},
    telemetry::StorageRef,
    types::{NodeId, ProjectId, RunConfigId, RunId, TenantId},
    universe::Node,
};

/// Evidence pack schema version.
///
/// Versioning note: `result_hash` excludes variance metrics. Ensemble refinement must
/// never retroactively change a run-level signature. Revisit alongside any version
/// bump here.
pub const EVIDENCE_PACK_VERSION: &str = "1.0.0";

/// Which engine path served the run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnginePath {
    #[default]
    Society,
    Target,
    Ask,
}

/// Provenance chain from project to artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactLineage {
    pub project_id: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<NodeId>,
    pub node_depth: u32,
    pub run_id: RunId,
    pub run_config_id: RunConfigId,
    pub engine_version: String,
    pub ruleset_version: String,
    pub dataset_version: String,
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_ref: Option<StorageRef>,
    pub created_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Proof that the run executed through the engine with the recorded effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProof {
    pub engine_path: EnginePath,
    pub ticks_executed: u64,
    pub ticks_configured: u32,
    pub agent_count: usize,
    pub agent_steps_executed: u64,
    pub loop_stage_counters: StageCounters,
    pub rule_application_counts: Vec<crate::engine::RuleApplication>,
    pub llm_calls_in_tick_loop: u64,
    pub llm_calls_in_compilation: u64,
    pub scheduler_profile: String,
    pub partitions_count: u64,
    pub batches_count: u64,
    pub backpressure_events: u64,
}

/// Proof over the telemetry structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryProof {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_ref: Option<StorageRef>,
    pub keyframe_count: usize,
    pub delta_count: usize,
    pub total_events: usize,
    pub telemetry_hash: String,
    pub is_complete: bool,
    pub replay_degraded: bool,
}

/// Proof over the result distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsProof {
    pub outcomes_hash: String,
    pub primary_outcome: String,
    pub primary_probability: f64,
    pub outcome_distribution: std::collections::BTreeMap<String, f64>,
    pub key_metrics: Vec<crate::engine::KeyMetric>,
}

/// Audit-trail references: every external read's manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditProof {
    pub manifest_entry_ids: Vec<String>,
    pub actions_recorded: usize,
    pub actor_type: String,
    pub tenant_id: TenantId,
}

/// Temporal-isolation attestation for backtest runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiLeakageProof {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutoff_time: Option<DateTime<Utc>>,
    pub leakage_guard_enabled: bool,
    pub blocked_access_attempts: u64,
    pub dataset_filtered: bool,
    pub leakage_detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leakage_details: Option<String>,
}

/// The canonical proof bundle for a run (or the node hosting it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidencePack {
    pub evidence_pack_id: String,
    pub evidence_pack_version: String,
    pub generated_at: DateTime<Utc>,
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub artifact_lineage: ArtifactLineage,
    pub execution_proof: ExecutionProof,
    pub determinism_signature: DeterminismSignature,
    pub telemetry_proof: TelemetryProof,
    pub results_proof: ResultsProof,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliability_proof: Option<ReliabilityScore>,
    pub audit_proof: AuditProof,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_leakage_proof: Option<AntiLeakageProof>,
    /// Set for runs that did not complete; downstream aggregation excludes them.
    pub partial: bool,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
}

/// Builds evidence packs from finished runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvidenceService;

impl EvidenceService {
    /// Assemble the pack for a run. Requires outcomes unless the run is partial.
    pub fn build_for_run(
        &self,
        run: &Run,
        config: &RunConfig,
        node: Option<&Node>,
        manifest_entries: &[ManifestEntry],
        reliability: Option<ReliabilityScore>,
    ) -> WorldlineResult<EvidencePack> {
        let partial = run.status != RunStatus::Succeeded;
        let outcomes = match (&run.outputs.outcomes, partial) {
            (Some(outcomes), _) => outcomes.clone(),
            (None, true) => crate::engine::SimulationOutcomes {
                primary_outcome: "incomplete".to_string(),
                primary_outcome_probability: 0.0,
                outcome_distribution: Default::default(),
                key_metrics: Vec::new(),
                environment_state: Default::default(),
            },
            (None, false) => {
                return Err(EvidenceError::MissingOutcome(run.id.to_string()).into());
            }
        };
        let summary = run.outputs.telemetry_summary.clone().unwrap_or(
            crate::telemetry::TelemetrySummary {
                keyframe_count: 0,
                delta_count: 0,
                total_events: 0,
                tick_count: 0,
                agent_count: 0,
            },
        );
        let counters = run.outputs.execution_counters.clone().unwrap_or_default();

        let signature =
            DeterminismSignature::build(config, &outcomes, &summary, run.actual_seed);

        let execution_proof = ExecutionProof {
            engine_path: EnginePath::Society,
            ticks_executed: counters.ticks_executed,
            ticks_configured: config.horizon,
            agent_count: summary.agent_count,
            agent_steps_executed: counters.agent_steps_executed,
            loop_stage_counters: counters.loop_stage_counters,
            rule_application_counts: counters.rule_application_counts.clone(),
            llm_calls_in_tick_loop: counters.llm_calls_in_tick_loop,
            llm_calls_in_compilation: counters.llm_calls_in_compilation,
            scheduler_profile: format!(
                "partitions={} batch={}",
                config.scheduler_profile.partitions, config.scheduler_profile.batch_size
            ),
            partitions_count: counters.partitions_count,
            batches_count: counters.batches_count,
            backpressure_events: counters.backpressure_events,
        };

        let telemetry_proof = TelemetryProof {
            telemetry_ref: run.outputs.telemetry_ref.clone(),
            keyframe_count: summary.keyframe_count,
            delta_count: summary.delta_count,
            total_events: summary.total_events,
            telemetry_hash: signature.telemetry_hash.clone(),
            is_complete: !partial,
            replay_degraded: false,
        };

        let results_proof = ResultsProof {
            outcomes_hash: signature.result_hash.clone(),
            primary_outcome: outcomes.primary_outcome.clone(),
            primary_probability: outcomes.primary_outcome_probability,
            outcome_distribution: outcomes.outcome_distribution.clone(),
            key_metrics: outcomes.key_metrics.clone(),
        };

        let audit_proof = AuditProof {
            manifest_entry_ids: manifest_entries
                .iter()
                .map(|entry| entry.id.to_string())
                .collect(),
            actions_recorded: manifest_entries.len(),
            actor_type: run.triggered_by.to_string(),
            tenant_id: run.tenant_id,
        };

        let anti_leakage_proof = self.build_anti_leakage_proof(config, run);

        Ok(EvidencePack {
            evidence_pack_id: format!("ep-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            evidence_pack_version: EVIDENCE_PACK_VERSION.to_string(),
            generated_at: Utc::now(),
            run_id: run.id,
            node_id: Some(run.node_id),
            artifact_lineage: ArtifactLineage {
                project_id: run.project_id,
                node_id: Some(run.node_id),
                parent_node_id: node.and_then(|n| n.parent_id),
                node_depth: node.map(|n| n.depth).unwrap_or(0),
                run_id: run.id,
                run_config_id: run.run_config_ref,
                engine_version: config.versions.engine_version.clone(),
                ruleset_version: config.versions.ruleset_version.clone(),
                dataset_version: config.versions.dataset_version.clone(),
                schema_version: crate::telemetry::blob::SCHEMA_VERSION.to_string(),
                telemetry_ref: run.outputs.telemetry_ref.clone(),
                created_at: run.timing.created_at,
                completed_at: run.timing.finished_at,
            },
            execution_proof,
            determinism_signature: signature,
            telemetry_proof,
            results_proof,
            reliability_proof: reliability.or_else(|| run.outputs.reliability.clone()),
            audit_proof,
            anti_leakage_proof,
            partial,
            tenant_id: run.tenant_id,
            project_id: run.project_id,
        })
    }

    /// Pack for a node: the latest completed run's pack with the node attached.
    pub fn build_for_node(
        &self,
        node: &Node,
        latest_run: &Run,
        config: &RunConfig,
        manifest_entries: &[ManifestEntry],
        reliability: Option<ReliabilityScore>,
    ) -> WorldlineResult<EvidencePack> {
        let mut pack =
            self.build_for_run(latest_run, config, Some(node), manifest_entries, reliability)?;
        pack.node_id = Some(node.id);
        Ok(pack)
    }

    fn build_anti_leakage_proof(
        &self,
        config: &RunConfig,
        run: &Run,
    ) -> Option<AntiLeakageProof> {
        if config.cutoff_time.is_none() && !config.leakage_guard {
            return None;
        }
        let stats = run
            .outputs
            .leakage_guard_stats
            .unwrap_or(LeakageGuardStats::default());
        let leakage_detected = stats.leakage_detected();
        Some(AntiLeakageProof {
            cutoff_time: config.cutoff_time,
            leakage_guard_enabled: config.leakage_guard,
            blocked_access_attempts: stats.blocked_access_attempts,
            dataset_filtered: config.cutoff_time.is_some(),
            leakage_detected,
            leakage_details: leakage_detected.then(|| {
                format!(
                    "blocked {} access attempts ({} records filtered, {} sources blocked)",
                    stats.blocked_access_attempts,
                    stats.records_filtered,
                    stats.sources_blocked
                )
            }),
        })
    }
}
