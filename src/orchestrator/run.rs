// ================================================================================================
// Runs & Run Configs
// ================================================================================================

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    config::SeedStrategy,
    engine::{EngineCounters, SchedulerProfile, SimulationOutcomes, world::ScenarioPatch},
    error::{OrchestratorError, RunError, WorldlineResult},
    evidence::reliability::ReliabilityScore,
    gateway::{LeakageGuardStats, TemporalMode, guard::IsolationLevel},
    telemetry::{StorageRef, TelemetrySummary},
    types::{NodeId, ProjectId, RunConfigId, RunId, Seed, TenantId, VersionSet},
};

/// Seed configuration for a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeedConfig {
    pub strategy: SeedStrategy,
    pub primary_seed: Seed,
    pub count: usize,
}

impl SeedConfig {
    pub fn single(primary_seed: Seed) -> Self {
        Self {
            strategy: SeedStrategy::Single,
            primary_seed,
            count: 1,
        }
    }
}

/// Fully resolved, content-hashable run specification. Immutable once referenced by a
/// Run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub id: RunConfigId,
    pub project_id: ProjectId,
    pub tenant_id: TenantId,
    pub versions: VersionSet,
    pub seed_config: SeedConfig,
    pub horizon: u32,
    pub tick_rate: u32,
    pub keyframe_interval: u32,
    pub scheduler_profile: SchedulerProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_patch: Option<ScenarioPatch>,
    pub max_agents: usize,
    pub max_execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutoff_time: Option<DateTime<Utc>>,
    pub leakage_guard: bool,
    pub isolation_level: IsolationLevel,
    pub temporal_mode: TemporalMode,
    pub temperature: f64,
    pub deterministic_decisions: bool,
    pub created_at: DateTime<Utc>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            id: RunConfigId::new(),
            project_id: ProjectId::new(),
            tenant_id: TenantId::new(),
            versions: VersionSet::default(),
            seed_config: SeedConfig::single(Seed(42)),
            horizon: 100,
            tick_rate: 1,
            keyframe_interval: 10,
            scheduler_profile: SchedulerProfile::default(),
            scenario_patch: None,
            max_agents: 100,
            max_execution_time_ms: 300_000,
            cutoff_time: None,
            leakage_guard: false,
            isolation_level: IsolationLevel::Filter,
            temporal_mode: TemporalMode::Live,
            temperature: 0.7,
            deterministic_decisions: false,
            created_at: Utc::now(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> WorldlineResult<()> {
        if self.horizon == 0 {
            return Err(OrchestratorError::Validation("horizon must be >= 1".into()).into());
        }
        if self.max_agents == 0 {
            return Err(OrchestratorError::Validation("max_agents must be >= 1".into()).into());
        }
        if self.tick_rate == 0 {
            return Err(OrchestratorError::Validation("tick_rate must be >= 1".into()).into());
        }
        if self.keyframe_interval == 0 {
            return Err(
                OrchestratorError::Validation("keyframe_interval must be >= 1".into()).into(),
            );
        }
        if self.temporal_mode == TemporalMode::Backtest && self.cutoff_time.is_none() {
            return Err(OrchestratorError::Validation(
                "backtest mode requires a cutoff_time".into(),
            )
            .into());
        }
        Ok(())
    }

    /// The deterministic subset covered by `run_config_hash`. Volatile fields
    /// (identifiers, timestamps) are excluded.
    pub fn hashable_view(&self) -> serde_json::Value {
        json!({
            "seed_config": self.seed_config,
            "horizon": self.horizon,
            "tick_rate": self.tick_rate,
            "scheduler_profile": self.scheduler_profile,
            "scenario_patch": self.scenario_patch,
            "max_agents": self.max_agents,
            "versions": self.versions,
        })
    }
}

/// Who or what created a run.
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
pub enum TriggeredBy {
    #[default]
    User,
    Batch,
    Refresh,
}

/// Run lifecycle status. Advances monotonically; a run never re-runs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Allowed transitions:
    /// CREATED → QUEUED → RUNNING → (SUCCEEDED | FAILED | CANCELED), with
    /// CANCELED also reachable from QUEUED.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, to),
            (Created, Queued)
                | (Queued, Running)
                | (Queued, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }
}

/// Wall-clock milestones for a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunTiming {
    pub created_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub ticks_executed: Option<u32>,
}

/// Everything a finished run produced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunOutputs {
    pub outcomes: Option<SimulationOutcomes>,
    pub telemetry_ref: Option<StorageRef>,
    pub telemetry_summary: Option<TelemetrySummary>,
    pub reliability: Option<ReliabilityScore>,
    pub execution_counters: Option<EngineCounters>,
    pub leakage_guard_stats: Option<LeakageGuardStats>,
}

/// A single execution attempt. Determinism requires a fresh Run for every execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub project_id: ProjectId,
    pub tenant_id: TenantId,
    pub node_id: NodeId,
    pub run_config_ref: RunConfigId,
    pub status: RunStatus,
    pub actual_seed: Seed,
    pub triggered_by: TriggeredBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub timing: RunTiming,
    pub outputs: RunOutputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl Run {
    pub fn new(
        config: &RunConfig,
        node_id: NodeId,
        seed: Seed,
        triggered_by: TriggeredBy,
        label: Option<String>,
    ) -> Self {
        Self {
            id: RunId::new(),
            project_id: config.project_id,
            tenant_id: config.tenant_id,
            node_id,
            run_config_ref: config.id,
            status: RunStatus::Created,
            actual_seed: seed,
            triggered_by,
            label,
            timing: RunTiming {
                created_at: Some(Utc::now()),
                ..RunTiming::default()
            },
            outputs: RunOutputs::default(),
            error: None,
        }
    }

    /// Enforced status transition.
    pub fn transition(&mut self, to: RunStatus) -> WorldlineResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            }
            .into());
        }
        let now = Utc::now();
        match to {
            RunStatus::Queued => self.timing.queued_at = Some(now),
            RunStatus::Running => self.timing.started_at = Some(now),
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled => {
                self.timing.finished_at = Some(now);
                if let Some(started) = self.timing.started_at {
                    self.timing.duration_ms =
                        Some((now - started).num_milliseconds().max(0) as u64);
                }
            }
            RunStatus::Created => {}
        }
        self.status = to;
        Ok(())
    }
}

/// In-process store for runs and their configs.
#[derive(Default)]
pub struct RunStore {
    runs: DashMap<RunId, Run>,
    configs: DashMap<RunConfigId, RunConfig>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_config(&self, config: RunConfig) {
        self.configs.insert(config.id, config);
    }

    pub fn config(&self, id: RunConfigId) -> Option<RunConfig> {
        self.configs.get(&id).map(|entry| entry.clone())
    }

    pub fn insert_run(&self, run: Run) {
        self.runs.insert(run.id, run);
    }

    pub fn run(&self, id: RunId) -> Option<Run> {
        self.runs.get(&id).map(|entry| entry.clone())
    }

    /// Mutate a run in place under the entry lock.
    pub fn update_run<F, T>(&self, id: RunId, mutate: F) -> WorldlineResult<T>
    where
        F: FnOnce(&mut Run) -> WorldlineResult<T>,
    {
        let mut entry = self
            .runs
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::RunNotFound(id.to_string()))?;
        mutate(&mut entry)
    }

    /// Runs bound to a node, in creation order.
    pub fn runs_for_node(&self, node_id: NodeId) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .iter()
            .filter(|entry| entry.node_id == node_id)
            .map(|entry| entry.clone())
            .collect();
        runs.sort_by_key(|r| (r.timing.created_at, r.id));
        runs
    }

    /// Completed (SUCCEEDED) runs for a node with their outcomes.
    pub fn completed_outcomes(&self, node_id: NodeId) -> Vec<(RunId, SimulationOutcomes)> {
        self.runs_for_node(node_id)
            .into_iter()
            .filter(|r| r.status == RunStatus::Succeeded)
            .filter_map(|r| r.outputs.outcomes.clone().map(|o| (r.id, o)))
            .collect()
    }
}
