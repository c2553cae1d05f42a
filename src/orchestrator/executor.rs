// ================================================================================================
// Run Executor
// ================================================================================================
//
// Drives one run from RUNNING to a terminal state: materializes the world from the
// node's scenario, pulls external data through the gateway, ticks the engine with the
// telemetry writer attached, and finalizes outcomes, aggregates, and the evidence
// pack. Partial telemetry is always retained.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::FeatureFlags,
    engine::{
        EngineConfig, SimulationEngine,
        agent::AgentProfile,
        state::StateManagerConfig,
        world::WorldEvent,
    },
    error::{ErrorKind, OrchestratorError, RunError, WorldlineError, WorldlineResult},
    evidence::{
        EvidencePack, EvidenceService,
        reliability::{self, ReliabilityInputs, ReliabilityWeights},
    },
    gateway::{DataGateway, DataGatewayContext, source::DataFetcher},
    orchestrator::run::{Run, RunStatus, RunStore},
    telemetry::{TelemetryStore, TelemetryWriter},
    types::{RunId, Tick},
    universe::UniverseMap,
};

/// A bound external data feed: fetched through the gateway at run start, converted to
/// world events.
pub struct DataBinding {
    pub source_name: String,
    pub endpoint: String,
    pub params: Value,
    pub timestamp_field: Option<String>,
    pub fetcher: Arc<dyn DataFetcher>,
}

/// Ticks slower than this degrade the run to single-partition mode.
const SOFT_TICK_BUDGET_MS: u128 = 250;

pub struct RunExecutor {
    runs: Arc<RunStore>,
    universe: Arc<UniverseMap>,
    telemetry: Arc<TelemetryStore>,
    gateway: Arc<DataGateway>,
    evidence: EvidenceService,
    packs: DashMap<RunId, EvidencePack>,
    bindings: Vec<DataBinding>,
    flags: FeatureFlags,
}

impl RunExecutor {
    pub fn new(
        runs: Arc<RunStore>,
        universe: Arc<UniverseMap>,
        telemetry: Arc<TelemetryStore>,
        gateway: Arc<DataGateway>,
        flags: FeatureFlags,
    ) -> Self {
        Self {
            runs,
            universe,
            telemetry,
            gateway,
            evidence: EvidenceService,
            packs: DashMap::new(),
            bindings: Vec::new(),
            flags,
        }
    }

    pub fn with_binding(mut self, binding: DataBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn runs(&self) -> &Arc<RunStore> {
        &self.runs
    }

    pub fn universe(&self) -> &Arc<UniverseMap> {
        &self.universe
    }

    pub fn telemetry(&self) -> &Arc<TelemetryStore> {
        &self.telemetry
    }

    pub fn gateway(&self) -> &Arc<DataGateway> {
        &self.gateway
    }

    pub fn evidence_pack(&self, run_id: RunId) -> Option<EvidencePack> {
        self.packs.get(&run_id).map(|entry| entry.clone())
    }

    /// Execute a run to a terminal state. The cancellation token is consulted at
    /// every tick boundary.
    pub async fn execute(&self, run_id: RunId, cancel: CancellationToken) -> WorldlineResult<Run> {
        let run = self
            .runs
            .run(run_id)
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
        let config = self
            .runs
            .config(run.run_config_ref)
            .ok_or_else(|| OrchestratorError::Validation("run config missing".into()))?;

        self.runs
            .update_run(run_id, |run| run.transition(RunStatus::Running))?;
        info!(run_id = %run_id, seed = %run.actual_seed, horizon = config.horizon, "run started");

        match self.drive(run_id, &config, cancel).await {
            Ok(final_status) => {
                let run = self.finalize(run_id, &config, final_status, None).await?;
                Ok(run)
            }
            Err(err) => {
                error!(run_id = %run_id, error = %err, "run failed");
                let run = self
                    .finalize(run_id, &config, RunStatus::Failed, Some(err.to_run_error()))
                    .await?;
                Ok(run)
            }
        }
    }

    /// The tick loop. Returns the terminal status the run should take.
    async fn drive(
        &self,
        run_id: RunId,
        config: &crate::orchestrator::run::RunConfig,
        cancel: CancellationToken,
    ) -> WorldlineResult<RunStatus> {
        let run = self.runs.run(run_id).expect("checked in execute");
        let node = self
            .universe
            .get_node(run.node_id)
            .ok_or_else(|| crate::error::UniverseError::NodeNotFound(run.node_id.to_string()))?;

        let mut scenario = node
            .scenario_patch
            .clone()
            .or_else(|| config.scenario_patch.clone())
            .unwrap_or_default();

        // External reads happen only through the gateway, before the deterministic
        // tick loop begins.
        let external_events = self.fetch_external_events(run_id, config).await?;
        for (tick, events) in &external_events {
            scenario.event_scripts.push(crate::engine::world::EventScript {
                tick: *tick,
                events: events.clone(),
            });
        }

        let profiles = AgentProfile::generate_population(run.actual_seed, config.max_agents);
        let engine_config = EngineConfig {
            seed: run.actual_seed,
            temperature: config.temperature,
            deterministic_decisions: config.deterministic_decisions,
            population_profile: Default::default(),
            agent_fault_tolerance: self.flags.agent_fault_tolerance,
            fault_rate: 0.0,
            scheduler: config.scheduler_profile.clone(),
            state: StateManagerConfig::default(),
        };
        let action_space = crate::engine::action::DiscreteActionSpace::with_choices(3);
        let mut engine =
            SimulationEngine::new(engine_config, action_space, &scenario, profiles)?;

        let mut writer = TelemetryWriter::new(run_id, run.actual_seed, config.keyframe_interval);
        let action_names = engine.action_names().to_vec();
        writer.record(
            Tick(0),
            engine.state().population_snapshot(&action_names),
            engine.state().environment().snapshot(),
            Vec::new(),
            engine.state().metrics(),
        )?;

        let started = Instant::now();
        let mut final_status = RunStatus::Succeeded;
        let mut tick_error: Option<WorldlineError> = None;
        let mut ticks_done: u32 = 0;

        for t in 1..=config.horizon {
            // Suspension point (a): the tick boundary.
            if cancel.is_cancelled() {
                info!(run_id = %run_id, tick = t, "cancellation observed at tick boundary");
                final_status = RunStatus::Canceled;
                break;
            }
            if started.elapsed().as_millis() as u64 > config.max_execution_time_ms {
                tick_error = Some(
                    OrchestratorError::TimeBudgetExceeded {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        budget_ms: config.max_execution_time_ms,
                    }
                    .into(),
                );
                break;
            }

            let tick_started = Instant::now();
            let output = match engine.tick(Tick(t)) {
                Ok(output) => output,
                Err(err) => {
                    tick_error = Some(err);
                    break;
                }
            };
            if tick_started.elapsed().as_millis() > SOFT_TICK_BUDGET_MS {
                warn!(run_id = %run_id, tick = t, "tick exceeded soft budget; degrading");
                engine.degrade_to_single_partition();
            }

            // Suspension point (c): the telemetry flush.
            writer.record(
                Tick(t),
                engine.state().population_snapshot(&action_names),
                engine.state().environment().snapshot(),
                output.events_triggered,
                output.metrics,
            )?;
            ticks_done = t;

            self.runs.update_run(run_id, |run| {
                run.timing.ticks_executed = Some(t);
                Ok(())
            })?;
            tokio::task::yield_now().await;
        }

        // Stash engine products on the run before finalize.
        let outcomes = engine.outcomes();
        let counters = engine.counters();
        let blob = writer.finalize()?;
        let summary = blob.summary();
        let storage_ref = self.telemetry.persist(&blob).await?;
        let stats = self.gateway.guard_stats(run_id);

        self.runs.update_run(run_id, |run| {
            run.timing.ticks_executed = Some(ticks_done);
            run.outputs.outcomes = Some(outcomes.clone());
            run.outputs.execution_counters = Some(counters.clone());
            run.outputs.telemetry_ref = Some(storage_ref.clone());
            run.outputs.telemetry_summary = Some(summary.clone());
            run.outputs.leakage_guard_stats = Some(stats);
            Ok(())
        })?;

        match tick_error {
            Some(err) => Err(err),
            None => Ok(final_status),
        }
    }

    /// Pull every bound source through the gateway. Blocked sources degrade to an
    /// empty payload; strict-level future-data violations fail the run.
    async fn fetch_external_events(
        &self,
        run_id: RunId,
        config: &crate::orchestrator::run::RunConfig,
    ) -> WorldlineResult<Vec<(Tick, Vec<WorldEvent>)>> {
        if self.bindings.is_empty() {
            return Ok(Vec::new());
        }

        let run = self.runs.run(run_id).expect("checked in execute");
        let context = DataGatewayContext {
            tenant_id: run.tenant_id,
            project_id: Some(run.project_id),
            run_id: Some(run_id),
            cutoff_time: config.cutoff_time,
            isolation_level: config.isolation_level,
            temporal_mode: config.temporal_mode,
        };

        let mut scheduled: std::collections::BTreeMap<u32, Vec<WorldEvent>> =
            std::collections::BTreeMap::new();
        for binding in &self.bindings {
            let response = match self
                .gateway
                .request(
                    &binding.source_name,
                    &binding.endpoint,
                    binding.params.clone(),
                    &context,
                    binding.fetcher.as_ref(),
                    binding.timestamp_field.as_deref(),
                )
                .await
            {
                Ok(response) => response,
                Err(err) if err.kind() == ErrorKind::FutureDataAccess => return Err(err),
                Err(err) => {
                    warn!(
                        source = %binding.source_name,
                        error = %err,
                        "source blocked; continuing with empty payload"
                    );
                    continue;
                }
            };

            for record in &response.data {
                let tick = record.get("tick").and_then(Value::as_u64).unwrap_or(1) as u32;
                scheduled
                    .entry(tick)
                    .or_default()
                    .push(record_to_event(&binding.source_name, record));
            }
        }

        Ok(scheduled
            .into_iter()
            .map(|(tick, events)| (Tick(tick), events))
            .collect())
    }

    /// Terminal bookkeeping: status transition, node aggregation, reliability, and
    /// the evidence pack. Partial runs keep their telemetry and get packs marked
    /// partial.
    async fn finalize(
        &self,
        run_id: RunId,
        config: &crate::orchestrator::run::RunConfig,
        status: RunStatus,
        error: Option<RunError>,
    ) -> WorldlineResult<Run> {
        self.runs.update_run(run_id, |run| {
            run.error = error.clone();
            run.transition(status)
        })?;

        let run = self.runs.run(run_id).expect("just updated");
        self.universe.add_run_ref(run.node_id, run_id)?;

        // Fold completed runs into the node aggregate. Failures never invalidate
        // sibling aggregates.
        let completed = self.runs.completed_outcomes(run.node_id);
        if !completed.is_empty() {
            self.universe.aggregate_runs(run.node_id, &completed, None)?;
        }

        // Reliability from the node's completed ensemble.
        let seed_outcomes: Vec<(u64, f64)> = self
            .runs
            .runs_for_node(run.node_id)
            .iter()
            .filter(|r| r.status == RunStatus::Succeeded)
            .filter_map(|r| {
                r.outputs
                    .outcomes
                    .as_ref()
                    .map(|o| (r.actual_seed.0, o.primary_outcome_probability))
            })
            .collect();
        let stats = run.outputs.leakage_guard_stats.unwrap_or_default();
        let data_gap_severity = if self.bindings.is_empty() {
            None
        } else {
            Some(stats.sources_blocked as f64 / self.bindings.len() as f64)
        };
        let reliability = reliability::compute(
            &ReliabilityInputs {
                calibration_ece: None,
                calibration_bounded: false,
                run_ids: completed.iter().map(|(id, _)| *id).collect(),
                seed_outcomes,
                data_gap_severity,
                average_feature_shift: None,
            },
            ReliabilityWeights::default(),
        );
        self.runs.update_run(run_id, |run| {
            run.outputs.reliability = Some(reliability.clone());
            Ok(())
        })?;

        let run = self.runs.run(run_id).expect("just updated");
        let node = self.universe.get_node(run.node_id);
        let manifest_entries = self.gateway.manifest().by_run(run_id);
        let pack = self.evidence.build_for_run(
            &run,
            config,
            node.as_ref(),
            &manifest_entries,
            Some(reliability),
        )?;
        self.packs.insert(run_id, pack);

        info!(run_id = %run_id, status = %run.status, "run finalized");
        Ok(run)
    }
}

/// Convert an external record to a world event. Unnamed records take the source name.
fn record_to_event(source: &str, record: &Value) -> WorldEvent {
    let name = record
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(source)
        .to_string();
    let magnitude = record
        .get("magnitude")
        .and_then(Value::as_f64)
        .unwrap_or(1.0);
    let mut event = WorldEvent::new(name, magnitude);
    if let Some(impact) = record.get("variable_impact").and_then(Value::as_object) {
        for (variable, delta) in impact {
            if let Some(delta) = delta.as_f64() {
                event = event.with_impact(variable.clone(), delta);
            }
        }
    }
    event
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn record_conversion_reads_named_impacts() {
        let record = json!({
            "name": "rate_cut",
            "magnitude": 2.0,
            "variable_impact": {"consumer_confidence": 0.1},
        });
        let event = record_to_event("fed", &record);
        assert_eq!(event.name, "rate_cut");
        assert_eq!(event.magnitude, 2.0);
        assert_eq!(event.variable_impact["consumer_confidence"], 0.1);

        let bare = record_to_event("fed", &json!({"value": 3}));
        assert_eq!(bare.name, "fed");
        assert_eq!(bare.magnitude, 1.0);
    }
}
