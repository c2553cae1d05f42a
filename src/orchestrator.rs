// ================================================================================================
// Simulation Orchestrator
// ================================================================================================
//
// Creates run configs, binds runs to nodes (creating or forking them as needed),
// drives the CREATED → QUEUED → RUNNING lifecycle through the job queue, and exposes
// cancel/progress/result plus the batch operations (multi-seed, ensembles, refresh).

pub mod executor;
pub mod queue;
pub mod run;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    engine::world::round6,
    error::{OrchestratorError, UniverseError, WorldlineResult},
    orchestrator::{
        executor::RunExecutor,
        queue::{CancellationRegistry, JobPriority, JobQueue},
        run::{Run, RunConfig, RunStatus, RunStore, TriggeredBy},
    },
    types::{NodeId, RunId, Seed},
    universe::{Intervention, Node, UniverseMap},
};

/// How a run request binds to the Universe Map.
pub enum NodeBinding {
    /// Run against an existing node.
    Existing(NodeId),
    /// Fork a child from `parent` with the given intervention, then run the child.
    Fork {
        parent: NodeId,
        intervention: Intervention,
        explanation: Option<String>,
    },
    /// Create a fresh baseline node from the config's scenario patch.
    NewRoot,
}

/// Progress snapshot of a running simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: RunId,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ticks_executed: Option<u32>,
}

/// Aggregate over a multi-seed batch: per-key (mean, variance, min, max, samples).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiSeedAggregate {
    pub run_count: usize,
    pub outcome_statistics: BTreeMap<String, crate::universe::OutcomeStat>,
    pub confidence: f64,
}

pub struct Orchestrator {
    runs: Arc<RunStore>,
    universe: Arc<UniverseMap>,
    executor: Arc<RunExecutor>,
    queue: Arc<JobQueue>,
    cancellations: Arc<CancellationRegistry>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(executor: Arc<RunExecutor>) -> Self {
        Self {
            runs: executor.runs().clone(),
            universe: executor.universe().clone(),
            executor,
            queue: Arc::new(JobQueue::new()),
            cancellations: Arc::new(CancellationRegistry::new()),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn runs(&self) -> &Arc<RunStore> {
        &self.runs
    }

    pub fn universe(&self) -> &Arc<UniverseMap> {
        &self.universe
    }

    pub fn executor(&self) -> &Arc<RunExecutor> {
        &self.executor
    }

    // ============================================================================
    // Run Lifecycle
    // ============================================================================

    /// Create a run in CREATED, resolving its node binding first.
    pub fn create_run(
        &self,
        mut config: RunConfig,
        binding: NodeBinding,
        triggered_by: TriggeredBy,
        label: Option<String>,
    ) -> WorldlineResult<(Run, Node)> {
        config.validate()?;

        let node = match binding {
            NodeBinding::Existing(node_id) => self
                .universe
                .get_node(node_id)
                .ok_or_else(|| UniverseError::NodeNotFound(node_id.to_string()))?,
            NodeBinding::Fork {
                parent,
                intervention,
                explanation,
            } => {
                let (child, _edge, _patch) =
                    self.universe.fork_node(parent, intervention, explanation)?;
                child
            }
            NodeBinding::NewRoot => self.universe.create_root_node(
                config.project_id,
                config.tenant_id,
                config.scenario_patch.clone(),
            ),
        };

        // The node's resolved scenario is authoritative for execution.
        config.scenario_patch = node.scenario_patch.clone();

        let seed = config.seed_config.primary_seed;
        let run = Run::new(&config, node.id, seed, triggered_by, label);
        self.runs.insert_config(config);
        self.runs.insert_run(run.clone());
        info!(run_id = %run.id, node_id = %node.id, "run created");
        Ok((run, node))
    }

    /// CREATED → QUEUED and submit to the scheduler.
    pub fn queue_run(&self, run_id: RunId, priority: JobPriority) -> WorldlineResult<()> {
        self.runs
            .update_run(run_id, |run| run.transition(RunStatus::Queued))?;
        self.queue.push(run_id, priority)?;
        Ok(())
    }

    /// Convenience: create, queue, and return the run and its node.
    pub fn create_and_queue(
        &self,
        config: RunConfig,
        binding: NodeBinding,
        triggered_by: TriggeredBy,
        label: Option<String>,
    ) -> WorldlineResult<(Run, Node)> {
        let (run, node) = self.create_run(config, binding, triggered_by, label)?;
        self.queue_run(run.id, JobPriority::Normal)?;
        Ok((run, node))
    }

    /// Start `n` workers consuming the queue. Each run executes on a dedicated
    /// worker; determinism inside the tick loop never depends on worker identity.
    pub fn start_workers(&self, n: usize) {
        let mut workers = self.workers.lock().expect("worker lock poisoned");
        for _ in 0..n.max(1) {
            let queue = self.queue.clone();
            let runs = self.runs.clone();
            let executor = self.executor.clone();
            let cancellations = self.cancellations.clone();
            workers.push(tokio::spawn(async move {
                while let Some(run_id) = queue.pop().await {
                    let Some(run) = runs.run(run_id) else {
                        continue;
                    };
                    if run.status != RunStatus::Queued {
                        // Canceled while queued; nothing to execute.
                        continue;
                    }
                    let token = cancellations.token_for(run_id);
                    if let Err(err) = executor.execute(run_id, token).await {
                        warn!(run_id = %run_id, error = %err, "executor error");
                    }
                    cancellations.remove(run_id);
                }
            }));
        }
    }

    /// Stop accepting work and wait for workers to drain.
    pub async fn shutdown(&self) {
        self.queue.close();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().expect("worker lock poisoned");
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Cancel a run. Queued runs transition immediately; running runs get their flag
    /// set and stop at the next tick boundary.
    pub fn cancel(&self, run_id: RunId) -> WorldlineResult<bool> {
        let run = self
            .runs
            .run(run_id)
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
        match run.status {
            RunStatus::Queued => {
                // A worker may win the QUEUED → RUNNING race; fall back to the flag.
                match self
                    .runs
                    .update_run(run_id, |run| run.transition(RunStatus::Canceled))
                {
                    Ok(()) => Ok(true),
                    Err(_) => Ok(self.cancellations.cancel(run_id)),
                }
            }
            RunStatus::Running => Ok(self.cancellations.cancel(run_id)),
            _ => Ok(false),
        }
    }

    pub fn get_progress(&self, run_id: RunId) -> Option<RunProgress> {
        self.runs.run(run_id).map(|run| RunProgress {
            run_id,
            status: run.status,
            started_at: run.timing.started_at,
            ticks_executed: run.timing.ticks_executed,
        })
    }

    pub fn get_result(&self, run_id: RunId) -> Option<Run> {
        self.runs.run(run_id)
    }

    /// Wait until a run reaches a terminal state and its finalization (aggregation,
    /// reliability, evidence pack) has completed. The evidence pack is written last,
    /// so its presence is the completion signal.
    pub async fn wait_for_terminal(&self, run_id: RunId) -> WorldlineResult<Run> {
        loop {
            let run = self
                .runs
                .run(run_id)
                .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
            let finalized = run.timing.started_at.is_none()
                || self.executor.evidence_pack(run_id).is_some();
            if run.status.is_terminal() && finalized {
                return Ok(run);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    // ============================================================================
    // Batch Operations
    // ============================================================================

    /// Queue `count` runs over consecutive seeds starting at the config's primary.
    pub fn run_multi_seed(
        &self,
        base_config: &RunConfig,
        node_id: NodeId,
        count: usize,
    ) -> WorldlineResult<Vec<RunId>> {
        let base_seed = base_config.seed_config.primary_seed.0;
        let seeds: Vec<Seed> = (0..count as u64).map(|i| Seed(base_seed + i)).collect();
        self.run_node_ensemble(base_config, node_id, &seeds)
    }

    /// Create one run per seed against a node and raise its minimum ensemble size.
    pub fn run_node_ensemble(
        &self,
        base_config: &RunConfig,
        node_id: NodeId,
        seeds: &[Seed],
    ) -> WorldlineResult<Vec<RunId>> {
        self.universe.raise_min_ensemble(node_id, seeds.len())?;

        let mut run_ids = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let config = RunConfig {
                id: crate::types::RunConfigId::new(),
                seed_config: run::SeedConfig::single(*seed),
                ..base_config.clone()
            };
            let (run, _) = self.create_run(
                config,
                NodeBinding::Existing(node_id),
                TriggeredBy::Batch,
                Some(format!("ensemble seed={seed}")),
            )?;
            self.queue_run(run.id, JobPriority::Normal)?;
            run_ids.push(run.id);
        }
        Ok(run_ids)
    }

    /// Queue a refresh run for a stale node, clearing the staleness flag. Non-stale
    /// nodes are skipped.
    pub fn queue_node_refresh(
        &self,
        base_config: &RunConfig,
        node_id: NodeId,
    ) -> WorldlineResult<Option<RunId>> {
        let node = self
            .universe
            .get_node(node_id)
            .ok_or_else(|| UniverseError::NodeNotFound(node_id.to_string()))?;
        if !node.is_stale {
            return Ok(None);
        }

        let config = RunConfig {
            id: crate::types::RunConfigId::new(),
            ..base_config.clone()
        };
        let (run, _) = self.create_run(
            config,
            NodeBinding::Existing(node_id),
            TriggeredBy::Refresh,
            Some("refresh run for stale node".to_string()),
        )?;
        self.queue_run(run.id, JobPriority::Normal)?;
        self.universe.mark_refreshed(node_id)?;
        Ok(Some(run.id))
    }

    /// Aggregate outcome distributions across completed runs of a batch.
    pub fn aggregate_multi_seed_results(&self, run_ids: &[RunId]) -> MultiSeedAggregate {
        let outcomes: Vec<crate::engine::SimulationOutcomes> = run_ids
            .iter()
            .filter_map(|id| self.runs.run(*id))
            .filter(|run| run.status == RunStatus::Succeeded)
            .filter_map(|run| run.outputs.outcomes)
            .collect();

        let mut keys: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for outcome in &outcomes {
            keys.extend(outcome.outcome_distribution.keys().cloned());
        }

        let mut outcome_statistics = BTreeMap::new();
        for key in keys {
            let values: Vec<f64> = outcomes
                .iter()
                .map(|o| o.outcome_distribution.get(&key).copied().unwrap_or(0.0))
                .collect();
            let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                / values.len().max(1) as f64;
            outcome_statistics.insert(
                key,
                crate::universe::OutcomeStat {
                    mean: round6(mean),
                    variance: round6(variance),
                    min: values.iter().copied().fold(f64::INFINITY, f64::min),
                    max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    sample_count: values.len(),
                },
            );
        }

        let confidence = if outcome_statistics.is_empty() {
            0.0
        } else {
            let mean_variance = outcome_statistics
                .values()
                .map(|s| s.variance)
                .sum::<f64>()
                / outcome_statistics.len() as f64;
            round6((1.0 - mean_variance).clamp(0.0, 1.0))
        };

        MultiSeedAggregate {
            run_count: outcomes.len(),
            outcome_statistics,
            confidence,
        }
    }
}
