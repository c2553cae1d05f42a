// ================================================================================================
// Simulation Engine
// ================================================================================================
//
// Tick-driven observe/evaluate/decide/act/update loop over a vectorized population.
// Given identical `(config, initial world, seed)` the engine produces bit-identical
// tick outputs, telemetry snapshots, and outcomes.

pub mod action;
pub mod agent;
pub mod behavior;
pub mod policy;
pub mod reward;
pub mod rng;
pub mod state;
pub mod world;

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, s};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    engine::{
        action::{ActionRecord, ActionType, DiscreteActionSpace},
        agent::{AgentPhase, AgentProfile, MemoryEvent},
        behavior::{
            BehavioralParams, DecisionContext, PopulationProfile, choice_distribution,
            compute_social_influence, detect_information_cascade, peer_support_matrix,
            recency_adjustment,
        },
        policy::{BehavioralPolicy, DecisionPolicy, Decisions, PolicyContext},
        reward::{RewardComponent, RewardModel},
        rng::StageTag,
        state::{ScalarKey, StateManager, StateManagerConfig},
        world::{EnvironmentState, ScenarioPatch, WorldEvent, round6},
    },
    error::{EngineError, WorldlineResult},
    types::{AgentId, Seed, Tick},
};

/// Batched execution shape for a run. Changing any field is a RunConfig change: results
/// reproduce only under the same profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchedulerProfile {
    pub partitions: usize,
    pub batch_size: usize,
    pub max_concurrent_partitions: usize,
}

impl Default for SchedulerProfile {
    fn default() -> Self {
        Self {
            partitions: 1,
            batch_size: 256,
            max_concurrent_partitions: 4,
        }
    }
}

/// Per-stage loop counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageCounters {
    pub observe: u64,
    pub evaluate: u64,
    pub decide: u64,
    pub act: u64,
    pub update: u64,
}

/// Application counts for one rule (action effect set) at one insertion point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleApplication {
    pub rule_name: String,
    pub insertion_point: String,
    pub application_count: u64,
    pub agents_affected: u64,
}

/// Execution counters required in run outputs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineCounters {
    pub ticks_executed: u64,
    pub agent_steps_executed: u64,
    pub loop_stage_counters: StageCounters,
    pub rule_application_counts: Vec<RuleApplication>,
    /// Must stay 0 for serving simulations.
    pub llm_calls_in_tick_loop: u64,
    pub llm_calls_in_compilation: u64,
    pub partitions_count: u64,
    pub batches_count: u64,
    pub backpressure_events: u64,
}

/// Engine construction parameters (the deterministic subset of a RunConfig).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub seed: Seed,
    pub temperature: f64,
    /// Argmax decisions with one-hot probabilities when set.
    pub deterministic_decisions: bool,
    pub population_profile: PopulationProfile,
    /// Fraction of terminated agents above which the run aborts.
    pub agent_fault_tolerance: f64,
    /// Per-agent per-tick spontaneous fault probability. Zero outside fault tests.
    pub fault_rate: f64,
    pub scheduler: SchedulerProfile,
    pub state: StateManagerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: Seed(42),
            temperature: 0.7,
            deterministic_decisions: false,
            population_profile: PopulationProfile::Average,
            agent_fault_tolerance: 0.05,
            fault_rate: 0.0,
            scheduler: SchedulerProfile::default(),
            state: StateManagerConfig::default(),
        }
    }
}

/// One tick's externally visible output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickOutput {
    pub tick: Tick,
    pub actions: Vec<ActionRecord>,
    pub events_triggered: Vec<String>,
    pub metrics: BTreeMap<String, f64>,
}

/// A named outcome metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMetric {
    pub name: String,
    pub value: f64,
}

/// Final outcomes of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutcomes {
    pub primary_outcome: String,
    pub primary_outcome_probability: f64,
    pub outcome_distribution: BTreeMap<String, f64>,
    pub key_metrics: Vec<KeyMetric>,
    pub environment_state: BTreeMap<String, f64>,
}

pub struct SimulationEngine {
    config: EngineConfig,
    action_space: DiscreteActionSpace,
    action_names: Vec<String>,
    params: BehavioralParams,
    policy: Box<dyn DecisionPolicy>,
    reward_model: RewardModel,
    state: StateManager,
    counters: EngineCounters,
    rule_counts: BTreeMap<(String, String), (u64, u64)>,
    event_schedule: BTreeMap<u32, Vec<WorldEvent>>,
    terminated: usize,
    /// Partition count in effect; drops to 1 after backpressure degradation.
    active_partitions: usize,
}

impl SimulationEngine {
    pub fn new(
        config: EngineConfig,
        action_space: DiscreteActionSpace,
        scenario: &ScenarioPatch,
        profiles: Vec<AgentProfile>,
    ) -> WorldlineResult<Self> {
        let environment = EnvironmentState::materialize(scenario);
        let seed = config.seed;
        let n = profiles.len();
        let state = StateManager::initialize(profiles, environment, seed, config.state.clone())?;
        let params = BehavioralParams::generate(seed, n, config.population_profile);

        let mut event_schedule: BTreeMap<u32, Vec<WorldEvent>> = BTreeMap::new();
        for script in &scenario.event_scripts {
            event_schedule
                .entry(script.tick.0)
                .or_default()
                .extend(script.events.iter().cloned());
        }

        let action_names = action_space
            .actions()
            .iter()
            .map(|a| a.name.clone())
            .collect();
        let active_partitions = config.scheduler.partitions.clamp(1, n.max(1));

        Ok(Self {
            config,
            action_names,
            action_space,
            params,
            policy: Box::new(BehavioralPolicy::default()),
            reward_model: RewardModel::default(),
            state,
            counters: EngineCounters::default(),
            rule_counts: BTreeMap::new(),
            event_schedule,
            terminated: 0,
            active_partitions,
        })
    }

    /// Swap in a non-default decision policy (e.g. the neural actor-critic).
    pub fn with_policy(mut self, policy: Box<dyn DecisionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn action_names(&self) -> &[String] {
        &self.action_names
    }

    pub fn counters(&self) -> EngineCounters {
        let mut counters = self.counters.clone();
        counters.rule_application_counts = self
            .rule_counts
            .iter()
            .map(|((rule, point), (count, affected))| RuleApplication {
                rule_name: rule.clone(),
                insertion_point: point.clone(),
                application_count: *count,
                agents_affected: *affected,
            })
            .collect();
        counters
    }

    pub fn terminated_count(&self) -> usize {
        self.terminated
    }

    /// Schedule additional events (external data feeds, late interventions).
    pub fn schedule_events(&mut self, tick: Tick, events: Vec<WorldEvent>) {
        self.event_schedule.entry(tick.0).or_default().extend(events);
    }

    /// Degrade to single-partition mode; called by the executor when a tick exceeds
    /// its soft budget. Counted in `backpressure_events`.
    pub fn degrade_to_single_partition(&mut self) {
        if self.active_partitions != 1 {
            self.active_partitions = 1;
            self.counters.backpressure_events += 1;
        }
    }

    // ============================================================================
    // The Tick Loop
    // ============================================================================

    /// Run one tick: inject scheduled events, then observe → evaluate → decide →
    /// act → update across the population, partition by partition.
    pub fn tick(&mut self, tick: Tick) -> WorldlineResult<TickOutput> {
        let n = self.state.agent_count();
        let a = self.action_space.n();
        let seed = self.config.seed;

        // Scheduled world events fire at the tick boundary, before any agent observes.
        let mut events_triggered = Vec::new();
        if let Some(events) = self.event_schedule.remove(&tick.0) {
            for event in &events {
                self.state.environment_mut().apply_event(event);
                events_triggered.push(event.name.clone());
            }
        }

        let active: Vec<bool> = self.state.phases().iter().map(|p| p.is_active()).collect();
        let active_count = active.iter().filter(|&&ok| ok).count() as u64;

        // --- OBSERVE: start-of-tick snapshots of peers and environment.
        // Committed choice slots coincide with the leading commit-action columns
        // (the action space lists commit actions first), so slot-indexed support
        // lands on the right utility columns.
        let committed: Vec<i32> = self.state.committed_choices().to_vec();
        let peer_support = peer_support_matrix(&committed, self.state.neighbors(), a);
        let social_influence =
            compute_social_influence(self.state.preferences(), self.state.neighbors());
        let population = choice_distribution(&committed, a);
        self.counters.loop_stage_counters.observe += active_count;

        // --- EVALUATE: compose observation, traits, and beliefs into base utilities.
        let base_utilities = self.base_utilities();
        let views: Vec<_> = (0..n)
            .map(|i| action::AgentConditionView {
                is_committed: committed[i] >= 0,
                has_information: self.state.scalar(i, ScalarKey::InformationExposure) > 0.3,
                certainty: self.state.scalar(i, ScalarKey::Certainty),
            })
            .collect();
        let masks = self.action_space.batch_masks(&views);
        let recency = recency_adjustment(
            self.state.recent_actions(),
            self.state.recent_rewards(),
            a,
            0.8,
        );
        let framing = self.framing_valence();
        self.counters.loop_stage_counters.evaluate += active_count;

        // --- DECIDE: partitioned policy evaluation, merged in partition order.
        let decisions = self.decide_partitioned(
            &base_utilities,
            &masks,
            &committed,
            &population,
            &peer_support,
            framing.as_ref(),
            &recency,
            tick,
        )?;
        self.counters.loop_stage_counters.decide += active_count;

        // --- ACT: emit records in the tick's stable agent order.
        let order = rng::tick_permutation(seed, tick, n);
        let mut actions_taken = vec![-1i32; n];
        let mut records = Vec::with_capacity(n);
        for &i in &order {
            let i = i as usize;
            if !active[i] {
                continue;
            }
            let choice = decisions.choices[i];
            let definition = self
                .action_space
                .action_by_index(choice)
                .ok_or_else(|| EngineError::UnknownAction(format!("index {choice}")))?;
            actions_taken[i] = choice as i32;
            records.push(ActionRecord {
                agent_id: AgentId(i as u32),
                tick,
                action_index: choice,
                action_name: definition.name.clone(),
                action_type: definition.action_type,
                confidence: round6(decisions.probabilities[[i, choice]]),
                parameters: None,
            });
        }
        self.counters.loop_stage_counters.act += records.len() as u64;

        // --- UPDATE: apply effects, rewards, commitments, and belief drift.
        self.apply_updates(tick, &active, &actions_taken, &decisions, &peer_support)?;
        let evidence_strength = Array1::from_iter(
            (0..n).map(|i| self.state.scalar(i, ScalarKey::InfluenceSusceptibility) * 0.3),
        );
        let updated_preferences = behavior::BehavioralModel.update_beliefs(
            self.state.preferences(),
            &social_influence,
            &evidence_strength,
            &self.params.anchoring_strength,
            &self.params.confirmation_bias,
        );
        self.state.update_preferences(updated_preferences);

        let cascade = detect_information_cascade(
            self.state.committed_choices(),
            self.state.neighbors(),
            0.6,
        );
        for (i, in_cascade) in cascade.iter().enumerate() {
            let previous = self.state.scalar(i, ScalarKey::EchoChamberScore);
            let target = if *in_cascade { 1.0 } else { 0.0 };
            self.state
                .set_scalar(i, ScalarKey::EchoChamberScore, previous * 0.9 + target * 0.1);
        }
        self.counters.loop_stage_counters.update += active_count;

        // Fault injection and the run-level tolerance check.
        self.inject_faults(tick)?;

        self.counters.agent_steps_executed += active_count;
        self.counters.ticks_executed += 1;
        self.counters.partitions_count = self.active_partitions as u64;
        let chunk = n.div_ceil(self.active_partitions);
        self.counters.batches_count +=
            (chunk.div_ceil(self.config.scheduler.batch_size).max(1) * self.active_partitions)
                as u64;

        self.state.advance_tick();
        debug!(tick = tick.0, actions = records.len(), "tick complete");

        Ok(TickOutput {
            tick,
            actions: records,
            events_triggered,
            metrics: self.state.metrics(),
        })
    }

    /// Final outcomes from the current population state.
    pub fn outcomes(&self) -> SimulationOutcomes {
        let aggregates = self.state.global_aggregates(&self.action_names);
        let (primary_outcome, primary_outcome_probability) = aggregates
            .choice_distribution
            .iter()
            .max_by(|(name_a, p_a), (name_b, p_b)| {
                p_a.partial_cmp(p_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Lexicographically smallest name wins ties for stability.
                    .then_with(|| name_b.cmp(name_a))
            })
            .map(|(name, p)| (name.clone(), *p))
            .unwrap_or_else(|| ("undecided".to_string(), 0.0));

        let key_metrics = vec![
            KeyMetric {
                name: "commitment_rate".to_string(),
                value: aggregates.commitment_rate,
            },
            KeyMetric {
                name: "agent_count".to_string(),
                value: aggregates.total_agents as f64,
            },
            KeyMetric {
                name: "mean_engagement".to_string(),
                value: aggregates.mean_engagement,
            },
            KeyMetric {
                name: "mean_certainty".to_string(),
                value: aggregates.mean_certainty,
            },
        ];

        let environment_state = self
            .state
            .environment()
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), round6(*v)))
            .collect();

        SimulationOutcomes {
            primary_outcome,
            primary_outcome_probability,
            outcome_distribution: aggregates.choice_distribution,
            key_metrics,
            environment_state,
        }
    }

    // ============================================================================
    // Internals
    // ============================================================================

    fn base_utilities(&self) -> Array2<f64> {
        let n = self.state.agent_count();
        let a = self.action_space.n();
        let preferences = self.state.preferences();
        let env = self.state.environment();
        let media = env.variable("media_attention");
        let info_flow = env.variable("information_flow");
        let commit_actions = self.action_space.commit_indices();

        let mut utilities = Array2::zeros((n, a));
        let discuss = self.action_space.index_of("discuss");
        let seek = self.action_space.index_of("seek_information");

        for i in 0..n {
            let certainty = self.state.scalar(i, ScalarKey::Certainty);
            let engagement = self.state.scalar(i, ScalarKey::Engagement);
            for (c, &j) in commit_actions.iter().enumerate() {
                let preference = if c < preferences.ncols() {
                    preferences[[i, c]]
                } else {
                    0.0
                };
                utilities[[i, j]] = preference * (0.8 + media * 0.4) + certainty * 0.2;
            }
            if let Some(j) = discuss {
                utilities[[i, j]] = engagement * 0.6;
            }
            if let Some(j) = seek {
                utilities[[i, j]] = (1.0 - certainty) * 0.5 + info_flow * 0.2;
            }
            utilities[[i, self.action_space.abstain_index()]] = 0.1;
        }
        utilities
    }

    fn framing_valence(&self) -> Option<Array1<f64>> {
        let valence = self.state.environment().variable("framing_valence");
        if valence == 0.0 {
            return None;
        }
        let mut per_action = Array1::zeros(self.action_space.n());
        for j in self.action_space.commit_indices() {
            per_action[j] = valence;
        }
        Some(per_action)
    }

    #[allow(clippy::too_many_arguments)]
    fn decide_partitioned(
        &self,
        base_utilities: &Array2<f64>,
        masks: &Array2<bool>,
        committed: &[i32],
        population: &Array1<f64>,
        peer_support: &Array2<f64>,
        framing: Option<&Array1<f64>>,
        recency: &Array2<f64>,
        tick: Tick,
    ) -> WorldlineResult<Decisions> {
        let n = self.state.agent_count();
        let a = self.action_space.n();
        let partitions = self.active_partitions.clamp(1, n);
        let chunk = n.div_ceil(partitions);

        let ranges: Vec<(usize, usize)> = (0..partitions)
            .map(|p| (p * chunk, ((p + 1) * chunk).min(n)))
            .filter(|(start, end)| start < end)
            .collect();

        let decide_range = |&(start, end): &(usize, usize)| -> WorldlineResult<Decisions> {
            let sub_utilities = base_utilities.slice(s![start..end, ..]).to_owned();
            let sub_masks = masks.slice(s![start..end, ..]).to_owned();
            let sub_support = peer_support.slice(s![start..end, ..]).to_owned();
            let sub_recency = recency.slice(s![start..end, ..]).to_owned();
            let sub_params = self.params_slice(start, end);

            let ctx = PolicyContext {
                params: &sub_params,
                decision: DecisionContext {
                    current_choices: &committed[start..end],
                    population_distribution: Some(population),
                    peer_support: Some(&sub_support),
                    framing_valence: framing,
                    recency: Some(&sub_recency),
                    seed: self.config.seed,
                    tick,
                    agent_index_base: start as u32,
                },
                temperature: self.config.temperature,
                deterministic: self.config.deterministic_decisions,
            };
            self.policy.decide(&sub_utilities, &sub_masks, &ctx)
        };

        let partial: Vec<WorldlineResult<Decisions>> = if ranges.len() > 1 {
            ranges.par_iter().map(decide_range).collect()
        } else {
            ranges.iter().map(decide_range).collect()
        };

        // Merge in partition-index order.
        let mut choices = Vec::with_capacity(n);
        let mut probabilities = Array2::zeros((n, a));
        for (range, result) in ranges.iter().zip(partial) {
            let decisions = result?;
            let (start, end) = *range;
            probabilities
                .slice_mut(s![start..end, ..])
                .assign(&decisions.probabilities);
            choices.extend(decisions.choices);
        }

        Ok(Decisions {
            choices,
            probabilities,
        })
    }

    fn params_slice(&self, start: usize, end: usize) -> BehavioralParams {
        let slice = |arr: &Array1<f64>| arr.slice(s![start..end]).to_owned();
        BehavioralParams {
            loss_aversion_lambda: slice(&self.params.loss_aversion_lambda),
            reference_point: slice(&self.params.reference_point),
            probability_weight_alpha: slice(&self.params.probability_weight_alpha),
            probability_weight_beta: slice(&self.params.probability_weight_beta),
            status_quo_strength: slice(&self.params.status_quo_strength),
            anchoring_strength: slice(&self.params.anchoring_strength),
            confirmation_bias: slice(&self.params.confirmation_bias),
            bandwagon_susceptibility: slice(&self.params.bandwagon_susceptibility),
            availability_weight: slice(&self.params.availability_weight),
            bounded_rationality: slice(&self.params.bounded_rationality),
            social_proof_weight: slice(&self.params.social_proof_weight),
            framing_sensitivity: slice(&self.params.framing_sensitivity),
            risk_aversion: slice(&self.params.risk_aversion),
        }
    }

    fn apply_updates(
        &mut self,
        tick: Tick,
        active: &[bool],
        actions_taken: &[i32],
        decisions: &Decisions,
        peer_support: &Array2<f64>,
    ) -> WorldlineResult<()> {
        let n = self.state.agent_count();
        let commit_actions = self.action_space.commit_indices();
        let mut commitments = Vec::new();
        let mut rewards = vec![0.0; n];

        for i in 0..n {
            if !active[i] || actions_taken[i] < 0 {
                continue;
            }
            self.state.set_phase(i, AgentPhase::Updating);
            let choice = actions_taken[i] as usize;
            let definition = self
                .action_space
                .action_by_index(choice)
                .expect("validated in act stage")
                .clone();

            // Action effects are the engine's rule applications.
            if !definition.effects.is_empty() {
                for (scalar, delta) in &definition.effects {
                    if let Some(key) = ScalarKey::from_name(scalar) {
                        self.state.adjust_scalar(i, key, *delta);
                    }
                }
                let entry = self
                    .rule_counts
                    .entry((definition.name.clone(), "update".to_string()))
                    .or_insert((0, 0));
                entry.0 += 1;
                entry.1 += 1;
            }

            // Commitment transition.
            if self.state.committed_choices()[i] < 0
                && matches!(definition.action_type, ActionType::Commit | ActionType::Vote)
            {
                let choice_slot = commit_actions
                    .iter()
                    .position(|&j| j == choice)
                    .unwrap_or(0);
                let strength = decisions.probabilities[[i, choice]].max(0.5);
                commitments.push((i, choice_slot as i32, strength));
                self.state.memories_mut()[i].add_event(MemoryEvent {
                    tick,
                    kind: format!("commit:{}", definition.name),
                    significance: 0.8,
                    data: serde_json::Value::Null,
                });
            }

            // Reward components for this agent.
            let mut components = BTreeMap::new();
            components.insert(
                RewardComponent::Alignment,
                decisions.probabilities[[i, choice]],
            );
            components.insert(RewardComponent::SocialApproval, peer_support[[i, choice]]);
            let committed_choice = self.state.committed_choices()[i];
            let consistent = committed_choice >= 0
                && commit_actions
                    .get(committed_choice as usize)
                    .is_some_and(|&j| j == choice);
            components.insert(RewardComponent::Consistency, if consistent { 1.0 } else { 0.0 });
            if definition.action_type == ActionType::SeekInformation {
                components.insert(
                    RewardComponent::InformationGain,
                    self.state.environment().variable("information_flow"),
                );
            }
            components.insert(RewardComponent::TimeCost, -0.05);
            rewards[i] = self.reward_model.total(&components);

            // Certainty drifts upward with engagement.
            let engagement = self.state.scalar(i, ScalarKey::Engagement);
            self.state
                .adjust_scalar(i, ScalarKey::Certainty, 0.01 * engagement);
            self.state.set_phase(i, AgentPhase::Idle);
        }

        self.state.commit_agents(&commitments);
        self.state.record_actions(actions_taken, &rewards);
        Ok(())
    }

    fn inject_faults(&mut self, tick: Tick) -> WorldlineResult<()> {
        if self.config.fault_rate > 0.0 {
            let n = self.state.agent_count();
            for i in 0..n {
                if !self.state.phases()[i].is_active() {
                    continue;
                }
                let mut stream =
                    rng::stream(self.config.seed, tick, i as u32, StageTag::Fault);
                if stream.random::<f64>() < self.config.fault_rate {
                    self.state.set_phase(i, AgentPhase::Terminated);
                    self.terminated += 1;
                }
            }
        }

        let n = self.state.agent_count();
        if self.terminated as f64 > self.config.agent_fault_tolerance * n as f64 {
            return Err(EngineError::AgentFaultThreshold {
                terminated: self.terminated,
                total: n,
            }
            .into());
        }
        Ok(())
    }
}
