// ================================================================================================
// Agents: Profiles, Memory, Social Edges, Lifecycle
// ================================================================================================

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    engine::rng::{self, StageTag},
    types::{AgentId, Seed, Tick},
};

/// Agent lifecycle phase.
///
/// Phases advance through the tick loop (OBSERVING → … → UPDATING) and return to IDLE.
/// SUSPENDED and TERMINATED are sticky; a TERMINATED agent keeps its last-known state
/// and is skipped by every subsequent stage.
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
pub enum AgentPhase {
    #[default]
    Initializing,
    Idle,
    Observing,
    Evaluating,
    Deciding,
    Acting,
    Updating,
    Suspended,
    Terminated,
}

impl AgentPhase {
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Suspended | Self::Terminated)
    }
}

/// Types of social relationships.
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
pub enum SocialEdgeType {
    Family,
    Friend,
    Colleague,
    Acquaintance,
    Follower,
    Leader,
    Neighbor,
    Stranger,
}

/// Typed directed relation to another agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SocialEdge {
    pub target: AgentId,
    pub edge_type: SocialEdgeType,
    /// Influence strength 0-1.
    pub weight: f64,
    /// Trust level 0-1.
    pub trust: f64,
    /// Interaction frequency 0-1.
    pub frequency: f64,
}

impl SocialEdge {
    /// Effective influence contributed by this edge.
    pub fn influence_strength(&self) -> f64 {
        self.weight * self.trust * self.frequency
    }
}

/// Neighbor list type used by the state manager's sparse adjacency.
pub type NeighborList = SmallVec<[SocialEdge; 8]>;

// ================================================================================================
// Memory
// ================================================================================================

/// A single remembered event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub tick: Tick,
    pub kind: String,
    /// 0-1; events above the promotion threshold survive into episodic memory.
    pub significance: f64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Agent memory: a bounded recent-events queue, EMA beliefs, an episodic store, and
/// associative weights.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMemory {
    recent_events: Vec<MemoryEvent>,
    episodes: Vec<MemoryEvent>,
    beliefs: std::collections::BTreeMap<String, f64>,
    associations: std::collections::BTreeMap<String, std::collections::BTreeMap<String, f64>>,
}

const MAX_RECENT_EVENTS: usize = 50;
const MAX_EPISODES: usize = 100;
const EPISODE_SIGNIFICANCE: f64 = 0.7;

impl AgentMemory {
    /// Append an event to recent memory. Overflowed events are promoted into the
    /// episodic store when significant enough, otherwise dropped.
    pub fn add_event(&mut self, event: MemoryEvent) {
        self.recent_events.push(event);
        if self.recent_events.len() > MAX_RECENT_EVENTS {
            let old = self.recent_events.remove(0);
            if old.significance > EPISODE_SIGNIFICANCE {
                self.add_episode(old);
            }
        }
    }

    /// Add a significant episode; the least significant episode is evicted at capacity.
    pub fn add_episode(&mut self, episode: MemoryEvent) {
        self.episodes.push(episode);
        if self.episodes.len() > MAX_EPISODES {
            let min_idx = self
                .episodes
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.significance
                        .partial_cmp(&b.significance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i)
                .unwrap_or(0);
            self.episodes.remove(min_idx);
        }
    }

    /// Update a belief with an exponential moving average.
    pub fn update_belief(&mut self, key: &str, value: f64, learning_rate: f64) {
        match self.beliefs.get_mut(key) {
            Some(current) => *current = *current * (1.0 - learning_rate) + value * learning_rate,
            None => {
                self.beliefs.insert(key.to_string(), value);
            }
        }
    }

    pub fn belief(&self, key: &str) -> f64 {
        self.beliefs.get(key).copied().unwrap_or(0.5)
    }

    pub fn beliefs(&self) -> &std::collections::BTreeMap<String, f64> {
        &self.beliefs
    }

    /// Add or strengthen a trigger→response association.
    pub fn add_association(&mut self, trigger: &str, response: &str, strength: f64) {
        let entry = self.associations.entry(trigger.to_string()).or_default();
        match entry.get_mut(response) {
            Some(existing) => *existing = (*existing + strength * 0.1).min(1.0),
            None => {
                entry.insert(response.to_string(), strength);
            }
        }
    }

    pub fn association(&self, trigger: &str, response: &str) -> f64 {
        self.associations
            .get(trigger)
            .and_then(|responses| responses.get(response))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn recent_events(&self) -> &[MemoryEvent] {
        &self.recent_events
    }

    pub fn episodes(&self) -> &[MemoryEvent] {
        &self.episodes
    }

    pub fn summary(&self) -> MemorySummary {
        MemorySummary {
            belief_count: self.beliefs.len(),
            episode_count: self.episodes.len(),
            recent_count: self.recent_events.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySummary {
    pub belief_count: usize,
    pub episode_count: usize,
    pub recent_count: usize,
}

// ================================================================================================
// Profiles
// ================================================================================================

/// Stable agent characteristics derived from a Persona at run start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: AgentId,
    pub persona_ref: Option<String>,
    pub label: String,

    // Demographics
    pub age: u32,
    pub region: String,
    pub segment: String,

    // Psychographics (Big Five)
    pub openness: f64,
    pub conscientiousness: f64,
    pub extraversion: f64,
    pub agreeableness: f64,
    pub neuroticism: f64,

    // Economic
    pub risk_tolerance: f64,

    /// Prior probabilities for action tendencies, keyed by action name.
    pub action_probabilities: std::collections::BTreeMap<String, f64>,
}

impl AgentProfile {
    /// Build a profile from a persona document. Missing fields fall back to neutral
    /// midpoints so partially specified personas stay usable.
    pub fn from_persona(agent_id: AgentId, persona: &Value) -> Self {
        let demographics = &persona["demographics"];
        let big_five = &persona["psychographics"]["big_five"];
        let economic = &persona["economic"];

        let num = |v: &Value, default: f64| v.as_f64().unwrap_or(default);

        let mut action_probabilities = std::collections::BTreeMap::new();
        if let Some(map) = persona["action_probabilities"].as_object() {
            for (k, v) in map {
                if let Some(p) = v.as_f64() {
                    action_probabilities.insert(k.clone(), p.clamp(0.0, 1.0));
                }
            }
        }

        Self {
            agent_id,
            persona_ref: persona["persona_id"].as_str().map(str::to_string),
            label: persona["label"].as_str().unwrap_or_default().to_string(),
            age: persona["demographics"]["age"].as_u64().unwrap_or(30) as u32,
            region: demographics["region"].as_str().unwrap_or_default().to_string(),
            segment: demographics["segment"].as_str().unwrap_or("default").to_string(),
            openness: num(&big_five["openness"], 0.5),
            conscientiousness: num(&big_five["conscientiousness"], 0.5),
            extraversion: num(&big_five["extraversion"], 0.5),
            agreeableness: num(&big_five["agreeableness"], 0.5),
            neuroticism: num(&big_five["neuroticism"], 0.5),
            risk_tolerance: num(&economic["risk_tolerance"], 0.5),
            action_probabilities,
        }
    }

    /// Generate a synthetic population of `n` profiles from the `Parameters` stream.
    ///
    /// Used when a run has no persona upload bound to it. Region and segment are
    /// assigned round-robin over small fixed vocabularies; trait jitter comes from the
    /// seeded stream, so the population is a pure function of `(seed, n)`.
    pub fn generate_population(seed: Seed, n: usize) -> Vec<AgentProfile> {
        const REGIONS: [&str; 4] = ["north", "south", "east", "west"];
        const SEGMENTS: [&str; 3] = ["urban", "suburban", "rural"];

        let mut rng = rng::population_stream(seed, Tick(0), StageTag::Parameters);
        (0..n)
            .map(|i| {
                let age = 18 + rng.random_range(0..60u32);
                let mut traits = [0.0f64; 6];
                for value in traits.iter_mut() {
                    *value = (rng.random::<f64>() * 0.6 + 0.2).clamp(0.0, 1.0);
                }
                AgentProfile {
                    agent_id: AgentId(i as u32),
                    persona_ref: None,
                    label: format!("synthetic-{i:05}"),
                    age,
                    region: REGIONS[i % REGIONS.len()].to_string(),
                    segment: SEGMENTS[i % SEGMENTS.len()].to_string(),
                    openness: traits[0],
                    conscientiousness: traits[1],
                    extraversion: traits[2],
                    agreeableness: traits[3],
                    neuroticism: traits[4],
                    risk_tolerance: traits[5],
                    action_probabilities: std::collections::BTreeMap::new(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn influence_is_product_of_edge_scalars() {
        let edge = SocialEdge {
            target: AgentId(1),
            edge_type: SocialEdgeType::Friend,
            weight: 0.8,
            trust: 0.5,
            frequency: 0.5,
        };
        assert!((edge.influence_strength() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn memory_promotes_significant_overflow_to_episodes() {
        let mut memory = AgentMemory::default();
        memory.add_event(MemoryEvent {
            tick: Tick(0),
            kind: "shock".into(),
            significance: 0.9,
            data: Value::Null,
        });
        for t in 1..=MAX_RECENT_EVENTS as u32 {
            memory.add_event(MemoryEvent {
                tick: Tick(t),
                kind: "observation".into(),
                significance: 0.3,
                data: Value::Null,
            });
        }
        assert_eq!(memory.recent_events().len(), MAX_RECENT_EVENTS);
        assert_eq!(memory.episodes().len(), 1);
        assert_eq!(memory.episodes()[0].kind, "shock");
    }

    #[test]
    fn belief_update_is_exponential_moving_average() {
        let mut memory = AgentMemory::default();
        memory.update_belief("approval", 1.0, 0.1);
        assert!((memory.belief("approval") - 1.0).abs() < 1e-12);
        memory.update_belief("approval", 0.0, 0.1);
        assert!((memory.belief("approval") - 0.9).abs() < 1e-12);
    }

    #[test]
    fn associations_strengthen_and_saturate() {
        let mut memory = AgentMemory::default();
        memory.add_association("rally", "commit", 0.5);
        let initial = memory.association("rally", "commit");
        assert!((initial - 0.5).abs() < 1e-12);

        for _ in 0..100 {
            memory.add_association("rally", "commit", 0.9);
        }
        // Repeated reinforcement converges on the cap.
        assert!((memory.association("rally", "commit") - 1.0).abs() < 1e-9);
        assert_eq!(memory.association("rally", "avoid"), 0.0);
    }

    #[test]
    fn population_generation_is_seed_deterministic() {
        let a = AgentProfile::generate_population(Seed(9), 20);
        let b = AgentProfile::generate_population(Seed(9), 20);
        assert_eq!(a, b);

        let c = AgentProfile::generate_population(Seed(10), 20);
        assert_ne!(a, c);
    }

    #[test]
    fn profile_from_persona_reads_nested_fields() {
        let persona = json!({
            "persona_id": "p-1",
            "label": "Voter A",
            "demographics": {"age": 44, "region": "north", "segment": "urban"},
            "psychographics": {"big_five": {"openness": 0.8}},
            "economic": {"risk_tolerance": 0.3},
            "action_probabilities": {"discuss": 0.4},
        });
        let profile = AgentProfile::from_persona(AgentId(0), &persona);
        assert_eq!(profile.age, 44);
        assert_eq!(profile.region, "north");
        assert!((profile.openness - 0.8).abs() < 1e-12);
        assert!((profile.conscientiousness - 0.5).abs() < 1e-12);
        assert!((profile.action_probabilities["discuss"] - 0.4).abs() < 1e-12);
    }
}
