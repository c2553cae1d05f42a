// ================================================================================================
// Action Spaces
// ================================================================================================

use ndarray::{Array1, Array2};
use rand::{Rng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    error::{EngineError, WorldlineResult},
    types::{AgentId, Tick},
};

/// Types of actions agents can take.
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
pub enum ActionType {
    // Commitment actions
    Vote,
    Commit,
    SwitchPreference,
    Abstain,

    // Information actions
    SeekInformation,
    ShareInformation,
    IgnoreInformation,

    // Social actions
    Discuss,
    Persuade,
    Listen,
    Avoid,

    // Consumer actions
    Purchase,
    Consider,
    Reject,
    Recommend,

    // General
    Wait,
}

/// A parsed precondition gating an action.
///
/// Threshold variants are encoded as `certainty_above_<x>` / `certainty_below_<x>` in
/// external documents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Precondition {
    IsCommitted,
    NotCommitted,
    HasInformation,
    CertaintyAbove(f64),
    CertaintyBelow(f64),
}

impl Precondition {
    pub fn parse(s: &str) -> WorldlineResult<Self> {
        match s {
            "is_committed" => Ok(Self::IsCommitted),
            "not_committed" => Ok(Self::NotCommitted),
            "has_information" => Ok(Self::HasInformation),
            _ => {
                if let Some(rest) = s.strip_prefix("certainty_above_") {
                    let threshold: f64 = rest
                        .parse()
                        .map_err(|_| EngineError::InvalidPrecondition(s.to_string()))?;
                    Ok(Self::CertaintyAbove(threshold))
                } else if let Some(rest) = s.strip_prefix("certainty_below_") {
                    let threshold: f64 = rest
                        .parse()
                        .map_err(|_| EngineError::InvalidPrecondition(s.to_string()))?;
                    Ok(Self::CertaintyBelow(threshold))
                } else {
                    Err(EngineError::InvalidPrecondition(s.to_string()).into())
                }
            }
        }
    }

    /// Evaluate against an agent's condition view.
    pub fn holds(&self, view: &AgentConditionView) -> bool {
        match self {
            Self::IsCommitted => view.is_committed,
            Self::NotCommitted => !view.is_committed,
            Self::HasInformation => view.has_information,
            Self::CertaintyAbove(t) => view.certainty >= *t,
            Self::CertaintyBelow(t) => view.certainty < *t,
        }
    }
}

impl TryFrom<String> for Precondition {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).map_err(|e| e.to_string())
    }
}

impl From<Precondition> for String {
    fn from(value: Precondition) -> Self {
        match value {
            Precondition::IsCommitted => "is_committed".to_string(),
            Precondition::NotCommitted => "not_committed".to_string(),
            Precondition::HasInformation => "has_information".to_string(),
            Precondition::CertaintyAbove(t) => format!("certainty_above_{t}"),
            Precondition::CertaintyBelow(t) => format!("certainty_below_{t}"),
        }
    }
}

/// The slice of agent state that preconditions can see.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentConditionView {
    pub is_committed: bool,
    pub has_information: bool,
    pub certainty: f64,
}

/// Definition of a single discrete action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub action_type: ActionType,
    pub name: String,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub parameters: std::collections::BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preconditions: Vec<Precondition>,
    /// Scalar state deltas applied when the action resolves, keyed by scalar name.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub effects: std::collections::BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub reward_components: std::collections::BTreeMap<String, f64>,
}

impl ActionDefinition {
    pub fn new(action_type: ActionType, name: impl Into<String>) -> Self {
        Self {
            action_type,
            name: name.into(),
            parameters: Default::default(),
            preconditions: Vec::new(),
            effects: Default::default(),
            reward_components: Default::default(),
        }
    }

    pub fn with_preconditions(mut self, preconditions: Vec<Precondition>) -> Self {
        self.preconditions = preconditions;
        self
    }

    pub fn with_effect(mut self, scalar: impl Into<String>, delta: f64) -> Self {
        self.effects.insert(scalar.into(), delta);
        self
    }
}

// ================================================================================================
// Discrete Space
// ================================================================================================

/// Discrete action space with named actions and precondition masks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscreteActionSpace {
    actions: Vec<ActionDefinition>,
    abstain_index: usize,
}

impl DiscreteActionSpace {
    /// Build a space from definitions. An abstain action is appended when absent so
    /// masked sampling always has a fallback.
    pub fn new(mut actions: Vec<ActionDefinition>) -> Self {
        let abstain_index = match actions
            .iter()
            .position(|a| a.action_type == ActionType::Abstain)
        {
            Some(i) => i,
            None => {
                actions.push(ActionDefinition::new(ActionType::Abstain, "abstain"));
                actions.len() - 1
            }
        };
        Self {
            actions,
            abstain_index,
        }
    }

    /// Default electoral-style space: `k` commit choices plus discuss/seek/abstain.
    ///
    /// Commit choices require `certainty_above_0.6` and `not_committed`, matching the
    /// canonical ruleset.
    pub fn with_choices(k: usize) -> Self {
        let mut actions: Vec<ActionDefinition> = (0..k)
            .map(|i| {
                ActionDefinition::new(ActionType::Commit, format!("choice_{i}"))
                    .with_preconditions(vec![
                        Precondition::CertaintyAbove(0.6),
                        Precondition::NotCommitted,
                    ])
                    .with_effect("commitment_strength", 0.2)
                    .with_effect("certainty", 0.05)
            })
            .collect();
        actions.push(
            ActionDefinition::new(ActionType::Discuss, "discuss")
                .with_effect("engagement", 0.02),
        );
        actions.push(
            ActionDefinition::new(ActionType::SeekInformation, "seek_information")
                .with_preconditions(vec![Precondition::CertaintyBelow(0.8)])
                .with_effect("information_exposure", 0.05),
        );
        Self::new(actions)
    }

    pub fn n(&self) -> usize {
        self.actions.len()
    }

    pub fn actions(&self) -> &[ActionDefinition] {
        &self.actions
    }

    pub fn abstain_index(&self) -> usize {
        self.abstain_index
    }

    pub fn action_by_index(&self, index: usize) -> Option<&ActionDefinition> {
        self.actions.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.actions.iter().position(|a| a.name == name)
    }

    /// Indices of actions that commit the agent to a choice, in definition order.
    pub fn commit_indices(&self) -> Vec<usize> {
        self.actions
            .iter()
            .enumerate()
            .filter(|(_, a)| matches!(a.action_type, ActionType::Commit | ActionType::Vote))
            .map(|(i, _)| i)
            .collect()
    }

    /// Per-agent validity mask from preconditions. The abstain action is always valid.
    pub fn mask(&self, view: &AgentConditionView) -> Array1<bool> {
        Array1::from_iter(self.actions.iter().enumerate().map(|(i, action)| {
            i == self.abstain_index || action.preconditions.iter().all(|p| p.holds(view))
        }))
    }

    /// Batch masks, one row per agent.
    pub fn batch_masks(&self, views: &[AgentConditionView]) -> Array2<bool> {
        let mut masks = Array2::from_elem((views.len(), self.n()), true);
        for (i, view) in views.iter().enumerate() {
            masks.row_mut(i).assign(&self.mask(view));
        }
        masks
    }

    /// Sample a uniformly random valid action, falling back to abstain when the mask
    /// admits nothing.
    pub fn sample_with_mask(&self, mask: &Array1<bool>, rng: &mut StdRng) -> usize {
        let valid: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter(|(_, ok)| **ok)
            .map(|(i, _)| i)
            .collect();
        if valid.is_empty() {
            self.abstain_index
        } else {
            valid[rng.random_range(0..valid.len())]
        }
    }
}

// ================================================================================================
// Continuous & Hybrid Spaces
// ================================================================================================

/// Continuous action space with per-dimension bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousActionSpace {
    pub low: Vec<f64>,
    pub high: Vec<f64>,
    pub names: Vec<String>,
}

impl ContinuousActionSpace {
    pub fn new(low: Vec<f64>, high: Vec<f64>) -> WorldlineResult<Self> {
        if low.len() != high.len() {
            return Err(EngineError::PolicyShape(format!(
                "continuous bounds length mismatch: {} vs {}",
                low.len(),
                high.len()
            ))
            .into());
        }
        let names = (0..low.len()).map(|i| format!("dim_{i}")).collect();
        Ok(Self { low, high, names })
    }

    pub fn dims(&self) -> usize {
        self.low.len()
    }

    pub fn contains(&self, action: &[f64]) -> bool {
        action.len() == self.dims()
            && action
                .iter()
                .zip(self.low.iter().zip(self.high.iter()))
                .all(|(v, (lo, hi))| *v >= *lo && *v <= *hi)
    }

    pub fn sample(&self, rng: &mut StdRng) -> Vec<f64> {
        self.low
            .iter()
            .zip(self.high.iter())
            .map(|(lo, hi)| lo + (hi - lo) * rng.random::<f64>())
            .collect()
    }

    pub fn clamp(&self, action: &mut [f64]) {
        for (v, (lo, hi)) in action
            .iter_mut()
            .zip(self.low.iter().zip(self.high.iter()))
        {
            *v = v.clamp(*lo, *hi);
        }
    }
}

/// Hybrid space: a discrete choice plus a bounded continuous parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridActionSpace {
    pub discrete: DiscreteActionSpace,
    pub parameters: ContinuousActionSpace,
}

impl HybridActionSpace {
    pub fn sample(&self, mask: &Array1<bool>, rng: &mut StdRng) -> (usize, Vec<f64>) {
        let choice = self.discrete.sample_with_mask(mask, rng);
        (choice, self.parameters.sample(rng))
    }
}

// ================================================================================================
// Action Records
// ================================================================================================

/// Structured record emitted in the ACT stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub agent_id: AgentId,
    pub tick: Tick,
    pub action_index: usize,
    pub action_name: String,
    pub action_type: ActionType,
    /// Probability mass the policy put on the chosen action.
    pub confidence: f64,
    /// Continuous parameters for hybrid actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Vec<f64>>,
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    fn view(is_committed: bool, certainty: f64) -> AgentConditionView {
        AgentConditionView {
            is_committed,
            has_information: true,
            certainty,
        }
    }

    #[test]
    fn precondition_parsing_round_trips() {
        let p = Precondition::parse("certainty_above_0.6").unwrap();
        assert_eq!(p, Precondition::CertaintyAbove(0.6));
        assert_eq!(String::from(p), "certainty_above_0.6");
        assert!(Precondition::parse("unknown_gate").is_err());
    }

    #[test]
    fn space_appends_abstain_when_missing() {
        let space = DiscreteActionSpace::new(vec![ActionDefinition::new(
            ActionType::Discuss,
            "discuss",
        )]);
        assert_eq!(space.n(), 2);
        assert_eq!(space.actions()[space.abstain_index()].name, "abstain");
    }

    #[test]
    fn mask_blocks_commit_below_certainty_threshold() {
        let space = DiscreteActionSpace::with_choices(2);
        let commit_idx = space.index_of("choice_0").unwrap();

        let uncertain = space.mask(&view(false, 0.4));
        assert!(!uncertain[commit_idx]);

        let certain = space.mask(&view(false, 0.9));
        assert!(certain[commit_idx]);

        // Committed agents cannot commit again.
        let committed = space.mask(&view(true, 0.9));
        assert!(!committed[commit_idx]);
        assert!(committed[space.abstain_index()]);
    }

    #[test]
    fn masked_sampling_falls_back_to_abstain() {
        let space = DiscreteActionSpace::with_choices(2);
        let mask = Array1::from_elem(space.n(), false);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(space.sample_with_mask(&mask, &mut rng), space.abstain_index());
    }

    #[test]
    fn continuous_space_samples_within_bounds() {
        let space = ContinuousActionSpace::new(vec![-1.0, 0.0], vec![1.0, 10.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..32 {
            let sample = space.sample(&mut rng);
            assert!(space.contains(&sample));
        }
        assert!(ContinuousActionSpace::new(vec![0.0], vec![1.0, 2.0]).is_err());
    }
}
