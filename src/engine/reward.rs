// ================================================================================================
// Reward Components
// ================================================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

const EPSILON: f64 = 1e-10;

/// Named reward components. Total reward is the weighted sum over components.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RewardComponent {
    Alignment,
    SocialApproval,
    Consistency,
    InformationGain,
    Accuracy,
    TimeCost,
}

/// Per-component weights. Components absent from the map contribute nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentWeights(pub BTreeMap<RewardComponent, f64>);

impl Default for ComponentWeights {
    fn default() -> Self {
        let mut weights = BTreeMap::new();
        weights.insert(RewardComponent::Alignment, 1.0);
        weights.insert(RewardComponent::SocialApproval, 0.5);
        weights.insert(RewardComponent::Consistency, 0.3);
        weights.insert(RewardComponent::InformationGain, 0.2);
        weights.insert(RewardComponent::TimeCost, 0.1);
        Self(weights)
    }
}

impl ComponentWeights {
    pub fn weight(&self, component: RewardComponent) -> f64 {
        self.0.get(&component).copied().unwrap_or(0.0)
    }
}

/// Reward model: weighted component sums plus the KL-based accuracy reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RewardModel {
    pub weights: ComponentWeights,
}

impl RewardModel {
    pub fn new(weights: ComponentWeights) -> Self {
        Self { weights }
    }

    /// Total reward = Σ wᵢ·componentᵢ. Time cost enters with its own sign; callers
    /// supply it negative.
    pub fn total(&self, components: &BTreeMap<RewardComponent, f64>) -> f64 {
        components
            .iter()
            .map(|(component, value)| self.weights.weight(*component) * value)
            .sum()
    }

    /// Accuracy reward for a predicted distribution against ground truth:
    /// `exp(-KL(truth ∥ pred)) · accuracy_weight`. A perfect prediction scores the
    /// full accuracy weight; diverging predictions decay toward zero.
    pub fn compute_accuracy_reward(
        &self,
        predicted: &BTreeMap<String, f64>,
        truth: &BTreeMap<String, f64>,
    ) -> f64 {
        let kl = kl_divergence(truth, predicted);
        (-kl).exp() * self.weights.weight(RewardComponent::Accuracy)
    }
}

/// KL(p ∥ q) over sparse distributions keyed by outcome name. Both sides are
/// re-normalized; missing mass on either side is clamped to epsilon.
pub fn kl_divergence(p: &BTreeMap<String, f64>, q: &BTreeMap<String, f64>) -> f64 {
    let p_total: f64 = p.values().sum::<f64>() + EPSILON;
    let q_total: f64 = q.values().sum::<f64>() + EPSILON;

    p.iter()
        .map(|(key, &p_raw)| {
            let p_norm = (p_raw / p_total).max(EPSILON);
            let q_norm = (q.get(key).copied().unwrap_or(0.0) / q_total).max(EPSILON);
            p_norm * (p_norm / q_norm).ln()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn total_is_weighted_sum() {
        let model = RewardModel::default();
        let mut components = BTreeMap::new();
        components.insert(RewardComponent::Alignment, 2.0);
        components.insert(RewardComponent::TimeCost, -1.0);
        // 1.0 * 2.0 + 0.1 * -1.0
        assert!((model.total(&components) - 1.9).abs() < 1e-12);
    }

    #[test]
    fn kl_is_zero_for_identical_distributions() {
        let p = dist(&[("a", 0.6), ("b", 0.4)]);
        assert!(kl_divergence(&p, &p).abs() < 1e-9);
    }

    #[test]
    fn accuracy_reward_is_maximal_for_exact_prediction() {
        let mut weights = ComponentWeights::default();
        weights.0.insert(RewardComponent::Accuracy, 2.0);
        let model = RewardModel::new(weights);

        let truth = dist(&[("a", 0.7), ("b", 0.3)]);
        let exact = model.compute_accuracy_reward(&truth, &truth);
        assert!((exact - 2.0).abs() < 1e-6);

        let off = model.compute_accuracy_reward(&dist(&[("a", 0.2), ("b", 0.8)]), &truth);
        assert!(off < exact);
        assert!(off > 0.0);
    }
}
