// ================================================================================================
// Behavioral-Economics Model
// ================================================================================================
//
// Vectorized cognitive-bias pipeline over utility matrices `(N agents × A actions)`.
// Every operation is a pure function of its inputs and the tick-local PRNG streams, so
// the whole decision stage is bit-reproducible under a fixed seed.

use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    engine::{
        agent::NeighborList,
        rng::{self, StageTag},
    },
    types::{Seed, Tick},
};

const EPSILON: f64 = 1e-10;

/// Population profile selecting base bias levels.
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
pub enum PopulationProfile {
    #[default]
    Average,
    Rational,
    Emotional,
}

impl PopulationProfile {
    /// Base parameter levels, from empirically typical values.
    fn base(&self) -> BaseParams {
        match self {
            Self::Average => BaseParams {
                loss_aversion_lambda: 2.25,
                probability_weight_alpha: 0.65,
                probability_weight_beta: 0.60,
                status_quo_strength: 0.3,
                anchoring_strength: 0.5,
                confirmation_bias: 0.4,
                bandwagon_susceptibility: 0.3,
                availability_weight: 0.5,
                bounded_rationality: 0.6,
                social_proof_weight: 0.4,
                framing_sensitivity: 0.3,
                risk_aversion: 0.5,
            },
            Self::Rational => BaseParams {
                loss_aversion_lambda: 1.5,
                probability_weight_alpha: 0.9,
                probability_weight_beta: 0.9,
                status_quo_strength: 0.1,
                anchoring_strength: 0.2,
                confirmation_bias: 0.1,
                bandwagon_susceptibility: 0.1,
                availability_weight: 0.2,
                bounded_rationality: 0.2,
                social_proof_weight: 0.1,
                framing_sensitivity: 0.1,
                risk_aversion: 0.3,
            },
            Self::Emotional => BaseParams {
                loss_aversion_lambda: 3.0,
                probability_weight_alpha: 0.5,
                probability_weight_beta: 0.5,
                status_quo_strength: 0.5,
                anchoring_strength: 0.7,
                confirmation_bias: 0.6,
                bandwagon_susceptibility: 0.5,
                availability_weight: 0.7,
                bounded_rationality: 0.8,
                social_proof_weight: 0.6,
                framing_sensitivity: 0.5,
                risk_aversion: 0.7,
            },
        }
    }
}

struct BaseParams {
    loss_aversion_lambda: f64,
    probability_weight_alpha: f64,
    probability_weight_beta: f64,
    status_quo_strength: f64,
    anchoring_strength: f64,
    confirmation_bias: f64,
    bandwagon_susceptibility: f64,
    availability_weight: f64,
    bounded_rationality: f64,
    social_proof_weight: f64,
    framing_sensitivity: f64,
    risk_aversion: f64,
}

/// Per-agent behavioral parameter vectors, all of length N.
#[derive(Debug, Clone, PartialEq)]
pub struct BehavioralParams {
    pub loss_aversion_lambda: Array1<f64>,
    pub reference_point: Array1<f64>,
    pub probability_weight_alpha: Array1<f64>,
    pub probability_weight_beta: Array1<f64>,
    pub status_quo_strength: Array1<f64>,
    pub anchoring_strength: Array1<f64>,
    pub confirmation_bias: Array1<f64>,
    pub bandwagon_susceptibility: Array1<f64>,
    pub availability_weight: Array1<f64>,
    pub bounded_rationality: Array1<f64>,
    pub social_proof_weight: Array1<f64>,
    pub framing_sensitivity: Array1<f64>,
    pub risk_aversion: Array1<f64>,
}

impl BehavioralParams {
    /// Generate a population's parameters from the `Parameters` stream: the profile's
    /// base value plus ~15% Gaussian jitter, clipped to the valid range per parameter
    /// (λ ∈ [1, 4], Prelec α/β ∈ [0.3, 1], everything else ∈ [0, 1]).
    pub fn generate(seed: Seed, n: usize, profile: PopulationProfile) -> Self {
        let base = profile.base();
        let mut rng = rng::population_stream(seed, Tick(0), StageTag::Parameters);

        let mut jittered = |value: f64, lo: f64, hi: f64| -> Array1<f64> {
            let std = value * 0.15;
            let normal = Normal::new(value, std.max(EPSILON)).expect("finite std");
            Array1::from_iter((0..n).map(|_| normal.sample(&mut rng).clamp(lo, hi)))
        };

        Self {
            loss_aversion_lambda: jittered(base.loss_aversion_lambda, 1.0, 4.0),
            reference_point: Array1::zeros(n),
            probability_weight_alpha: jittered(base.probability_weight_alpha, 0.3, 1.0),
            probability_weight_beta: jittered(base.probability_weight_beta, 0.3, 1.0),
            status_quo_strength: jittered(base.status_quo_strength, 0.0, 1.0),
            anchoring_strength: jittered(base.anchoring_strength, 0.0, 1.0),
            confirmation_bias: jittered(base.confirmation_bias, 0.0, 1.0),
            bandwagon_susceptibility: jittered(base.bandwagon_susceptibility, 0.0, 1.0),
            availability_weight: jittered(base.availability_weight, 0.0, 1.0),
            bounded_rationality: jittered(base.bounded_rationality, 0.0, 1.0),
            social_proof_weight: jittered(base.social_proof_weight, 0.0, 1.0),
            framing_sensitivity: jittered(base.framing_sensitivity, 0.0, 1.0),
            risk_aversion: jittered(base.risk_aversion, 0.0, 1.0),
        }
    }

    pub fn len(&self) -> usize {
        self.loss_aversion_lambda.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ancillary tensors the bias pipeline reads. All views are start-of-tick snapshots, so
/// the pipeline is order-independent across agents.
pub struct DecisionContext<'a> {
    /// Current committed choice per agent, -1 for uncommitted.
    pub current_choices: &'a [i32],
    /// Population choice distribution over actions (unnormalized counts are fine).
    pub population_distribution: Option<&'a Array1<f64>>,
    /// Row-normalized peer support per agent per action.
    pub peer_support: Option<&'a Array2<f64>>,
    /// Positive/negative framing valence per action.
    pub framing_valence: Option<&'a Array1<f64>>,
    /// Decayed recent-outcome estimate per agent per action.
    pub recency: Option<&'a Array2<f64>>,
    pub seed: Seed,
    pub tick: Tick,
    /// Absolute index of row 0. Partitioned execution passes sub-matrices; PRNG
    /// streams stay keyed by absolute agent index so partitioning never changes
    /// sampled values.
    pub agent_index_base: u32,
}

/// The vectorized behavioral decision model.
#[derive(Debug, Clone, Copy, Default)]
pub struct BehavioralModel;

impl BehavioralModel {
    // ============================================================================
    // Prospect Theory
    // ============================================================================

    /// Kahneman-Tversky value function: `v(x) = x^α` for gains,
    /// `v(x) = -λ·(-x)^α` for losses, relative to per-agent reference points.
    pub fn value_function(
        &self,
        outcomes: &Array2<f64>,
        reference_points: &Array1<f64>,
        loss_aversion: &Array1<f64>,
        alpha: f64,
    ) -> Array2<f64> {
        let mut values = outcomes.clone();
        for (i, mut row) in values.rows_mut().into_iter().enumerate() {
            let reference = reference_points[i];
            let lambda = loss_aversion[i];
            row.mapv_inplace(|x| {
                let deviation = x - reference;
                if deviation >= 0.0 {
                    deviation.powf(alpha)
                } else {
                    -lambda * (-deviation).powf(alpha)
                }
            });
        }
        values
    }

    /// Prelec probability weighting: `w(p) = exp(-β·(-ln p)^α)`.
    pub fn probability_weight(
        &self,
        probabilities: &Array2<f64>,
        alpha: &Array1<f64>,
        beta: &Array1<f64>,
    ) -> Array2<f64> {
        let mut weighted = probabilities.clone();
        for (i, mut row) in weighted.rows_mut().into_iter().enumerate() {
            let a = alpha[i];
            let b = beta[i];
            row.mapv_inplace(|p| {
                let clamped = p.clamp(EPSILON, 1.0 - EPSILON);
                (-b * (-clamped.ln()).powf(a)).exp()
            });
        }
        weighted
    }

    /// Prospect-theory utility for risky prospects: weighted probability × value.
    pub fn prospect_utility(
        &self,
        outcomes: &Array2<f64>,
        probabilities: &Array2<f64>,
        params: &BehavioralParams,
    ) -> Array2<f64> {
        let values = self.value_function(
            outcomes,
            &params.reference_point,
            &params.loss_aversion_lambda,
            0.88,
        );
        let weights = self.probability_weight(
            probabilities,
            &params.probability_weight_alpha,
            &params.probability_weight_beta,
        );
        weights * values
    }

    // ============================================================================
    // Bias Pipeline
    // ============================================================================

    /// Status-quo bias: boost the current choice column for committed agents.
    pub fn apply_status_quo_bias(
        &self,
        utilities: &mut Array2<f64>,
        current_choices: &[i32],
        strength: &Array1<f64>,
        boost_factor: f64,
    ) {
        let n_actions = utilities.ncols();
        for (i, &choice) in current_choices.iter().enumerate() {
            if choice >= 0 && (choice as usize) < n_actions {
                utilities[[i, choice as usize]] += boost_factor * strength[i];
            }
        }
    }

    /// Bandwagon effect: boost popular options proportionally to the normalized
    /// population distribution and each agent's susceptibility.
    pub fn apply_bandwagon(
        &self,
        utilities: &mut Array2<f64>,
        population_distribution: &Array1<f64>,
        susceptibility: &Array1<f64>,
        intensity_factor: f64,
    ) {
        let total = population_distribution.sum() + EPSILON;
        let boost = population_distribution.mapv(|v| v / total * intensity_factor);
        for (i, mut row) in utilities.rows_mut().into_iter().enumerate() {
            row.scaled_add(susceptibility[i], &boost);
        }
    }

    /// Social proof: add each agent's row-normalized peer support, scaled by the
    /// agent's social-proof weight and a 0.5 damping constant.
    pub fn apply_social_proof(
        &self,
        utilities: &mut Array2<f64>,
        peer_support: &Array2<f64>,
        strength: &Array1<f64>,
    ) {
        for (i, mut row) in utilities.rows_mut().into_iter().enumerate() {
            if strength[i] < 0.01 {
                continue;
            }
            row.scaled_add(strength[i] * 0.5, &peer_support.row(i));
        }
    }

    /// Framing effect: per-action valence scaled by per-agent sensitivity.
    pub fn apply_framing(
        &self,
        utilities: &mut Array2<f64>,
        framing_valence: &Array1<f64>,
        sensitivity: &Array1<f64>,
    ) {
        for (i, mut row) in utilities.rows_mut().into_iter().enumerate() {
            row.scaled_add(sensitivity[i] * 0.2, framing_valence);
        }
    }

    /// Recency bias: add the decayed recent-outcome estimate scaled by the agent's
    /// availability weight and a 0.3 damping constant.
    pub fn apply_recency(
        &self,
        utilities: &mut Array2<f64>,
        recency: &Array2<f64>,
        availability_weight: &Array1<f64>,
    ) {
        for (i, mut row) in utilities.rows_mut().into_iter().enumerate() {
            row.scaled_add(availability_weight[i] * 0.3, &recency.row(i));
        }
    }

    /// Bounded-rationality noise: per-agent Gaussian with σ = bounded_rationality·0.1,
    /// sampled from the agent's `Noise` stream.
    pub fn apply_bounded_rationality(
        &self,
        utilities: &mut Array2<f64>,
        bounded_rationality: &Array1<f64>,
        seed: Seed,
        tick: Tick,
        agent_index_base: u32,
    ) {
        for (i, mut row) in utilities.rows_mut().into_iter().enumerate() {
            let sigma = bounded_rationality[i] * 0.1;
            if sigma <= 0.0 {
                continue;
            }
            let mut stream =
                rng::stream(seed, tick, agent_index_base + i as u32, StageTag::Noise);
            let normal = Normal::new(0.0, sigma).expect("positive sigma");
            row.mapv_inplace(|u| u + normal.sample(&mut stream));
        }
    }

    /// Full pipeline in contract order: status quo → bandwagon → social proof →
    /// framing → recency → bounded-rationality noise.
    pub fn compute_decision_utilities(
        &self,
        base_utilities: &Array2<f64>,
        params: &BehavioralParams,
        ctx: &DecisionContext<'_>,
    ) -> Array2<f64> {
        let mut utilities = base_utilities.clone();

        self.apply_status_quo_bias(
            &mut utilities,
            ctx.current_choices,
            &params.status_quo_strength,
            0.3,
        );
        if let Some(distribution) = ctx.population_distribution {
            self.apply_bandwagon(
                &mut utilities,
                distribution,
                &params.bandwagon_susceptibility,
                0.5,
            );
        }
        if let Some(peer_support) = ctx.peer_support {
            self.apply_social_proof(&mut utilities, peer_support, &params.social_proof_weight);
        }
        if let Some(valence) = ctx.framing_valence {
            self.apply_framing(&mut utilities, valence, &params.framing_sensitivity);
        }
        if let Some(recency) = ctx.recency {
            self.apply_recency(&mut utilities, recency, &params.availability_weight);
        }
        self.apply_bounded_rationality(
            &mut utilities,
            &params.bounded_rationality,
            ctx.seed,
            ctx.tick,
            ctx.agent_index_base,
        );

        utilities
    }

    // ============================================================================
    // Decision Selection
    // ============================================================================

    /// Select actions from utilities. Masked actions are excluded. Deterministic mode
    /// returns the argmax (lowest index wins ties) with a one-hot probability row;
    /// otherwise each agent samples from its softmax via the `Decide` stream.
    pub fn make_decisions(
        &self,
        utilities: &Array2<f64>,
        masks: &Array2<bool>,
        temperature: f64,
        deterministic: bool,
        seed: Seed,
        tick: Tick,
        agent_index_base: u32,
    ) -> (Vec<usize>, Array2<f64>) {
        let (n, a) = utilities.dim();
        let mut probs = Array2::zeros((n, a));
        let mut choices = vec![0usize; n];

        for i in 0..n {
            let row = utilities.row(i);
            let mask = masks.row(i);

            // Softmax over valid entries with max-subtraction for stability.
            let max = row
                .iter()
                .zip(mask.iter())
                .filter(|(_, ok)| **ok)
                .map(|(u, _)| *u)
                .fold(f64::NEG_INFINITY, f64::max);

            if max == f64::NEG_INFINITY {
                // Nothing valid; leave probabilities zero and pick index 0.
                choices[i] = 0;
                continue;
            }

            if deterministic {
                let mut best = 0usize;
                let mut best_utility = f64::NEG_INFINITY;
                for (j, (u, ok)) in row.iter().zip(mask.iter()).enumerate() {
                    if *ok && *u > best_utility {
                        best_utility = *u;
                        best = j;
                    }
                }
                choices[i] = best;
                probs[[i, best]] = 1.0;
                continue;
            }

            let temp = temperature + EPSILON;
            let mut denom = 0.0;
            for (j, (u, ok)) in row.iter().zip(mask.iter()).enumerate() {
                if *ok {
                    let e = ((u - max) / temp).exp();
                    probs[[i, j]] = e;
                    denom += e;
                }
            }
            let mut prob_row = probs.row_mut(i);
            prob_row.mapv_inplace(|p| p / (denom + EPSILON));

            let mut stream =
                rng::stream(seed, tick, agent_index_base + i as u32, StageTag::Decide);
            let draw: f64 = stream.random();
            let mut cumulative = 0.0;
            let mut chosen = None;
            let mut last_valid = 0;
            for (j, p) in prob_row.iter().enumerate() {
                if *p > 0.0 {
                    last_valid = j;
                }
                cumulative += *p;
                if chosen.is_none() && draw < cumulative {
                    chosen = Some(j);
                }
            }
            // Float rounding can leave the draw past the final cumulative step; land
            // on the last valid action in that case.
            choices[i] = chosen.unwrap_or(last_valid);
        }

        (choices, probs)
    }

    // ============================================================================
    // Belief Updates
    // ============================================================================

    /// Update belief rows with anchoring and confirmation bias, then re-normalize to
    /// probability rows. Confirming evidence is inflated, disconfirming discounted.
    pub fn update_beliefs(
        &self,
        current_beliefs: &Array2<f64>,
        new_evidence: &Array2<f64>,
        evidence_strength: &Array1<f64>,
        anchoring: &Array1<f64>,
        confirmation: &Array1<f64>,
    ) -> Array2<f64> {
        let (n, k) = current_beliefs.dim();
        let mut adjusted = new_evidence.clone();

        for i in 0..n {
            let best = current_beliefs
                .row(i)
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(j, _)| j)
                .unwrap_or(0);
            for j in 0..k {
                if j == best {
                    adjusted[[i, j]] *= 1.0 + confirmation[i] * 0.3;
                } else {
                    adjusted[[i, j]] *= 1.0 - confirmation[i] * 0.2;
                }
            }
        }

        let mut updated = Array2::zeros((n, k));
        for i in 0..n {
            let w = (evidence_strength[i] * (1.0 - anchoring[i])).clamp(0.0, 1.0);
            for j in 0..k {
                updated[[i, j]] =
                    current_beliefs[[i, j]] * (1.0 - w) + adjusted[[i, j]] * w;
            }
        }

        updated.mapv_inplace(|v| v.max(0.0));
        for mut row in updated.rows_mut() {
            let sum = row.sum();
            if sum > 0.0 {
                row.mapv_inplace(|v| v / sum);
            }
        }
        updated
    }
}

// ================================================================================================
// Social Influence Helpers
// ================================================================================================

/// Row-normalized peer support matrix: per agent, the influence-weighted vote share of
/// its neighbors' committed choices.
pub fn peer_support_matrix(
    choices: &[i32],
    neighbors: &[NeighborList],
    n_actions: usize,
) -> Array2<f64> {
    let n = choices.len();
    let mut support = Array2::zeros((n, n_actions));

    for (i, edges) in neighbors.iter().enumerate() {
        let mut total = 0.0;
        for edge in edges {
            let peer = edge.target.index();
            if peer >= n {
                continue;
            }
            let choice = choices[peer];
            if choice >= 0 && (choice as usize) < n_actions {
                let influence = edge.influence_strength();
                support[[i, choice as usize]] += influence;
                total += influence;
            }
        }
        if total > 0.0 {
            let mut row = support.row_mut(i);
            row.mapv_inplace(|v| v / total);
        }
    }

    support
}

/// Influence-weighted average of neighbor state rows.
pub fn compute_social_influence(
    agent_states: &Array2<f64>,
    neighbors: &[NeighborList],
) -> Array2<f64> {
    let (n, k) = agent_states.dim();
    let mut influence = Array2::zeros((n, k));

    for (i, edges) in neighbors.iter().enumerate() {
        let mut total = 0.0;
        for edge in edges {
            let peer = edge.target.index();
            if peer >= n {
                continue;
            }
            let w = edge.influence_strength();
            influence
                .row_mut(i)
                .scaled_add(w, &agent_states.row(peer));
            total += w;
        }
        if total > 0.0 {
            let mut row = influence.row_mut(i);
            row.mapv_inplace(|v| v / total);
        }
    }

    influence
}

/// Detect agents inside an information cascade: committed agents whose committed
/// neighbors overwhelmingly (≥ threshold) share their choice.
pub fn detect_information_cascade(
    choices: &[i32],
    neighbors: &[NeighborList],
    threshold: f64,
) -> Vec<bool> {
    choices
        .iter()
        .enumerate()
        .map(|(i, &choice)| {
            if choice < 0 {
                return false;
            }
            let mut same = 0usize;
            let mut committed = 0usize;
            for edge in &neighbors[i] {
                let peer = edge.target.index();
                if peer >= choices.len() {
                    continue;
                }
                let peer_choice = choices[peer];
                if peer_choice >= 0 {
                    committed += 1;
                    if peer_choice == choice {
                        same += 1;
                    }
                }
            }
            committed > 0 && (same as f64 / committed as f64) >= threshold
        })
        .collect()
}

/// Decayed recent-outcome estimate per agent per action, from the circular buffers.
/// The most recent slot carries the highest weight.
pub fn recency_adjustment(
    recent_actions: &Array2<i32>,
    recent_rewards: &Array2<f64>,
    n_actions: usize,
    decay_factor: f64,
) -> Array2<f64> {
    let (n, history) = recent_actions.dim();
    let mut adjustment = Array2::zeros((n, n_actions));
    if history == 0 {
        return adjustment;
    }

    let time_weights: Vec<f64> = (0..history)
        .map(|slot| decay_factor.powi((history - 1 - slot) as i32))
        .collect();
    let weight_sum: f64 = time_weights.iter().sum::<f64>() + EPSILON;

    for i in 0..n {
        for slot in 0..history {
            let action = recent_actions[[i, slot]];
            if action >= 0 && (action as usize) < n_actions {
                adjustment[[i, action as usize]] +=
                    recent_rewards[[i, slot]] * time_weights[slot];
            }
        }
    }
    adjustment.mapv_inplace(|v| v / weight_sum);
    adjustment
}

/// Mean over valid entries per column, used for population distributions.
pub fn choice_distribution(choices: &[i32], n_actions: usize) -> Array1<f64> {
    let mut distribution = Array1::zeros(n_actions);
    for &choice in choices {
        if choice >= 0 && (choice as usize) < n_actions {
            distribution[choice as usize] += 1.0;
        }
    }
    distribution
}

#[cfg(test)]
mod tests {
    use crate::engine::agent::{SocialEdge, SocialEdgeType};
    use crate::types::AgentId;

    use super::*;

    fn params(n: usize) -> BehavioralParams {
        BehavioralParams::generate(Seed(7), n, PopulationProfile::Average)
    }

    #[test]
    fn value_function_penalizes_losses() {
        let model = BehavioralModel;
        let outcomes = Array2::from_shape_vec((1, 2), vec![1.0, -1.0]).unwrap();
        let reference = Array1::zeros(1);
        let lambda = Array1::from_elem(1, 2.25);

        let values = model.value_function(&outcomes, &reference, &lambda, 0.88);
        assert!((values[[0, 0]] - 1.0).abs() < 1e-12);
        assert!((values[[0, 1]] + 2.25).abs() < 1e-12);
        // Loss looms larger than the equivalent gain.
        assert!(values[[0, 1]].abs() > values[[0, 0]].abs());
    }

    #[test]
    fn prelec_weighting_overweights_small_probabilities() {
        let model = BehavioralModel;
        let probs = Array2::from_shape_vec((1, 2), vec![0.01, 0.99]).unwrap();
        let alpha = Array1::from_elem(1, 0.65);
        let beta = Array1::from_elem(1, 0.60);

        let weighted = model.probability_weight(&probs, &alpha, &beta);
        assert!(weighted[[0, 0]] > 0.01);
        assert!(weighted[[0, 1]] < 0.99);
    }

    #[test]
    fn prospect_utility_overweights_long_shots_and_penalizes_losses() {
        let model = BehavioralModel;
        let fixed = BehavioralParams {
            loss_aversion_lambda: Array1::from_elem(1, 2.25),
            reference_point: Array1::zeros(1),
            probability_weight_alpha: Array1::from_elem(1, 0.65),
            probability_weight_beta: Array1::from_elem(1, 0.60),
            status_quo_strength: Array1::zeros(1),
            anchoring_strength: Array1::zeros(1),
            confirmation_bias: Array1::zeros(1),
            bandwagon_susceptibility: Array1::zeros(1),
            availability_weight: Array1::zeros(1),
            bounded_rationality: Array1::zeros(1),
            social_proof_weight: Array1::zeros(1),
            framing_sensitivity: Array1::zeros(1),
            risk_aversion: Array1::from_elem(1, 0.5),
        };

        // A risky gain and the mirror-image loss at the same small probability.
        let outcomes = Array2::from_shape_vec((1, 2), vec![5.0, -5.0]).unwrap();
        let probabilities = Array2::from_shape_vec((1, 2), vec![0.05, 0.05]).unwrap();
        let utility = model.prospect_utility(&outcomes, &probabilities, &fixed);

        // Prelec weighting inflates the 5% long shot well past its raw probability.
        let raw_expected = 0.05 * 5.0f64.powf(0.88);
        assert!(utility[[0, 0]] > raw_expected);
        // The equivalent loss outweighs the gain by the loss-aversion factor.
        assert!(utility[[0, 1]] < 0.0);
        assert!(utility[[0, 1]].abs() > utility[[0, 0]]);
    }

    #[test]
    fn status_quo_bias_only_boosts_committed_agents() {
        let model = BehavioralModel;
        let mut utilities = Array2::zeros((2, 3));
        let strength = Array1::from_elem(2, 1.0);

        model.apply_status_quo_bias(&mut utilities, &[1, -1], &strength, 0.3);
        assert!((utilities[[0, 1]] - 0.3).abs() < 1e-12);
        assert_eq!(utilities.row(1).sum(), 0.0);
    }

    #[test]
    fn deterministic_decisions_are_argmax_with_one_hot_probs() {
        let model = BehavioralModel;
        let utilities = Array2::from_shape_vec((1, 3), vec![0.1, 0.9, 0.5]).unwrap();
        let masks = Array2::from_elem((1, 3), true);

        let (choices, probs) =
            model.make_decisions(&utilities, &masks, 1.0, true, Seed(1), Tick(1), 0);
        assert_eq!(choices, vec![1]);
        assert!((probs[[0, 1]] - 1.0).abs() < 1e-12);
        assert_eq!(probs[[0, 0]], 0.0);
    }

    #[test]
    fn sampled_decisions_respect_mask_and_reproduce() {
        let model = BehavioralModel;
        let utilities = Array2::from_shape_vec((4, 3), vec![0.5; 12]).unwrap();
        let mut masks = Array2::from_elem((4, 3), true);
        masks[[0, 2]] = false;

        let (a, _) = model.make_decisions(&utilities, &masks, 0.7, false, Seed(3), Tick(9), 0);
        let (b, _) = model.make_decisions(&utilities, &masks, 0.7, false, Seed(3), Tick(9), 0);
        assert_eq!(a, b);
        assert_ne!(a[0], 2, "masked action must not be sampled");
    }

    #[test]
    fn belief_update_normalizes_rows() {
        let model = BehavioralModel;
        let beliefs = Array2::from_shape_vec((1, 2), vec![0.7, 0.3]).unwrap();
        let evidence = Array2::from_shape_vec((1, 2), vec![0.2, 0.8]).unwrap();
        let strength = Array1::from_elem(1, 0.9);
        let anchoring = Array1::from_elem(1, 0.2);
        let confirmation = Array1::from_elem(1, 0.4);

        let updated =
            model.update_beliefs(&beliefs, &evidence, &strength, &anchoring, &confirmation);
        assert!((updated.row(0).sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn peer_support_rows_are_normalized() {
        let neighbors = vec![
            NeighborList::from_vec(vec![
                SocialEdge {
                    target: AgentId(1),
                    edge_type: SocialEdgeType::Friend,
                    weight: 1.0,
                    trust: 1.0,
                    frequency: 1.0,
                },
                SocialEdge {
                    target: AgentId(2),
                    edge_type: SocialEdgeType::Colleague,
                    weight: 0.5,
                    trust: 1.0,
                    frequency: 1.0,
                },
            ]),
            NeighborList::new(),
            NeighborList::new(),
        ];
        let support = peer_support_matrix(&[-1, 0, 1], &neighbors, 2);
        assert!((support.row(0).sum() - 1.0).abs() < 1e-12);
        assert!(support[[0, 0]] > support[[0, 1]]);
    }

    #[test]
    fn cascade_detection_requires_majority_agreement() {
        let edge = |to: u32| SocialEdge {
            target: AgentId(to),
            edge_type: SocialEdgeType::Friend,
            weight: 1.0,
            trust: 1.0,
            frequency: 1.0,
        };
        let neighbors = vec![
            NeighborList::from_vec(vec![edge(1), edge(2)]),
            NeighborList::from_vec(vec![edge(0)]),
            NeighborList::from_vec(vec![edge(0)]),
        ];
        let flags = detect_information_cascade(&[0, 0, 0], &neighbors, 0.6);
        assert_eq!(flags, vec![true, true, true]);

        let flags = detect_information_cascade(&[0, 1, -1], &neighbors, 0.6);
        assert!(!flags[0]);
    }

    #[test]
    fn generated_params_are_deterministic_and_clipped() {
        let a = params(100);
        let b = params(100);
        assert_eq!(a, b);
        assert!(a.loss_aversion_lambda.iter().all(|&l| (1.0..=4.0).contains(&l)));
        assert!(a
            .probability_weight_alpha
            .iter()
            .all(|&v| (0.3..=1.0).contains(&v)));
        assert!(a.bounded_rationality.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn recency_adjustment_weights_recent_slots_higher() {
        // Agent took action 0 long ago (reward 1.0) and action 1 recently (reward 1.0).
        let actions = Array2::from_shape_vec((1, 3), vec![0, -1, 1]).unwrap();
        let rewards = Array2::from_shape_vec((1, 3), vec![1.0, 0.0, 1.0]).unwrap();
        let adjustment = recency_adjustment(&actions, &rewards, 2, 0.8);
        assert!(adjustment[[0, 1]] > adjustment[[0, 0]]);
    }
}
