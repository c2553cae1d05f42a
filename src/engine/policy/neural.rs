// ================================================================================================
// Neural Policy (Actor-Critic + Offline PPO)
// ================================================================================================
//
// A small dense actor-critic network over `ndarray`, pluggable behind `DecisionPolicy`.
// Training runs offline against recorded rollouts; it never executes inside the tick
// loop of a serving simulation (serving runs require `llm_calls_in_tick_loop = 0`).

use ndarray::{Array1, Array2, Axis};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::{
    engine::policy::{DecisionPolicy, Decisions, PolicyContext},
    engine::rng::{self, StageTag},
    error::{EngineError, WorldlineResult},
};

const EPSILON: f64 = 1e-10;

fn xavier(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f64> {
    let bound = (6.0 / (rows + cols) as f64).sqrt();
    Array2::from_shape_fn((rows, cols), |_| (rng.random::<f64>() * 2.0 - 1.0) * bound)
}

fn softmax_rows(logits: &Array2<f64>) -> Array2<f64> {
    let mut probs = logits.clone();
    for mut row in probs.rows_mut() {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum() + EPSILON;
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

/// Shared-backbone actor-critic network: `obs → tanh(hidden) → {actor logits, value}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorCriticNetwork {
    pub obs_dim: usize,
    pub hidden_dim: usize,
    pub action_dim: usize,

    w1: Array2<f64>,
    b1: Array1<f64>,
    w_actor: Array2<f64>,
    b_actor: Array1<f64>,
    w_critic: Array2<f64>,
    b_critic: f64,
}

/// Forward-pass cache reused by backprop.
struct Forward {
    hidden: Array2<f64>,
    logits: Array2<f64>,
    probs: Array2<f64>,
    values: Array1<f64>,
}

impl ActorCriticNetwork {
    pub fn new(obs_dim: usize, hidden_dim: usize, action_dim: usize, init_seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(init_seed);
        Self {
            obs_dim,
            hidden_dim,
            action_dim,
            w1: xavier(obs_dim, hidden_dim, &mut rng),
            b1: Array1::zeros(hidden_dim),
            w_actor: xavier(hidden_dim, action_dim, &mut rng),
            b_actor: Array1::zeros(action_dim),
            w_critic: xavier(hidden_dim, 1, &mut rng),
            b_critic: 0.0,
        }
    }

    fn forward(&self, observations: &Array2<f64>) -> Forward {
        let mut hidden = observations.dot(&self.w1);
        for mut row in hidden.rows_mut() {
            row += &self.b1;
        }
        hidden.mapv_inplace(f64::tanh);

        let mut logits = hidden.dot(&self.w_actor);
        for mut row in logits.rows_mut() {
            row += &self.b_actor;
        }

        let values = hidden.dot(&self.w_critic).index_axis(Axis(1), 0).to_owned()
            + self.b_critic;
        let probs = softmax_rows(&logits);
        Forward {
            hidden,
            logits,
            probs,
            values,
        }
    }

    /// Inference interface: action probabilities and state values for a batch.
    pub fn act(&self, observations: &Array2<f64>) -> WorldlineResult<(Array2<f64>, Array1<f64>)> {
        if observations.ncols() != self.obs_dim {
            return Err(EngineError::PolicyShape(format!(
                "observation dim {} does not match network obs_dim {}",
                observations.ncols(),
                self.obs_dim
            ))
            .into());
        }
        let fwd = self.forward(observations);
        Ok((fwd.probs, fwd.values))
    }
}

/// Neural policy wrapping an actor-critic network. Base utilities are the observation
/// features; masked actions never receive probability mass.
pub struct ActorCriticPolicy {
    pub network: ActorCriticNetwork,
}

impl DecisionPolicy for ActorCriticPolicy {
    fn name(&self) -> &'static str {
        "actor_critic"
    }

    fn decide(
        &self,
        base_utilities: &Array2<f64>,
        masks: &Array2<bool>,
        ctx: &PolicyContext<'_>,
    ) -> WorldlineResult<Decisions> {
        let (raw_probs, _values) = self.network.act(base_utilities)?;
        let (n, a) = raw_probs.dim();

        let mut probabilities = raw_probs;
        for i in 0..n {
            let mut sum = 0.0;
            for j in 0..a {
                if !masks[[i, j]] {
                    probabilities[[i, j]] = 0.0;
                }
                sum += probabilities[[i, j]];
            }
            if sum > 0.0 {
                for j in 0..a {
                    probabilities[[i, j]] /= sum;
                }
            }
        }

        let mut choices = vec![0usize; n];
        for i in 0..n {
            if ctx.deterministic {
                let mut best = 0usize;
                let mut best_p = f64::NEG_INFINITY;
                for j in 0..a {
                    if probabilities[[i, j]] > best_p {
                        best_p = probabilities[[i, j]];
                        best = j;
                    }
                }
                choices[i] = best;
            } else {
                let mut stream = rng::stream(
                    ctx.decision.seed,
                    ctx.decision.tick,
                    ctx.decision.agent_index_base + i as u32,
                    StageTag::Decide,
                );
                let draw: f64 = stream.random();
                let mut cumulative = 0.0;
                let mut chosen = None;
                let mut last_valid = 0;
                for j in 0..a {
                    if probabilities[[i, j]] > 0.0 {
                        last_valid = j;
                    }
                    cumulative += probabilities[[i, j]];
                    if chosen.is_none() && draw < cumulative {
                        chosen = Some(j);
                    }
                }
                choices[i] = chosen.unwrap_or(last_valid);
            }
        }

        Ok(Decisions {
            choices,
            probabilities,
        })
    }
}

// ================================================================================================
// PPO (offline)
// ================================================================================================

/// PPO hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PpoConfig {
    pub clip_ratio: f64,
    /// Clip the value-function update to this delta when set.
    pub value_clip: Option<f64>,
    pub value_coef: f64,
    pub entropy_coef: f64,
    pub gamma: f64,
    pub lambda: f64,
    pub learning_rate: f64,
    pub epochs: usize,
    /// Early-stop threshold on the approximate KL between old and new policies.
    pub target_kl: f64,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            clip_ratio: 0.2,
            value_clip: Some(0.2),
            value_coef: 0.5,
            entropy_coef: 0.01,
            gamma: 0.99,
            lambda: 0.95,
            learning_rate: 3e-3,
            epochs: 4,
            target_kl: 0.015,
        }
    }
}

/// A recorded rollout for offline training. `values` and `log_probs` are the ones the
/// behavior policy produced at collection time.
#[derive(Debug, Clone)]
pub struct Rollout {
    pub observations: Array2<f64>,
    pub actions: Vec<usize>,
    pub rewards: Vec<f64>,
    pub values: Vec<f64>,
    pub log_probs: Vec<f64>,
    pub dones: Vec<bool>,
}

/// Training statistics for one `update` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PpoStats {
    pub policy_loss: f64,
    pub value_loss: f64,
    pub entropy: f64,
    pub approx_kl: f64,
    pub epochs_run: usize,
    pub stopped_early: bool,
}

/// Generalized advantage estimation over a sequential rollout.
pub fn compute_gae(rollout: &Rollout, gamma: f64, lambda: f64) -> (Vec<f64>, Vec<f64>) {
    let n = rollout.rewards.len();
    let mut advantages = vec![0.0; n];
    let mut last_gae = 0.0;
    for t in (0..n).rev() {
        let next_value = if t + 1 < n && !rollout.dones[t] {
            rollout.values[t + 1]
        } else {
            0.0
        };
        let delta = rollout.rewards[t] + gamma * next_value - rollout.values[t];
        last_gae = if rollout.dones[t] {
            delta
        } else {
            delta + gamma * lambda * last_gae
        };
        advantages[t] = last_gae;
    }
    let returns: Vec<f64> = advantages
        .iter()
        .zip(rollout.values.iter())
        .map(|(a, v)| a + v)
        .collect();
    (advantages, returns)
}

/// Offline PPO trainer with manual backprop through the two-layer network.
pub struct PpoTrainer {
    pub config: PpoConfig,
}

impl PpoTrainer {
    pub fn new(config: PpoConfig) -> Self {
        Self { config }
    }

    /// One PPO update over the rollout: clipped surrogate objective, (optionally
    /// clipped) value loss, entropy bonus, approx-KL early stopping.
    pub fn update(
        &self,
        network: &mut ActorCriticNetwork,
        rollout: &Rollout,
    ) -> WorldlineResult<PpoStats> {
        let n = rollout.actions.len();
        if n == 0 || rollout.observations.nrows() != n {
            return Err(EngineError::PolicyShape("empty or ragged rollout".into()).into());
        }

        let cfg = &self.config;
        let (mut advantages, returns) = compute_gae(rollout, cfg.gamma, cfg.lambda);

        // Normalize advantages.
        let mean = advantages.iter().sum::<f64>() / n as f64;
        let var = advantages.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n as f64;
        let std = var.sqrt() + 1e-8;
        for a in advantages.iter_mut() {
            *a = (*a - mean) / std;
        }

        let mut stats = PpoStats {
            policy_loss: 0.0,
            value_loss: 0.0,
            entropy: 0.0,
            approx_kl: 0.0,
            epochs_run: 0,
            stopped_early: false,
        };

        for _epoch in 0..cfg.epochs {
            let fwd = network.forward(&rollout.observations);

            // Per-sample gradient of the loss w.r.t. logits and values.
            let mut d_logits = Array2::zeros(fwd.logits.dim());
            let mut d_values = Array1::zeros(n);
            let mut policy_loss = 0.0;
            let mut value_loss = 0.0;
            let mut entropy_total = 0.0;
            let mut kl_total = 0.0;

            for i in 0..n {
                let action = rollout.actions[i];
                let probs = fwd.probs.row(i);
                let log_p_new = (probs[action] + EPSILON).ln();
                let log_p_old = rollout.log_probs[i];
                let ratio = (log_p_new - log_p_old).exp();
                let advantage = advantages[i];

                kl_total += log_p_old - log_p_new;

                let unclipped = ratio * advantage;
                let clipped =
                    ratio.clamp(1.0 - cfg.clip_ratio, 1.0 + cfg.clip_ratio) * advantage;
                policy_loss -= unclipped.min(clipped);

                // Gradient flows only through the unclipped branch when it is active.
                let d_obj_d_logp = if unclipped <= clipped {
                    ratio * advantage
                } else {
                    0.0
                };

                let entropy: f64 = -probs
                    .iter()
                    .map(|&p| if p > EPSILON { p * p.ln() } else { 0.0 })
                    .sum::<f64>();
                entropy_total += entropy;

                for j in 0..network.action_dim {
                    let indicator = if j == action { 1.0 } else { 0.0 };
                    // d(-surrogate)/dlogit + entropy bonus gradient.
                    let d_policy = -d_obj_d_logp * (indicator - probs[j]);
                    let p = probs[j];
                    let d_entropy = if p > EPSILON {
                        -p * (p.ln() + entropy)
                    } else {
                        0.0
                    };
                    d_logits[[i, j]] = (d_policy - cfg.entropy_coef * d_entropy) / n as f64;
                }

                // Value loss, optionally clipped around the rollout values.
                let v_new = fwd.values[i];
                let v_target = returns[i];
                let v_used = match cfg.value_clip {
                    Some(clip) => {
                        let v_old = rollout.values[i];
                        let v_clipped = v_old + (v_new - v_old).clamp(-clip, clip);
                        let unclipped_err = (v_new - v_target).powi(2);
                        let clipped_err = (v_clipped - v_target).powi(2);
                        if unclipped_err >= clipped_err {
                            v_new
                        } else {
                            v_clipped
                        }
                    }
                    None => v_new,
                };
                value_loss += 0.5 * (v_used - v_target).powi(2);
                d_values[i] = cfg.value_coef * (v_used - v_target) / n as f64;
            }

            let approx_kl = kl_total / n as f64;
            stats.policy_loss = policy_loss / n as f64;
            stats.value_loss = value_loss / n as f64;
            stats.entropy = entropy_total / n as f64;
            stats.approx_kl = approx_kl;
            stats.epochs_run += 1;

            if approx_kl > 1.5 * cfg.target_kl {
                stats.stopped_early = true;
                break;
            }

            // Backprop into parameters.
            let d_w_actor = fwd.hidden.t().dot(&d_logits);
            let d_b_actor = d_logits.sum_axis(Axis(0));

            let d_values_col = d_values.clone().insert_axis(Axis(1));
            let d_w_critic = fwd.hidden.t().dot(&d_values_col);
            let d_b_critic = d_values.sum();

            // Through the shared hidden layer (tanh backward).
            let mut d_hidden =
                d_logits.dot(&network.w_actor.t()) + d_values_col.dot(&network.w_critic.t());
            d_hidden
                .iter_mut()
                .zip(fwd.hidden.iter())
                .for_each(|(g, h)| *g *= 1.0 - h * h);

            let d_w1 = rollout.observations.t().dot(&d_hidden);
            let d_b1 = d_hidden.sum_axis(Axis(0));

            let lr = cfg.learning_rate;
            network.w_actor.scaled_add(-lr, &d_w_actor);
            network.b_actor.scaled_add(-lr, &d_b_actor);
            network.w_critic.scaled_add(-lr, &d_w_critic);
            network.b_critic -= lr * d_b_critic;
            network.w1.scaled_add(-lr, &d_w1);
            network.b1.scaled_add(-lr, &d_b1);
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_rollout(network: &ActorCriticNetwork, n: usize) -> Rollout {
        // Reward action 0 everywhere; the policy should move toward it.
        let observations = Array2::from_shape_fn((n, network.obs_dim), |(i, j)| {
            ((i * 7 + j * 3) % 10) as f64 / 10.0
        });
        let (probs, values) = network.act(&observations).unwrap();
        let actions: Vec<usize> = (0..n).map(|i| i % network.action_dim).collect();
        let rewards: Vec<f64> = actions
            .iter()
            .map(|&a| if a == 0 { 1.0 } else { -0.2 })
            .collect();
        let log_probs: Vec<f64> = actions
            .iter()
            .enumerate()
            .map(|(i, &a)| (probs[[i, a]] + 1e-10).ln())
            .collect();
        Rollout {
            observations,
            actions,
            rewards,
            values: values.to_vec(),
            log_probs,
            dones: (0..n).map(|i| i == n - 1).collect(),
        }
    }

    #[test]
    fn gae_discounts_future_rewards() {
        let rollout = Rollout {
            observations: Array2::zeros((3, 2)),
            actions: vec![0, 0, 0],
            rewards: vec![0.0, 0.0, 1.0],
            values: vec![0.0, 0.0, 0.0],
            log_probs: vec![0.0, 0.0, 0.0],
            dones: vec![false, false, true],
        };
        let (advantages, returns) = compute_gae(&rollout, 0.99, 0.95);
        assert!(advantages[0] < advantages[2]);
        assert!((returns[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn network_act_shapes_match() {
        let network = ActorCriticNetwork::new(4, 16, 3, 7);
        let obs = Array2::zeros((5, 4));
        let (probs, values) = network.act(&obs).unwrap();
        assert_eq!(probs.dim(), (5, 3));
        assert_eq!(values.len(), 5);
        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
        assert!(network.act(&Array2::zeros((5, 3))).is_err());
    }

    #[test]
    fn ppo_update_moves_policy_toward_rewarded_action() {
        let mut network = ActorCriticNetwork::new(4, 16, 2, 3);
        let trainer = PpoTrainer::new(PpoConfig {
            epochs: 1,
            target_kl: f64::INFINITY,
            ..PpoConfig::default()
        });

        let obs = Array2::from_elem((1, 4), 0.5);
        let before = network.act(&obs).unwrap().0[[0, 0]];

        for _ in 0..20 {
            let rollout = toy_rollout(&network, 32);
            trainer.update(&mut network, &rollout).unwrap();
        }

        let after = network.act(&obs).unwrap().0[[0, 0]];
        assert!(
            after > before,
            "probability of rewarded action should increase: {before} -> {after}"
        );
    }

    #[test]
    fn ppo_training_is_deterministic() {
        let run = || {
            let mut network = ActorCriticNetwork::new(4, 8, 2, 5);
            let trainer = PpoTrainer::new(PpoConfig::default());
            let rollout = toy_rollout(&network, 16);
            trainer.update(&mut network, &rollout).unwrap()
        };
        assert_eq!(run(), run());
    }
}
