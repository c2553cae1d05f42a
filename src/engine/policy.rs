// ================================================================================================
// Decision Policies
// ================================================================================================

pub mod neural;

use ndarray::Array2;

use crate::{
    engine::behavior::{BehavioralModel, BehavioralParams, DecisionContext},
    error::{EngineError, WorldlineResult},
};

/// The decision stage's output: one choice per agent plus the probability rows the
/// policy assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct Decisions {
    pub choices: Vec<usize>,
    pub probabilities: Array2<f64>,
}

/// Inputs shared by every policy at the decide stage.
pub struct PolicyContext<'a> {
    pub params: &'a BehavioralParams,
    pub decision: DecisionContext<'a>,
    /// Softmax temperature; ignored in deterministic mode.
    pub temperature: f64,
    /// Argmax selection with one-hot probabilities when set.
    pub deterministic: bool,
}

/// A pluggable decision policy over `(N×A)` utility matrices.
///
/// Policies must be pure functions of their inputs and the tick-local PRNG streams
/// carried in the context; no internal mutable state survives between ticks.
pub trait DecisionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn decide(
        &self,
        base_utilities: &Array2<f64>,
        masks: &Array2<bool>,
        ctx: &PolicyContext<'_>,
    ) -> WorldlineResult<Decisions>;
}

/// Default policy: the behavioral-economics bias pipeline followed by softmax/argmax
/// selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct BehavioralPolicy {
    model: BehavioralModel,
}

impl DecisionPolicy for BehavioralPolicy {
    fn name(&self) -> &'static str {
        "behavioral"
    }

    fn decide(
        &self,
        base_utilities: &Array2<f64>,
        masks: &Array2<bool>,
        ctx: &PolicyContext<'_>,
    ) -> WorldlineResult<Decisions> {
        if base_utilities.dim() != masks.dim() {
            return Err(EngineError::PolicyShape(format!(
                "utilities {:?} vs masks {:?}",
                base_utilities.dim(),
                masks.dim()
            ))
            .into());
        }

        let utilities =
            self.model
                .compute_decision_utilities(base_utilities, ctx.params, &ctx.decision);
        let (choices, probabilities) = self.model.make_decisions(
            &utilities,
            masks,
            ctx.temperature,
            ctx.deterministic,
            ctx.decision.seed,
            ctx.decision.tick,
            ctx.decision.agent_index_base,
        );
        Ok(Decisions {
            choices,
            probabilities,
        })
    }
}
