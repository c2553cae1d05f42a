// ================================================================================================
// Nodes, Edges, Interventions, Patches
// ================================================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    engine::world::{EventScript, ScenarioPatch},
    types::{EdgeId, NodeId, PatchId, ProjectId, RunId, TenantId},
};

/// Three-tier confidence band over an aggregated probability.
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
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    /// Band a reliability-adjusted score: high ≥ 0.8, medium ≥ 0.6, low otherwise.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Self::High
        } else if score >= 0.6 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Element-wise operation applied by a variable delta.
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
pub enum DeltaOp {
    Add,
    Mul,
    Set,
}

/// One variable's change in an intervention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VariableChange {
    pub op: DeltaOp,
    pub value: f64,
}

impl VariableChange {
    pub fn add(value: f64) -> Self {
        Self {
            op: DeltaOp::Add,
            value,
        }
    }

    pub fn set(value: f64) -> Self {
        Self {
            op: DeltaOp::Set,
            value,
        }
    }

    pub fn apply(&self, current: f64) -> f64 {
        match self.op {
            DeltaOp::Add => current + self.value,
            DeltaOp::Mul => current * self.value,
            DeltaOp::Set => self.value,
        }
    }
}

/// The intervention stored on an edge. NL queries must be translated into one of the
/// two concrete forms before the child node is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intervention {
    VariableDelta {
        changes: BTreeMap<String, VariableChange>,
    },
    EventScript {
        scripts: Vec<EventScript>,
    },
    NlQuery {
        query: String,
    },
}

impl Intervention {
    pub fn variable_deltas(changes: BTreeMap<String, VariableChange>) -> Self {
        Self::VariableDelta { changes }
    }

    pub fn is_nl(&self) -> bool {
        matches!(self, Self::NlQuery { .. })
    }
}

/// Human-facing edge explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeExplanation {
    pub short_label: String,
    pub explanation_text: String,
}

impl EdgeExplanation {
    pub fn from_text(text: &str) -> Self {
        let short_label = if text.chars().count() > 50 {
            text.chars().take(50).collect()
        } else {
            text.to_string()
        };
        Self {
            short_label,
            explanation_text: text.to_string(),
        }
    }
}

/// Directed link parent→child describing the intervention that produced the child.
/// Immutable after commit: never re-targeted, intervention never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub parent_id: NodeId,
    pub child_id: NodeId,
    pub intervention: Intervention,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<EdgeExplanation>,
    pub created_at: DateTime<Utc>,
}

/// Derived environment modifications: applied to the parent's resolved scenario to
/// produce the child's initial world. Immutable after fork.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    pub id: PatchId,
    pub edge_id: EdgeId,
    pub changes: BTreeMap<String, VariableChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_scripts: Vec<EventScript>,
}

impl NodePatch {
    /// Apply to a parent scenario, producing the child scenario. The parent value is
    /// left untouched.
    pub fn apply(&self, parent: &ScenarioPatch) -> ScenarioPatch {
        let mut child = parent.clone();
        for (variable, change) in &self.changes {
            let current = child.variables.get(variable).copied().unwrap_or(0.0);
            child.variables.insert(variable.clone(), change.apply(current));
        }
        child.event_scripts.extend(self.event_scripts.iter().cloned());
        child
    }
}

/// Per-outcome-key aggregate statistics across completed runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeStat {
    pub mean: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
    pub sample_count: usize,
}

/// Deterministic fold of a node's completed runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedOutcome {
    pub run_count: usize,
    pub statistics: BTreeMap<String, OutcomeStat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_outcome: Option<String>,
    /// Mean final environment variables, used as the base for child forks.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_state: BTreeMap<String, f64>,
}

/// A scenario state in the Universe Map DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub project_id: ProjectId,
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    pub depth: u32,
    pub label: String,
    pub is_baseline: bool,

    /// Fully resolved scenario for this node (`scenario_patch_ref`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_patch: Option<ScenarioPatch>,

    pub run_refs: Vec<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_outcome: Option<AggregatedOutcome>,

    pub probability: f64,
    pub cumulative_probability: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<ConfidenceTier>,

    pub is_stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_reason: Option<String>,
    pub min_ensemble_size: usize,

    /// Optimistic-concurrency counter for aggregate updates.
    pub version: u64,
    pub created_at: DateTime<Utc>,
}
