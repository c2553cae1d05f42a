// ================================================================================================
// Domain Strong Types (NewTypes)
// ================================================================================================

use serde::{Deserialize, Serialize};

use crate::{impl_from_primitive, impl_opaque_id};

impl_opaque_id!(
    /// Scoping container owning a Universe Map.
    ProjectId
);
impl_opaque_id!(TenantId);
impl_opaque_id!(
    /// A scenario state in the Universe Map DAG.
    NodeId
);
impl_opaque_id!(EdgeId);
impl_opaque_id!(
    /// Derived environment modifications attached to an edge.
    PatchId
);
impl_opaque_id!(RunId);
impl_opaque_id!(RunConfigId);
impl_opaque_id!(DatasetId);
impl_opaque_id!(LabelId);
impl_opaque_id!(
    /// Calibration job identifier.
    JobId
);
impl_opaque_id!(VersionId);
impl_opaque_id!(ManifestEntryId);

/// Simulation time in integer ticks. Tick 0 is the initial world state.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Tick(pub u32);
impl_from_primitive!(Tick, u32);

impl Tick {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A primary seed for the deterministic PRNG streams.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Seed(pub u64);
impl_from_primitive!(Seed, u64);

impl std::fmt::Display for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable, deterministic agent identifier.
///
/// Agents are identified by their population index rather than a random UUID so that
/// two runs with the same seed and config serialize byte-identical telemetry.
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
)]
#[serde(transparent)]
pub struct AgentId(pub u32);
impl_from_primitive!(AgentId, u32);

impl AgentId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// Canonical string form used as the key in telemetry maps.
    pub fn key(&self) -> String {
        format!("agent-{:05}", self.0)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent-{:05}", self.0)
    }
}

/// Engine / ruleset / dataset version triple carried on projects and run configs.
///
/// Part of the `run_config_hash` input, so bumping any member invalidates
/// determinism comparisons against older runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionSet {
    pub engine_version: String,
    pub ruleset_version: String,
    pub dataset_version: String,
}

impl Default for VersionSet {
    fn default() -> Self {
        Self {
            engine_version: "1.0.0".to_string(),
            ruleset_version: "1.0.0".to_string(),
            dataset_version: "1.0.0".to_string(),
        }
    }
}

/// Scoping container owning a Universe Map. Created by an external collaborator; the
/// core reads its identity and version pins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub tenant_id: TenantId,
    pub name: String,
    pub versions: VersionSet,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Project {
    pub fn new(tenant_id: TenantId, name: impl Into<String>) -> Self {
        Self {
            id: ProjectId::new(),
            tenant_id,
            name: name.into(),
            versions: VersionSet::default(),
            created_at: chrono::Utc::now(),
        }
    }
}
