// ================================================================================================
// Universe Map
// ================================================================================================
//
// The append-only DAG of scenario states. Every intervention forks a new node; parent
// state is never modified after commit.

pub mod map;
pub mod node;

pub use map::{NlPatchTranslator, UniverseMap, UniverseMapData};
pub use node::{
    AggregatedOutcome, ConfidenceTier, DeltaOp, Edge, EdgeExplanation, Intervention, Node,
    NodePatch, OutcomeStat, VariableChange,
};
