// ================================================================================================
// Evidence & Reliability
// ================================================================================================
//
// Canonical hashing, determinism signatures, reliability scoring, calibration, and
// parameter versioning. Everything here is auditable: scores carry their weights and
// computation traces, packs carry the hashes they were verified against.

pub mod calibration;
pub mod canonical;
pub mod determinism;
pub mod pack;
pub mod params;
pub mod reliability;

pub use determinism::{DeterminismComparisonResult, DeterminismSignature};
pub use pack::{EvidencePack, EvidenceService, EVIDENCE_PACK_VERSION};
pub use reliability::{ReliabilityLevel, ReliabilityScore, ReliabilityWeights};
