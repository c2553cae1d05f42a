// ================================================================================================
// Telemetry Pipeline
// ================================================================================================
//
// Keyframe+delta encoded per-tick state with a queryable index, serialized canonically
// and persisted content-addressed. Replay is strictly read-only.

pub mod blob;
pub mod replay;
pub mod store;
pub mod writer;

pub use blob::{
    AgentPosition, Capabilities, Delta, EventIndexEntry, Keyframe, TelemetryBlob,
    TelemetryIndex, TelemetrySummary,
};
pub use replay::{ReplayChunk, ReplayLoader, ReplayTimeline, TimelineMarker, WorldReplayState};
pub use store::{BlobStore, MemoryBlobStore, StorageRef, TelemetryStore};
pub use writer::TelemetryWriter;
