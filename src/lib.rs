// === Public Modules (The Canonical Paths) ===
pub mod config;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod gateway;
pub mod orchestrator;
pub mod telemetry;
pub mod types;
pub mod universe;

// === Private Implementation Details ===
mod macros;

// === Facades (Re-exporting the common entry points) ===
pub use crate::error::{ErrorKind, WorldlineError, WorldlineResult};
pub use crate::orchestrator::{NodeBinding, Orchestrator, executor::RunExecutor};
pub use crate::types::{NodeId, ProjectId, RunId, Seed, TenantId, Tick};
