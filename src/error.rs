use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use thiserror::Error;

pub type WorldlineResult<T> = Result<T, WorldlineError>;

#[derive(Debug, Error)]
pub enum WorldlineError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Universe(#[from] UniverseError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    System(#[from] SystemError),
}

/// Errors occurring inside the simulation engine tick loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid population spec: {0}")]
    InvalidPopulation(String),

    #[error("Unknown action: '{0}'")]
    UnknownAction(String),

    #[error("Invalid precondition expression: '{0}'")]
    InvalidPrecondition(String),

    #[error("Agent fault threshold exceeded: {terminated} of {total} agents terminated")]
    AgentFaultThreshold { terminated: usize, total: usize },

    #[error("Policy shape mismatch: {0}")]
    PolicyShape(String),

    #[error("Numeric failure in engine: {0}")]
    Numeric(String),
}

/// Errors related to the Universe Map DAG and node aggregation.
#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Parent node not found: {0}")]
    ParentNotFound(String),

    #[error("Intervention translation failed: {0}")]
    TranslationFailed(String),

    #[error("Empty intervention: {0}")]
    EmptyIntervention(String),

    #[error("Aggregate version conflict on node {0} after retries")]
    ConcurrentUpdate(String),

    #[error("Stale aggregate: {0}")]
    StaleAggregate(String),
}

/// Errors related to telemetry encoding, storage, and replay.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("No telemetry loaded; call load() first")]
    NotLoaded,

    #[error("Tick {requested} out of range (0..={max})")]
    TickOutOfRange { requested: u32, max: u32 },

    #[error("Telemetry writer already finalized")]
    WriterFinalized,

    #[error("Non-monotonic tick: {tick} after {last}")]
    NonMonotonicTick { tick: u32, last: u32 },

    #[error("Corrupt telemetry blob: {0}")]
    CorruptBlob(String),
}

/// Errors raised by the Data Gateway and Leakage Guard.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Data source not registered: '{0}'")]
    SourceNotRegistered(String),

    #[error("Source '{source_name}' blocked: {reason}")]
    SourceBlocked { source_name: String, reason: String },

    #[error("Future data access on '{source_name}': {dropped} records beyond cutoff at isolation level 3")]
    FutureDataAccess { source_name: String, dropped: usize },

    #[error("Source '{0}' has no timestamp field but isolation level requires one")]
    MissingTimestampField(String),

    #[error("Fetch failed for source '{source_name}': {msg}")]
    Fetch { source_name: String, msg: String },
}

/// Errors related to evidence, calibration, and parameter versioning.
#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Insufficient data: {found} samples found, minimum {required} required")]
    InsufficientData { found: usize, required: usize },

    #[error("Run has no outcome: {0}")]
    MissingOutcome(String),

    #[error("Parameter version not found: {0}")]
    UnknownVersion(String),

    #[error("Parameter version {0} requires approval before activation")]
    NotApproved(String),

    #[error("Calibration job is in terminal state: {0}")]
    JobTerminal(String),
}

/// Errors related to run lifecycle and scheduling.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Illegal run state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid run request: {0}")]
    Validation(String),

    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Time budget exceeded: {elapsed_ms}ms of {budget_ms}ms")]
    TimeBudgetExceeded { elapsed_ms: u64, budget_ms: u64 },
}

/// Errors related to File I/O, serialization, and object storage.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("IO operation failed")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed")]
    Json(#[from] serde_json::Error),

    #[error("Snapshot encoding failed")]
    Snapshot(#[from] postcard::Error),

    #[error("Object store operation failed: {0}")]
    ObjectStore(String),

    #[error("Storage unavailable after retry: {0}")]
    StorageUnavailable(String),
}

/// Errors related to internal invariants and bugs.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Missing internal field: {0}")]
    MissingField(String),

    #[error("Index out of bounds: {0}")]
    IndexOutOfBounds(String),

    #[error("Determinism violation: {0}")]
    DeterminismViolation(String),
}

// ================================================================================================
// Stable Error Kinds
// ================================================================================================

/// Stable error kinds propagated in `Run.error` and surface responses.
///
/// These identifiers are part of the external contract; variants are appended, never
/// renamed.
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
pub enum ErrorKind {
    ValidationError,
    StateTransitionViolation,
    SourceBlocked,
    FutureDataAccess,
    AgentFaultThreshold,
    TimeBudgetExceeded,
    StorageUnavailable,
    DeterminismViolation,
    InternalError,
}

/// Error record attached to a failed run. Carries the stable kind and a short message,
/// never secrets or payload data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl WorldlineError {
    /// Map an internal error to its stable surface kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Engine(EngineError::AgentFaultThreshold { .. }) => {
                ErrorKind::AgentFaultThreshold
            }
            Self::Engine(_) => ErrorKind::InternalError,
            Self::Universe(UniverseError::TranslationFailed(_))
            | Self::Universe(UniverseError::EmptyIntervention(_)) => ErrorKind::ValidationError,
            Self::Universe(UniverseError::StaleAggregate(_)) => ErrorKind::ValidationError,
            Self::Universe(_) => ErrorKind::InternalError,
            Self::Telemetry(_) => ErrorKind::InternalError,
            Self::Gateway(GatewayError::FutureDataAccess { .. }) => ErrorKind::FutureDataAccess,
            Self::Gateway(_) => ErrorKind::SourceBlocked,
            Self::Evidence(EvidenceError::InsufficientData { .. }) => ErrorKind::ValidationError,
            Self::Evidence(_) => ErrorKind::InternalError,
            Self::Orchestrator(OrchestratorError::InvalidTransition { .. }) => {
                ErrorKind::StateTransitionViolation
            }
            Self::Orchestrator(OrchestratorError::Validation(_)) => ErrorKind::ValidationError,
            Self::Orchestrator(OrchestratorError::TimeBudgetExceeded { .. }) => {
                ErrorKind::TimeBudgetExceeded
            }
            Self::Orchestrator(_) => ErrorKind::InternalError,
            Self::Io(IoError::StorageUnavailable(_)) | Self::Io(IoError::ObjectStore(_)) => {
                ErrorKind::StorageUnavailable
            }
            Self::Io(_) => ErrorKind::InternalError,
            Self::System(SystemError::DeterminismViolation(_)) => {
                ErrorKind::DeterminismViolation
            }
            Self::System(_) => ErrorKind::InternalError,
        }
    }

    /// Convert into the record stored on a failed run.
    pub fn to_run_error(&self) -> RunError {
        RunError::new(self.kind(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serializes_snake_case() {
        assert_eq!(ErrorKind::AgentFaultThreshold.to_string(), "agent_fault_threshold");
        assert_eq!(ErrorKind::TimeBudgetExceeded.to_string(), "time_budget_exceeded");
        let json = serde_json::to_string(&ErrorKind::SourceBlocked).unwrap();
        assert_eq!(json, "\"source_blocked\"");
    }

    #[test]
    fn kinds_map_from_internal_errors() {
        let err: WorldlineError = EngineError::AgentFaultThreshold {
            terminated: 10,
            total: 100,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::AgentFaultThreshold);

        let err: WorldlineError = OrchestratorError::InvalidTransition {
            from: "succeeded".into(),
            to: "running".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::StateTransitionViolation);

        let err: WorldlineError = GatewayError::FutureDataAccess {
            source_name: "census".into(),
            dropped: 3,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::FutureDataAccess);
    }
}
