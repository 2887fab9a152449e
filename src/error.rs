//! Engine error taxonomy.
//!
//! Every failure the engine surfaces to a caller maps to one of these
//! variants. A runner process that exits nonzero is *not* an engine error;
//! the normalizer turns it into failed test details instead.

use std::time::Duration;

/// Errors produced by the execution engine and its subsystems.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed job input, rejected before admission.
    #[error("invalid execution: {0}")]
    Validation(String),

    /// The worker pool is at its configured concurrency limit.
    #[error("capacity exceeded: {running}/{max} jobs running")]
    CapacityExceeded { running: usize, max: usize },

    /// Shutdown has been initiated; no new jobs are accepted.
    #[error("service unavailable: shutdown in progress")]
    ServiceUnavailable,

    /// Sandbox or runner toolchain provisioning failed.
    #[error("environment setup failed: {0}")]
    EnvironmentSetup(String),

    /// The runner process could not be started at all.
    #[error("failed to spawn runner process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The job exceeded its wall-clock budget and was terminated.
    #[error("execution timed out after {}s", .limit.as_secs())]
    Timeout { limit: Duration },

    /// The job was cancelled (service shutdown or explicit cancel).
    #[error("execution cancelled: {0}")]
    Cancelled(String),

    /// Artifact upload, download, or delete failed.
    #[error("artifact store failure: {0}")]
    ArtifactStore(String),

    /// A referenced execution or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Execution record persistence failed.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl EngineError {
    /// Short machine-readable code for logs and status records.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::ServiceUnavailable => "service_unavailable",
            EngineError::EnvironmentSetup(_) => "environment_setup",
            EngineError::Spawn(_) => "spawn_failure",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Cancelled(_) => "cancelled",
            EngineError::ArtifactStore(_) => "artifact_store",
            EngineError::NotFound(_) => "not_found",
            EngineError::Storage(_) => "storage",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for EngineError {
    fn from(e: r2d2::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}
