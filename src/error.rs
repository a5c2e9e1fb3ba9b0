use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Worker binary not found: {0}")]
    WorkerBinaryNotFound(String),

    #[error("Process failed to start: {0}")]
    ProcessStartFailed(String),

    #[error("No session id reported within {0:?}")]
    SessionResolutionTimeout(Duration),

    #[error("Execution capacity exceeded (max: {max})")]
    CapacityExceeded { max: usize },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution still active: {0}")]
    ExecutionStillActive(String),

    #[error("Session already active: {0}")]
    SessionExists(String),

    #[error("Failed to kill process for session {session_id}: {reason}")]
    ProcessKillFailed { session_id: String, reason: String },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already exists: {0}")]
    TaskExists(String),

    #[error("Task {id} cannot execute: {reason}")]
    TaskNotExecutable { id: String, reason: String },

    #[error("Queued execution not admitted within {0:?}")]
    QueueTimeout(Duration),

    #[error("Execution queue cleared")]
    QueueCleared,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Workflow failed: {0}")]
    WorkflowFailed(String),
}

impl Error {
    /// Whether the failure came from the outside world rather than the caller.
    ///
    /// Transient failures on the workflow dispatch path feed the retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ProcessStartFailed(_)
                | Error::SessionResolutionTimeout(_)
                | Error::QueueTimeout(_)
                | Error::CapacityExceeded { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
