//! Error taxonomy shared by every executor.

use std::time::Duration;

use thiserror::Error;

use crate::ContainerName;

/// Boxed error returned by caller-supplied handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Container-level failure: the target cannot be reached or nothing could be spawned.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Container not found: {0}")]
    ContainerNotFound(ContainerName),
    #[error("Container is not running: {0}")]
    ContainerNotRunning(ContainerName),
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Container runtime error: {0}")]
    Runtime(String),
}

/// Execution error for bounded and streaming runs.
///
/// A non-zero exit status is never an error at this layer.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Docker(#[from] DockerError),
    #[error("Command timed out after {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },
    #[error("Invalid execution request: {0}")]
    InvalidRequest(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Line handler failed: {0}")]
    Handler(BoxError),
}

impl ExecError {
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Session token store error.
#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("Token store execution failed: {0}")]
    Exec(#[from] ExecError),
    #[error("Token store error: {0}")]
    Internal(String),
}
