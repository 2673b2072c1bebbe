//! Core traits for execution and session token storage.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    ContainerName, ConversationContext,
    error::{BoxError, ExecError, TokenStoreError},
};

/// A command to run inside a container.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Shell command line, run with `sh -c`.
    pub command: String,
    /// Bytes written to stdin, after which stdin is closed.
    pub stdin: Option<Vec<u8>>,
    /// Wall-clock limit for the whole run.
    pub timeout: Duration,
}

impl ExecutionRequest {
    #[must_use]
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            stdin: None,
            timeout,
        }
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// # Errors
    ///
    /// Returns [`ExecError::InvalidRequest`] for an empty command or a zero timeout.
    pub fn validate(&self) -> Result<(), ExecError> {
        if self.command.trim().is_empty() {
            return Err(ExecError::InvalidRequest("command is empty".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(ExecError::InvalidRequest("timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Outcome of a bounded execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code. `None` when the process was killed or timed out.
    pub exit_code: Option<i32>,
    /// Captured stdout (partial when timed out).
    pub stdout: Vec<u8>,
    pub timed_out: bool,
    /// Last few KiB of stderr, for diagnostics.
    pub stderr_tail: Vec<u8>,
    pub duration: Duration,
}

impl ExecutionResult {
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    #[must_use]
    pub fn stderr_tail_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr_tail).into_owned()
    }

    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.exit_code, Some(0)) && !self.timed_out
    }
}

/// Per-line callback for streaming execution.
///
/// Returning an error stops the run and terminates the process.
pub type LineHandler<'a> = dyn FnMut(&str) -> Result<(), BoxError> + Send + 'a;

/// Trait for command executors.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command to completion or timeout, capturing stdout.
    ///
    /// A timeout is reported through [`ExecutionResult::timed_out`], not as an error.
    async fn execute(
        &self,
        container: &ContainerName,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, ExecError>;

    /// Run a command, delivering each stdout line to `on_line` as it arrives.
    ///
    /// Returns the exit code, or `None` if the process died from a signal.
    async fn stream(
        &self,
        container: &ContainerName,
        request: ExecutionRequest,
        on_line: &mut LineHandler<'_>,
    ) -> Result<Option<i32>, ExecError>;
}

/// Trait for per-conversation continuity token storage.
///
/// Tokens are scoped to the container that ran the turn, so the same
/// conversation id in two containers never shares a token.
#[async_trait]
pub trait SessionTokenStore: Send + Sync {
    /// Load the token for a conversation in `container`, if one was saved.
    async fn load(
        &self,
        container: &ContainerName,
        conversation: &ConversationContext,
    ) -> Result<Option<String>, TokenStoreError>;

    /// Save (overwrite) the token for a conversation in `container`.
    async fn save(
        &self,
        container: &ContainerName,
        conversation: &ConversationContext,
        token: &str,
    ) -> Result<(), TokenStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_bad_requests() {
        let ok = ExecutionRequest::new("true", Duration::from_secs(1));
        assert!(ok.validate().is_ok());

        let empty = ExecutionRequest::new("  ", Duration::from_secs(1));
        assert!(matches!(empty.validate(), Err(ExecError::InvalidRequest(_))));

        let zero = ExecutionRequest::new("true", Duration::ZERO);
        assert!(matches!(zero.validate(), Err(ExecError::InvalidRequest(_))));
    }

    #[test]
    fn test_success_requires_zero_exit_and_no_timeout() {
        let mut result = ExecutionResult {
            exit_code: Some(0),
            ..ExecutionResult::default()
        };
        assert!(result.success());
        result.timed_out = true;
        assert!(!result.success());
        result.timed_out = false;
        result.exit_code = Some(1);
        assert!(!result.success());
    }
}
