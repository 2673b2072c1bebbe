//! Spawn primitive shared by bounded and streaming execution.

use std::{process::ExitStatus, sync::Arc, time::Duration};

#[cfg(unix)]
use command_group::{Signal, UnixChildExt};
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    ContainerName,
    error::DockerError,
    runtime::{ContainerRuntime, EXEC_TAG_ENV, ExecOptions, RemoteSignal},
};

/// Wrap a shell command string for execution inside a container.
#[must_use]
pub fn shell_argv(command: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.to_string()]
}

/// Spawned process handle.
///
/// The local exec client runs in its own process group. The command it
/// started inside the container carries a unique tag in its environment so
/// termination can reach it even though it is not our descendant.
///
/// Dropping a handle whose process was not reaped kills it.
pub struct SpawnedProcess {
    child: Option<AsyncGroupChild>,
    runtime: Arc<dyn ContainerRuntime>,
    container: ContainerName,
    tag: String,
}

impl SpawnedProcess {
    /// Spawn `sh -c <command>` inside `container`.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is not running or the runtime
    /// client cannot be started.
    pub async fn spawn(
        runtime: Arc<dyn ContainerRuntime>,
        container: &ContainerName,
        command: &str,
        with_stdin: bool,
    ) -> Result<Self, DockerError> {
        runtime.ensure_running(container).await?;

        let tag = Uuid::new_v4().simple().to_string();
        let opts = ExecOptions {
            stdin: with_stdin,
            env: vec![(EXEC_TAG_ENV.to_string(), tag.clone())],
            workdir: None,
        };
        let mut cmd = runtime.exec_command(container, &shell_argv(command), &opts);
        let child = cmd.group_spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DockerError::RuntimeUnavailable(format!("{}: {e}", runtime.name()))
            } else {
                DockerError::SpawnFailed(e.to_string())
            }
        })?;

        debug!(
            container = %container,
            runtime = runtime.name(),
            pid = ?child.id(),
            tag = %tag,
            "Spawned exec process"
        );

        Ok(Self {
            child: Some(child),
            runtime,
            container: container.clone(),
            tag,
        })
    }

    /// Local process id of the exec client, if still running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(AsyncGroupChild::id)
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.as_mut()?.inner().stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut()?.inner().stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.as_mut()?.inner().stderr.take()
    }

    /// Wait for the process to exit and reap it.
    ///
    /// Cancel safe: if the future is dropped the process is still owned by
    /// this handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the process was already reaped or waiting fails.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let Some(child) = self.child.as_mut() else {
            return Err(std::io::Error::other("process already reaped"));
        };
        let status = child.wait().await?;
        self.child = None;
        Ok(status)
    }

    /// Terminate the process group and the tagged in-container command.
    ///
    /// Sends SIGTERM, waits up to `grace`, then kills. Always reaps the
    /// local process before returning.
    pub async fn terminate(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        self.signal_remote(Some(grace));

        request_stop(&mut child);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "Exec process terminated"),
            Ok(Err(e)) => warn!(error = %e, "Waiting for terminated exec process failed"),
            Err(_) => {
                debug!(grace_ms = grace.as_millis(), "Exec process ignored SIGTERM, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill exec process group");
                }
            }
        }
    }

    // Detached. Failures are only logged.
    fn signal_remote(&self, grace: Option<Duration>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        let container = self.container.clone();
        let tag = self.tag.clone();
        handle.spawn(async move {
            if let Some(grace) = grace {
                if let Err(e) = runtime.signal_tagged(&container, &tag, RemoteSignal::Term).await {
                    debug!(container = %container, error = %e, "Remote TERM failed");
                }
                tokio::time::sleep(grace).await;
            }
            if let Err(e) = runtime.signal_tagged(&container, &tag, RemoteSignal::Kill).await {
                debug!(container = %container, error = %e, "Remote KILL failed");
            }
        });
    }
}

#[cfg(unix)]
fn request_stop(child: &mut AsyncGroupChild) {
    if let Err(e) = child.signal(Signal::SIGTERM) {
        debug!(error = %e, "SIGTERM to exec process group failed");
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut AsyncGroupChild) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Kill of exec process failed");
    }
}

impl Drop for SpawnedProcess {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "Kill on drop failed");
        }
        self.signal_remote(None);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = child.wait().await;
            });
        }
    }
}
