//! Bounded and streaming execution inside a container.

use std::{borrow::Cow, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{ChildStderr, ChildStdin},
    task::JoinHandle,
    time::{Instant, timeout, timeout_at},
};
use tracing::{debug, warn};
use workspace_engine_core::{
    CommandExecutor, ContainerName, ContainerRuntime, EngineConfig, ExecError, ExecutionRequest,
    ExecutionResult, LineHandler, SpawnedProcess, runtime_from_config,
};

/// Bytes of stderr kept for diagnostics.
const STDERR_TAIL_BYTES: usize = 4096;

/// How long to wait for the stderr drain after the process is gone.
const STDERR_SETTLE: Duration = Duration::from_millis(500);

/// Executes commands in containers through a [`ContainerRuntime`].
///
/// Stdout is captured (or streamed); stderr is drained separately, logged at
/// debug level and only its tail is kept.
#[derive(Debug, Clone)]
pub struct ContainerExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    kill_grace: Duration,
}

impl ContainerExecutor {
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            kill_grace: Duration::from_secs(2),
        }
    }

    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(runtime_from_config(config)).with_kill_grace(config.execution.kill_grace())
    }

    /// Time between SIGTERM and SIGKILL when a run is cut short.
    #[must_use]
    pub const fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    async fn spawn(
        &self,
        container: &ContainerName,
        request: &ExecutionRequest,
    ) -> Result<SpawnedProcess, ExecError> {
        debug!(
            container = %container,
            timeout_ms = request.timeout.as_millis(),
            command_len = request.command.len(),
            stdin_bytes = request.stdin.as_ref().map_or(0, Vec::len),
            "Executing command"
        );
        let process = SpawnedProcess::spawn(
            Arc::clone(&self.runtime),
            container,
            &request.command,
            request.stdin.is_some(),
        )
        .await?;
        Ok(process)
    }
}

/// Write `data` then close stdin so the command sees end-of-input.
fn feed_stdin(stdin: Option<ChildStdin>, data: Option<Vec<u8>>) -> Option<JoinHandle<()>> {
    let (mut stdin, data) = (stdin?, data?);
    Some(tokio::spawn(async move {
        // A command that exits without reading stdin closes the pipe; not an error.
        if let Err(e) = stdin.write_all(&data).await {
            debug!(error = %e, "Writing stdin failed");
        }
        if let Err(e) = stdin.shutdown().await {
            debug!(error = %e, "Closing stdin failed");
        }
    }))
}

fn drain_stderr(stderr: ChildStderr) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut tail = Vec::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    debug!(line = %decode_line(&line), "stderr");
                    tail.extend_from_slice(&line);
                    if tail.len() > STDERR_TAIL_BYTES {
                        tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Reading stderr failed");
                    break;
                }
            }
        }
        tail
    })
}

async fn finish_io(stdin_task: Option<JoinHandle<()>>, stderr_task: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    if let Some(task) = stdin_task {
        task.abort();
    }
    let Some(mut task) = stderr_task else {
        return Vec::new();
    };
    match timeout(STDERR_SETTLE, &mut task).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            debug!(error = %e, "stderr drain task failed");
            Vec::new()
        }
        Err(_) => {
            // Something outside the process group still holds the pipe.
            task.abort();
            Vec::new()
        }
    }
}

/// Strip the line terminator (`\n` or `\r\n`) and decode lossily.
fn decode_line(line: &[u8]) -> Cow<'_, str> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line)
}

async fn read_to_end_into(mut reader: impl AsyncRead + Unpin, out: &mut Vec<u8>) -> std::io::Result<()> {
    // Chunked so bytes read before a timeout are already in `out`.
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[async_trait]
impl CommandExecutor for ContainerExecutor {
    async fn execute(
        &self,
        container: &ContainerName,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, ExecError> {
        request.validate()?;
        let started = Instant::now();
        let deadline = started + request.timeout;

        let Ok(spawned) = timeout_at(deadline, self.spawn(container, &request)).await else {
            warn!(
                container = %container,
                timeout_ms = request.timeout.as_millis(),
                "Command timed out before it started"
            );
            return Ok(ExecutionResult {
                timed_out: true,
                duration: started.elapsed(),
                ..ExecutionResult::default()
            });
        };
        let mut process = spawned?;
        let stdin_task = feed_stdin(process.take_stdin(), request.stdin);
        let stderr_task = process.take_stderr().map(drain_stderr);
        let stdout = process
            .take_stdout()
            .ok_or_else(|| ExecError::Io(std::io::Error::other("stdout was not captured")))?;

        let mut captured = Vec::new();
        let outcome = timeout_at(deadline, async {
            read_to_end_into(stdout, &mut captured).await?;
            process.wait().await
        })
        .await;

        let (exit_code, timed_out) = match outcome {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(e)) => {
                process.terminate(self.kill_grace).await;
                finish_io(stdin_task, stderr_task).await;
                return Err(ExecError::Io(e));
            }
            Err(_) => {
                warn!(
                    container = %container,
                    timeout_ms = request.timeout.as_millis(),
                    "Command timed out, terminating"
                );
                process.terminate(self.kill_grace).await;
                (None, true)
            }
        };

        let stderr_tail = finish_io(stdin_task, stderr_task).await;
        let duration = started.elapsed();
        debug!(
            container = %container,
            ?exit_code,
            timed_out,
            stdout_bytes = captured.len(),
            duration_ms = duration.as_millis(),
            "Command finished"
        );

        Ok(ExecutionResult {
            exit_code,
            stdout: captured,
            timed_out,
            stderr_tail,
            duration,
        })
    }

    async fn stream(
        &self,
        container: &ContainerName,
        request: ExecutionRequest,
        on_line: &mut LineHandler<'_>,
    ) -> Result<Option<i32>, ExecError> {
        request.validate()?;
        let deadline = Instant::now() + request.timeout;

        let Ok(spawned) = timeout_at(deadline, self.spawn(container, &request)).await else {
            warn!(
                container = %container,
                timeout_ms = request.timeout.as_millis(),
                "Stream timed out before it started"
            );
            return Err(ExecError::Timeout {
                timeout: request.timeout,
            });
        };
        let mut process = spawned?;
        let stdin_task = feed_stdin(process.take_stdin(), request.stdin);
        let stderr_task = process.take_stderr().map(drain_stderr);
        let stdout = process
            .take_stdout()
            .ok_or_else(|| ExecError::Io(std::io::Error::other("stdout was not captured")))?;

        let mut reader = BufReader::new(stdout);
        let mut line = Vec::new();
        let mut lines = 0usize;
        let outcome = timeout_at(deadline, async {
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line).await? == 0 {
                    break;
                }
                lines += 1;
                on_line(&*decode_line(&line)).map_err(ExecError::Handler)?;
            }
            let status = process.wait().await?;
            Ok::<_, ExecError>(status.code())
        })
        .await;

        let result = match outcome {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(e)) => {
                debug!(container = %container, error = %e, "Stream aborted, terminating");
                process.terminate(self.kill_grace).await;
                Err(e)
            }
            Err(_) => {
                warn!(
                    container = %container,
                    timeout_ms = request.timeout.as_millis(),
                    "Stream timed out, terminating"
                );
                process.terminate(self.kill_grace).await;
                Err(ExecError::Timeout {
                    timeout: request.timeout,
                })
            }
        };

        let stderr_tail = finish_io(stdin_task, stderr_task).await;
        if !matches!(result, Ok(Some(0))) && !stderr_tail.is_empty() {
            debug!(
                container = %container,
                stderr = %String::from_utf8_lossy(&stderr_tail),
                "Stream ended abnormally"
            );
        }
        debug!(container = %container, lines, "Stream finished");
        result
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use portable_pty::CommandBuilder;
    use tokio::process::Command;
    use workspace_engine_core::{
        BoxError, DockerRuntime, HostRuntime, error::DockerError, runtime::ExecOptions,
    };

    use super::*;

    /// Host runtime whose readiness check takes `delay`.
    #[derive(Debug)]
    struct SlowReadyRuntime {
        inner: HostRuntime,
        delay: Duration,
    }

    #[async_trait]
    impl ContainerRuntime for SlowReadyRuntime {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn exec_command(&self, container: &ContainerName, argv: &[String], opts: &ExecOptions) -> Command {
            self.inner.exec_command(container, argv, opts)
        }

        fn pty_command(
            &self,
            container: &ContainerName,
            argv: &[String],
            env: &[(String, String)],
        ) -> CommandBuilder {
            self.inner.pty_command(container, argv, env)
        }

        async fn ensure_running(&self, _container: &ContainerName) -> Result<(), DockerError> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn slow_executor() -> ContainerExecutor {
        ContainerExecutor::new(Arc::new(SlowReadyRuntime {
            inner: HostRuntime::new(),
            delay: Duration::from_secs(4),
        }))
    }

    fn executor() -> ContainerExecutor {
        ContainerExecutor::new(Arc::new(HostRuntime::new())).with_kill_grace(Duration::from_millis(500))
    }

    fn container() -> ContainerName {
        ContainerName::from_raw("agent-test")
    }

    #[tokio::test]
    async fn test_echo_hi() {
        let result = executor()
            .execute(&container(), ExecutionRequest::new("echo hi", Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, b"hi\n");
        assert!(!result.timed_out);
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_data() {
        let result = executor()
            .execute(&container(), ExecutionRequest::new("echo out; exit 3", Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout_lossy(), "out\n");
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_stdin_is_written_then_closed() {
        let request = ExecutionRequest::new("cat; echo done", Duration::from_secs(5)).with_stdin("payload");
        let result = executor().execute(&container(), request).await.unwrap();

        assert_eq!(result.stdout_lossy(), "payloaddone\n");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_stderr_is_kept_apart() {
        let result = executor()
            .execute(&container(), ExecutionRequest::new("echo out; echo err >&2", Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(result.stdout, b"out\n");
        assert_eq!(result.stderr_tail, b"err\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let started = std::time::Instant::now();
        let result = executor()
            .execute(&container(), ExecutionRequest::new("echo $$; sleep 10", Duration::from_secs(1)))
            .await
            .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(5));

        let pid = result.stdout_lossy().trim().to_string();
        assert!(!pid.is_empty(), "partial stdout is kept");
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
    }

    #[tokio::test]
    async fn test_zero_timeout_is_rejected() {
        let err = executor()
            .execute(&container(), ExecutionRequest::new("true", Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_missing_runtime_is_docker_error() {
        let executor = ContainerExecutor::new(Arc::new(DockerRuntime::new("wse-no-such-runtime")));
        let err = executor
            .execute(&container(), ExecutionRequest::new("true", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Docker(DockerError::RuntimeUnavailable(_))));
    }

    #[tokio::test]
    async fn test_stream_delivers_lines_in_order() {
        let mut lines = Vec::new();
        let request = ExecutionRequest::new("printf 'a\\r\\nb\\n\\nc'", Duration::from_secs(5));
        let code = executor()
            .stream(&container(), request, &mut |line: &str| {
                lines.push(line.to_string());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(code, Some(0));
        assert_eq!(lines, vec!["a", "b", "", "c"]);
    }

    #[tokio::test]
    async fn test_stream_passes_stdin() {
        let mut lines = Vec::new();
        let request = ExecutionRequest::new("tr a-z A-Z", Duration::from_secs(5)).with_stdin("hello\n");
        executor()
            .stream(&container(), request, &mut |line: &str| {
                lines.push(line.to_string());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(lines, vec!["HELLO"]);
    }

    #[tokio::test]
    async fn test_stream_timeout_raises() {
        let mut lines = Vec::new();
        let started = std::time::Instant::now();
        let request = ExecutionRequest::new("echo $$; sleep 10; echo never", Duration::from_secs(1));
        let err = executor()
            .stream(&container(), request, &mut |line: &str| {
                lines.push(line.to_string());
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(lines.len(), 1, "only the line before the timeout: {lines:?}");
        assert!(!lines[0].is_empty());
        assert!(!Path::new(&format!("/proc/{}", lines[0])).exists());
    }

    #[tokio::test]
    async fn test_slow_readiness_check_counts_against_timeout() {
        let started = std::time::Instant::now();
        let result = slow_executor()
            .execute(&container(), ExecutionRequest::new("echo late", Duration::from_secs(1)))
            .await
            .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(result.stdout.is_empty());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_stream_slow_readiness_check_raises_timeout() {
        let mut lines = Vec::new();
        let started = std::time::Instant::now();
        let err = slow_executor()
            .stream(
                &container(),
                ExecutionRequest::new("echo late", Duration::from_secs(1)),
                &mut |line: &str| {
                    lines.push(line.to_string());
                    Ok(())
                },
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(lines.is_empty());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_stream_handler_error_stops_process() {
        let mut calls = 0;
        let started = std::time::Instant::now();
        let request = ExecutionRequest::new("echo one; echo two; sleep 10", Duration::from_secs(30));
        let err = executor()
            .stream(&container(), request, &mut |_line: &str| {
                calls += 1;
                Err::<(), BoxError>("stop".into())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Handler(_)));
        assert_eq!(calls, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
