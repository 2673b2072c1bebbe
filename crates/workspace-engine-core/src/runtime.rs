//! Container runtime seam.
//!
//! A runtime turns an argv into a process attached to a named container:
//! - `DockerRuntime` - `docker exec` (or any CLI-compatible binary)
//! - `HostRuntime` - runs argv directly on the host, for development and tests

use std::{fmt, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use portable_pty::CommandBuilder;
use tokio::process::Command;

use crate::{
    ContainerName,
    config::{EngineConfig, RuntimeKind},
    error::DockerError,
};

/// Environment variable carrying the per-exec tag inside the container.
pub const EXEC_TAG_ENV: &str = "WSE_EXEC_TAG";

/// Options for a non-interactive exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Attach stdin.
    pub stdin: bool,
    /// Extra environment for the exec'd process.
    pub env: Vec<(String, String)>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
}

/// Signal delivered to tagged processes inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSignal {
    Term,
    Kill,
}

impl RemoteSignal {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Kill => "KILL",
        }
    }
}

/// Trait for container runtimes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Build a non-interactive exec of `argv` inside `container`.
    ///
    /// Stdout and stderr are piped; stdin is piped only if requested.
    fn exec_command(&self, container: &ContainerName, argv: &[String], opts: &ExecOptions) -> Command;

    /// Build an interactive, terminal-attached exec of `argv` inside `container`.
    fn pty_command(
        &self,
        container: &ContainerName,
        argv: &[String],
        env: &[(String, String)],
    ) -> CommandBuilder;

    /// Fail unless `container` exists and is running.
    async fn ensure_running(&self, container: &ContainerName) -> Result<(), DockerError>;

    /// Signal every process in `container` whose environment carries `tag`.
    ///
    /// Killing the local exec client does not stop the command it started
    /// inside the container; this reaches it directly. The default does
    /// nothing, for runtimes where the local process group is the whole tree.
    async fn signal_tagged(
        &self,
        _container: &ContainerName,
        _tag: &str,
        _signal: RemoteSignal,
    ) -> Result<(), DockerError> {
        Ok(())
    }
}

/// Build the runtime selected by `config`.
#[must_use]
pub fn runtime_from_config(config: &EngineConfig) -> Arc<dyn ContainerRuntime> {
    match config.runtime.kind {
        RuntimeKind::Docker => {
            let mut runtime = DockerRuntime::new(config.runtime.binary.clone())
                .with_probe_timeout(config.execution.probe_timeout());
            if let Some(user) = &config.runtime.exec_user {
                runtime = runtime.with_user(user.clone());
            }
            Arc::new(runtime)
        }
        RuntimeKind::Host => Arc::new(HostRuntime::new()),
    }
}

/// `docker exec` based runtime.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
    user: Option<String>,
    probe_timeout: Duration,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerRuntime {
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            user: None,
            probe_timeout: Duration::from_secs(10),
        }
    }

    /// Run execs as `user`.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    fn exec_args(
        &self,
        container: &ContainerName,
        interactive: bool,
        tty: bool,
        env: &[(String, String)],
        workdir: Option<&str>,
        argv: &[String],
    ) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".to_string());
        }
        if tty {
            args.push("-t".to_string());
        }
        if let Some(user) = &self.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        if let Some(dir) = workdir {
            args.push("-w".to_string());
            args.push(dir.to_string());
        }
        args.push(container.to_string());
        args.extend(argv.iter().cloned());
        args
    }

    async fn run_probe(&self, args: &[&str]) -> Result<std::process::Output, DockerError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.probe_timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(
                DockerError::RuntimeUnavailable(format!("{}: {e}", self.binary)),
            ),
            Ok(Err(e)) => Err(DockerError::SpawnFailed(e.to_string())),
            Err(_) => Err(DockerError::Runtime(format!(
                "{} {} timed out after {}s",
                self.binary,
                args.first().copied().unwrap_or_default(),
                self.probe_timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn exec_command(&self, container: &ContainerName, argv: &[String], opts: &ExecOptions) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.exec_args(
            container,
            opts.stdin,
            false,
            &opts.env,
            opts.workdir.as_deref(),
            argv,
        ))
        .stdin(if opts.stdin { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        cmd
    }

    fn pty_command(
        &self,
        container: &ContainerName,
        argv: &[String],
        env: &[(String, String)],
    ) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.binary);
        cmd.args(self.exec_args(container, true, true, env, None, argv));
        cmd
    }

    async fn ensure_running(&self, container: &ContainerName) -> Result<(), DockerError> {
        let output = self
            .run_probe(&[
                "inspect",
                "--type",
                "container",
                "--format",
                "{{.State.Running}}",
                container.as_str(),
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Err(DockerError::ContainerNotFound(container.clone()));
            }
            return Err(DockerError::Runtime(stderr.trim().to_string()));
        }

        match String::from_utf8_lossy(&output.stdout).trim() {
            "true" => Ok(()),
            "false" => Err(DockerError::ContainerNotRunning(container.clone())),
            other => Err(DockerError::Runtime(format!(
                "unexpected state for {container}: {other}"
            ))),
        }
    }

    async fn signal_tagged(
        &self,
        container: &ContainerName,
        tag: &str,
        signal: RemoteSignal,
    ) -> Result<(), DockerError> {
        // The killer runs without the tag in its own environment, so it never matches itself.
        let script = format!(
            "t='{EXEC_TAG_ENV}={tag}'; for p in /proc/[0-9]*; do \
             if tr '\\0' '\\n' < \"$p/environ\" 2>/dev/null | grep -qx \"$t\"; then \
             kill -s {sig} \"${{p##*/}}\" 2>/dev/null; fi; done; exit 0",
            sig = signal.as_str(),
        );
        let output = self
            .run_probe(&["exec", container.as_str(), "sh", "-c", &script])
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DockerError::Runtime(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// Runs commands directly on the host, ignoring the container name.
#[derive(Debug, Clone, Default)]
pub struct HostRuntime {
    env: Vec<(String, String)>,
}

impl HostRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an environment variable for every spawned process.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

fn split_argv(argv: &[String]) -> (&str, &[String]) {
    argv.split_first()
        .map_or(("sh", &[][..]), |(program, args)| (program.as_str(), args))
}

#[async_trait]
impl ContainerRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        "host"
    }

    fn exec_command(&self, _container: &ContainerName, argv: &[String], opts: &ExecOptions) -> Command {
        let (program, args) = split_argv(argv);
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(self.env.iter().cloned())
            .envs(opts.env.iter().cloned())
            .stdin(if opts.stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &opts.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn pty_command(
        &self,
        _container: &ContainerName,
        argv: &[String],
        env: &[(String, String)],
    ) -> CommandBuilder {
        let (program, args) = split_argv(argv);
        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        for (key, value) in self.env.iter().chain(env) {
            cmd.env(key, value);
        }
        cmd
    }

    async fn ensure_running(&self, _container: &ContainerName) -> Result<(), DockerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_docker_exec_args() {
        let runtime = DockerRuntime::new("docker").with_user("agent");
        let container = ContainerName::from_raw("agent-1");
        let argv = vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()];
        let opts = ExecOptions {
            stdin: true,
            env: vec![(EXEC_TAG_ENV.to_string(), "abc".to_string())],
            workdir: Some("/work".to_string()),
        };

        let cmd = runtime.exec_command(&container, &argv, &opts);
        assert_eq!(cmd.as_std().get_program(), "docker");
        assert_eq!(
            args_of(&cmd),
            vec![
                "exec", "-i", "-u", "agent", "-e", "WSE_EXEC_TAG=abc", "-w", "/work", "agent-1",
                "sh", "-c", "echo hi",
            ]
        );
    }

    #[test]
    fn test_docker_exec_without_stdin_is_not_interactive() {
        let runtime = DockerRuntime::new("podman");
        let cmd = runtime.exec_command(
            &ContainerName::from_raw("c"),
            &["true".to_string()],
            &ExecOptions::default(),
        );
        assert_eq!(cmd.as_std().get_program(), "podman");
        assert_eq!(args_of(&cmd), vec!["exec", "c", "true"]);
    }

    #[test]
    fn test_runtime_from_config() {
        let mut config = EngineConfig::default();
        assert_eq!(runtime_from_config(&config).name(), "docker");
        config.runtime.kind = RuntimeKind::Host;
        assert_eq!(runtime_from_config(&config).name(), "host");
    }

    #[tokio::test]
    async fn test_host_runtime_is_always_running() {
        HostRuntime::new()
            .ensure_running(&ContainerName::from_raw("anything"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_runtime_binary() {
        let runtime = DockerRuntime::new("wse-definitely-not-a-binary");
        let err = runtime
            .ensure_running(&ContainerName::from_raw("c"))
            .await
            .unwrap_err();
        assert!(matches!(err, DockerError::RuntimeUnavailable(_)));
    }
}
