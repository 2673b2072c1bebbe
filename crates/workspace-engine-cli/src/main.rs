//! `wse`: run commands, streams, shells and provider turns inside agent containers.

mod shell;

use std::{
    io::Write,
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workspace_engine_core::{
    AgentId, BoxError, CommandExecutor, ConversationContext, EngineConfig, ExecutionRequest,
};
use workspace_engine_executor::{ChatMessage, ContainerExecutor, ProviderAdapter};
use workspace_engine_session::ContainerTokenStore;

/// Exit status used when a command is cut short by its timeout.
const TIMEOUT_EXIT: u8 = 124;

#[derive(Debug, Parser)]
#[command(name = "wse", version, about = "Workspace execution engine")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent whose container is targeted.
    #[arg(long, short, global = true)]
    agent: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the agent's container name.
    Resolve,
    /// Run a command to completion and print its output.
    Exec {
        /// Timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// File whose contents are sent on stdin.
        #[arg(long)]
        stdin_file: Option<PathBuf>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Run a command, printing output lines as they arrive.
    Stream {
        /// Timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Open an interactive shell.
    Shell {
        /// Command typed once the first prompt appears.
        #[arg(long)]
        init: Option<String>,
    },
    /// Run one provider turn.
    Ask {
        #[arg(long)]
        model: Option<String>,
        /// Conversation to resume and continue.
        #[arg(long)]
        conversation: Option<String>,
        /// System instructions for the provider.
        #[arg(long)]
        system: Option<String>,
        prompt: String,
    },
}

impl Cli {
    fn agent(&self) -> anyhow::Result<AgentId> {
        match self.agent.as_deref() {
            Some(agent) if !agent.trim().is_empty() => Ok(AgentId::new(agent)),
            _ => bail!("--agent is required"),
        }
    }
}

/// Map a remote exit code onto this process's exit status.
fn exit_status(code: Option<i32>) -> u8 {
    code.map_or(1, |code| u8::try_from(code).unwrap_or(1))
}

pub(crate) fn exit_code(code: Option<i32>) -> ExitCode {
    ExitCode::from(exit_status(code))
}

fn timeout_or(secs: Option<u64>, default: Duration) -> Duration {
    secs.map_or(default, Duration::from_secs)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let agent = cli.agent()?;
    let container = config.resolver().resolve(&agent);

    match cli.command {
        Command::Resolve => {
            println!("{container}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Exec {
            timeout,
            stdin_file,
            command,
        } => {
            let timeout = timeout_or(timeout, config.execution.default_timeout());
            let mut request = ExecutionRequest::new(command.join(" "), timeout);
            if let Some(path) = stdin_file {
                let stdin = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                request = request.with_stdin(stdin);
            }

            let result = ContainerExecutor::from_config(&config)
                .execute(&container, request)
                .await?;
            std::io::stdout().write_all(&result.stdout)?;
            if result.timed_out {
                eprintln!("wse: timed out after {}s", timeout.as_secs());
                return Ok(ExitCode::from(TIMEOUT_EXIT));
            }
            Ok(exit_code(result.exit_code))
        }
        Command::Stream { timeout, command } => {
            let timeout = timeout_or(timeout, config.execution.default_timeout());
            let request = ExecutionRequest::new(command.join(" "), timeout);
            let mut stdout = std::io::stdout();
            let outcome = ContainerExecutor::from_config(&config)
                .stream(&container, request, &mut |line: &str| {
                    writeln!(stdout, "{line}").map_err(BoxError::from)
                })
                .await;
            match outcome {
                Ok(code) => Ok(exit_code(code)),
                Err(e) if e.is_timeout() => {
                    eprintln!("wse: {e}");
                    Ok(ExitCode::from(TIMEOUT_EXIT))
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Shell { init } => shell::run(&config, &agent, init).await,
        Command::Ask {
            model,
            conversation,
            system,
            prompt,
        } => {
            let executor = Arc::new(ContainerExecutor::from_config(&config));
            let tokens = Arc::new(ContainerTokenStore::new(executor.clone(), config.provider.clone()));
            let adapter = ProviderAdapter::new(executor, tokens, config.provider.clone());

            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(prompt));
            let conversation = conversation.map(ConversationContext::new);

            let mut stdout = std::io::stdout();
            let mut streamed = false;
            let response = adapter
                .generate(
                    &container,
                    &messages,
                    model.as_deref(),
                    conversation.as_ref(),
                    &mut |text: &str| {
                        streamed = true;
                        let _ = write!(stdout, "{text}");
                        let _ = stdout.flush();
                    },
                )
                .await?;
            match response.content {
                Some(content) if !streamed => println!("{content}"),
                Some(_) => println!(),
                None => eprintln!("wse: the provider returned no content"),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exec_takes_trailing_command() {
        let cli = Cli::try_parse_from(["wse", "--agent", "a1", "exec", "--timeout", "5", "--", "ls", "-la"]).unwrap();
        assert_eq!(cli.agent().unwrap().as_str(), "a1");
        match cli.command {
            Command::Exec { timeout, command, .. } => {
                assert_eq!(timeout, Some(5));
                assert_eq!(command, vec!["ls", "-la"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_agent_is_required() {
        let cli = Cli::try_parse_from(["wse", "resolve"]).unwrap();
        assert!(cli.agent().is_err());
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_status(Some(0)), 0);
        assert_eq!(exit_status(Some(3)), 3);
        assert_eq!(exit_status(Some(-1)), 1);
        assert_eq!(exit_status(Some(300)), 1);
        assert_eq!(exit_status(None), 1);
    }
}
