//! Engine configuration.
//!
//! Loaded from an optional TOML file, then overridden by `WSE_*` environment
//! variables. Every section has defaults, so an empty file is valid.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::{DEFAULT_CONTAINER_PREFIX, SessionResolver};

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "WSE_";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid override {key}={value}")]
    InvalidOverride { key: String, value: String },
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Which container runtime executes commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// `docker exec` (or a CLI-compatible binary such as podman).
    #[default]
    Docker,
    /// Run directly on the host. Development and tests only.
    Host,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    /// Runtime CLI binary.
    pub binary: String,
    /// User passed to `exec -u`.
    pub exec_user: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::Docker,
            binary: "docker".to_string(),
            exec_user: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub prefix: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub default_timeout_secs: u64,
    /// Time between the termination signal and the forced kill.
    pub kill_grace_ms: u64,
    /// Timeout of the container liveness probe.
    pub probe_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 60,
            kill_grace_ms: 2000,
            probe_timeout_secs: 10,
        }
    }
}

impl ExecutionConfig {
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    #[must_use]
    pub const fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub read_chunk_bytes: usize,
    pub term: String,
    /// Shells tried in order inside the container.
    pub shell: Vec<String>,
    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            read_chunk_bytes: 4096,
            term: "xterm-256color".to_string(),
            shell: vec!["bash".to_string(), "sh".to_string()],
            default_cols: 80,
            default_rows: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider CLI invoked inside the container.
    pub binary: String,
    /// Tool config directory; may reference container variables such as `$HOME`.
    pub config_dir: String,
    /// Instruction file name inside `config_dir`.
    pub instructions_file: String,
    /// Directory holding one continuity token file per conversation.
    pub session_dir: String,
    /// Host environment variables exported into the provider command.
    pub secret_env: Vec<String>,
    pub timeout_secs: u64,
    /// Extra arguments appended to every invocation.
    pub extra_args: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            config_dir: "$HOME/.claude".to_string(),
            instructions_file: "CLAUDE.md".to_string(),
            session_dir: "$HOME/.claude/wse-sessions".to_string(),
            secret_env: vec!["ANTHROPIC_API_KEY".to_string()],
            timeout_secs: 600,
            extra_args: Vec::new(),
        }
    }
}

impl ProviderConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Shell expression for the config directory.
    #[must_use]
    pub fn config_dir_expr(&self) -> String {
        expanding_quote(&self.config_dir)
    }

    /// Shell expression for the instruction file.
    #[must_use]
    pub fn instructions_path_expr(&self) -> String {
        expanding_quote(&format!(
            "{}/{}",
            self.config_dir.trim_end_matches('/'),
            self.instructions_file
        ))
    }

    /// Shell expression for the session directory.
    #[must_use]
    pub fn session_dir_expr(&self) -> String {
        expanding_quote(&self.session_dir)
    }

    /// Shell expression for the token file named `stem`.
    #[must_use]
    pub fn session_path_expr(&self, stem: &str) -> String {
        expanding_quote(&format!("{}/{stem}", self.session_dir.trim_end_matches('/')))
    }
}

/// Double-quote `value` for `sh`, leaving `$VAR` references expandable.
fn expanding_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub runtime: RuntimeConfig,
    pub resolver: ResolverConfig,
    pub execution: ExecutionConfig,
    pub terminal: TerminalConfig,
    pub provider: ProviderConfig,
}

impl EngineConfig {
    /// Parse configuration from TOML text.
    ///
    /// # Errors
    /// Returns error if the text is not valid configuration.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load configuration from an optional file plus the process environment.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, an override is
    /// malformed, or the result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                tracing::debug!(path = %path.display(), "Loaded engine config");
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `WSE_*` overrides. Unknown keys are ignored.
    ///
    /// # Errors
    /// Returns error if a recognised key has an unparsable value.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let invalid = || ConfigError::InvalidOverride {
                key: key.clone(),
                value: value.clone(),
            };
            match name {
                "RUNTIME" => {
                    self.runtime.kind = match value.as_str() {
                        "docker" => RuntimeKind::Docker,
                        "host" => RuntimeKind::Host,
                        _ => return Err(invalid()),
                    };
                }
                "RUNTIME_BINARY" => self.runtime.binary.clone_from(&value),
                "EXEC_USER" => self.runtime.exec_user = Some(value.clone()),
                "CONTAINER_PREFIX" => self.resolver.prefix.clone_from(&value),
                "DEFAULT_TIMEOUT_SECS" => {
                    self.execution.default_timeout_secs = value.parse().map_err(|_| invalid())?;
                }
                "KILL_GRACE_MS" => {
                    self.execution.kill_grace_ms = value.parse().map_err(|_| invalid())?;
                }
                "PROVIDER_BINARY" => self.provider.binary.clone_from(&value),
                "PROVIDER_TIMEOUT_SECS" => {
                    self.provider.timeout_secs = value.parse().map_err(|_| invalid())?;
                }
                _ => tracing::trace!(%key, "Ignoring unknown override"),
            }
        }
        Ok(())
    }

    /// Check invariants the executors rely on.
    ///
    /// # Errors
    /// Returns error describing the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid("execution.default_timeout_secs must be > 0".into()));
        }
        if self.provider.timeout_secs == 0 {
            return Err(ConfigError::Invalid("provider.timeout_secs must be > 0".into()));
        }
        if self.terminal.read_chunk_bytes == 0 {
            return Err(ConfigError::Invalid("terminal.read_chunk_bytes must be > 0".into()));
        }
        if self.runtime.binary.trim().is_empty() {
            return Err(ConfigError::Invalid("runtime.binary must not be empty".into()));
        }
        Ok(())
    }

    /// Resolver configured with this config's prefix.
    #[must_use]
    pub fn resolver(&self) -> SessionResolver {
        SessionResolver::new(self.resolver.prefix.clone())
    }
}
