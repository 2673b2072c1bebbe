//! Provider session adapter: one AI turn over the streaming executor.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use workspace_engine_core::{
    BoxError, CommandExecutor, ContainerName, ConversationContext, ExecutionRequest,
    SessionTokenStore, config::ProviderConfig,
};

use super::protocol::{ProviderEvent, parse_line};
use crate::command::{CommandBuilder, CommandParts};

/// Timeout for the small file writes around a turn.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Flags asking the provider for line-delimited JSON output.
const STREAM_PARAMS: [&str; 4] = ["-p", "--output-format", "stream-json", "--verbose"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Result of one provider turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderResponse {
    pub content: Option<String>,
    /// Always empty; tools run inside the provider.
    pub tool_calls: Vec<Value>,
    /// Always empty; the stream protocol does not report usage.
    pub usage: HashMap<String, u64>,
}

/// Provider error.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("No user message to send")]
    NoUserMessage,
    #[error("Provider failed: {0}")]
    Failed(String),
}

/// Callback receiving response text as it streams.
pub type TokenCallback<'a> = dyn FnMut(&str) + Send + 'a;

/// Accumulates events of a single turn.
#[derive(Debug, Default)]
struct TurnState {
    session_id: Option<String>,
    content: String,
    result_text: Option<String>,
}

impl TurnState {
    fn apply(&mut self, event: ProviderEvent, on_token: &mut TokenCallback<'_>) {
        match event {
            ProviderEvent::Session { session_id } => {
                if self.session_id.is_none() {
                    self.session_id = session_id.filter(|id| !id.is_empty());
                }
            }
            ProviderEvent::Content { text } => {
                if !text.is_empty() {
                    on_token(&text);
                    self.content.push_str(&text);
                }
            }
            ProviderEvent::Result { text, session_id } => {
                if self.session_id.is_none() {
                    self.session_id = session_id.filter(|id| !id.is_empty());
                }
                if self.content.is_empty() && self.result_text.is_none() {
                    self.result_text = text.filter(|t| !t.is_empty());
                }
            }
        }
    }

    fn into_content(self) -> Option<String> {
        if self.content.is_empty() {
            self.result_text
        } else {
            Some(self.content)
        }
    }
}

/// Blank and `default` model identifiers mean "let the provider choose".
fn resolve_model(model: Option<&str>) -> Option<&str> {
    model
        .map(str::trim)
        .filter(|m| !m.is_empty() && !m.eq_ignore_ascii_case("default"))
}

/// Runs provider turns inside a container, resuming upstream sessions per conversation.
pub struct ProviderAdapter {
    executor: Arc<dyn CommandExecutor>,
    tokens: Arc<dyn SessionTokenStore>,
    config: ProviderConfig,
    secrets: Vec<(String, String)>,
}

impl ProviderAdapter {
    /// Create an adapter, reading the configured secrets from the host environment.
    ///
    /// Variables that are unset or empty are skipped.
    #[must_use]
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        tokens: Arc<dyn SessionTokenStore>,
        config: ProviderConfig,
    ) -> Self {
        let secrets = config
            .secret_env
            .iter()
            .filter_map(|name| {
                std::env::var(name)
                    .ok()
                    .filter(|value| !value.is_empty())
                    .map(|value| (name.clone(), value))
            })
            .collect();
        Self {
            executor,
            tokens,
            config,
            secrets,
        }
    }

    /// Replace the exported secrets.
    #[must_use]
    pub fn with_secrets(mut self, secrets: Vec<(String, String)>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Build the provider command line.
    ///
    /// # Errors
    /// Returns error if the configured binary cannot be parsed.
    pub fn build_command(&self, model: Option<&str>, resume: Option<&str>) -> Result<CommandParts, ProviderError> {
        let mut builder = CommandBuilder::new(&self.config.binary).params(STREAM_PARAMS);
        if let Some(model) = resolve_model(model) {
            builder = builder.extend_params(["--model", model]);
        }
        builder = builder
            .extend_params(self.config.extra_args.iter().cloned())
            .exports(self.secrets.iter().cloned());

        let built = match resume {
            Some(token) => builder.build_follow_up(&["--resume".to_string(), token.to_string()]),
            None => builder.build_initial(),
        };
        built.map_err(|e| ProviderError::Failed(e.to_string()))
    }

    /// Run one turn.
    ///
    /// The leading system message, if any, is written to the provider's
    /// instruction file. The last user message is sent on stdin. With a
    /// conversation, the stored continuity token is resumed and the new one
    /// saved afterwards.
    ///
    /// # Errors
    /// Returns [`ProviderError::NoUserMessage`] without spawning anything if
    /// there is no user message, and [`ProviderError::Failed`] for any
    /// execution failure.
    pub async fn generate(
        &self,
        container: &ContainerName,
        messages: &[ChatMessage],
        model: Option<&str>,
        conversation: Option<&ConversationContext>,
        on_token: &mut TokenCallback<'_>,
    ) -> Result<ProviderResponse, ProviderError> {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .ok_or(ProviderError::NoUserMessage)?;

        if let Some(system) = messages.first().filter(|m| m.role == Role::System) {
            self.write_instructions(container, &system.content).await?;
        }

        let resume = match conversation {
            Some(conv) => self
                .tokens
                .load(container, conv)
                .await
                .map_err(|e| ProviderError::Failed(e.to_string()))?,
            None => None,
        };

        let command = self.build_command(model, resume.as_deref())?;
        info!(
            container = %container,
            conversation = conversation.map(|c| c.conversation_id.as_str()),
            resume = resume.is_some(),
            command = %command.redacted(),
            "Starting provider turn"
        );
        let line = command
            .to_shell_line()
            .map_err(|e| ProviderError::Failed(e.to_string()))?;
        let request = ExecutionRequest::new(line, self.config.timeout()).with_stdin(prompt.content.as_bytes());

        let mut state = TurnState::default();
        let mut handler = |line: &str| -> Result<(), BoxError> {
            if let Some(event) = parse_line(line) {
                state.apply(event, on_token);
            }
            Ok(())
        };
        let exit_code = self
            .executor
            .stream(container, request, &mut handler)
            .await
            .map_err(|e| ProviderError::Failed(e.to_string()))?;
        if exit_code != Some(0) {
            warn!(container = %container, ?exit_code, "Provider exited abnormally");
        }

        if let (Some(session_id), Some(conv)) = (state.session_id.as_deref(), conversation) {
            if let Err(e) = self.tokens.save(container, conv, session_id).await {
                warn!(
                    container = %container,
                    conversation = %conv.conversation_id,
                    error = %e,
                    "Failed to persist session token"
                );
            } else {
                debug!(conversation = %conv.conversation_id, "Persisted session token");
            }
        }

        Ok(ProviderResponse {
            content: state.into_content(),
            ..ProviderResponse::default()
        })
    }

    async fn write_instructions(&self, container: &ContainerName, instructions: &str) -> Result<(), ProviderError> {
        let command = format!(
            "mkdir -p {} && cat > {}",
            self.config.config_dir_expr(),
            self.config.instructions_path_expr()
        );
        let request = ExecutionRequest::new(command, IO_TIMEOUT).with_stdin(instructions.as_bytes());
        let result = self
            .executor
            .execute(container, request)
            .await
            .map_err(|e| ProviderError::Failed(e.to_string()))?;
        if result.success() {
            Ok(())
        } else {
            Err(ProviderError::Failed(format!(
                "writing instructions failed (exit {:?}): {}",
                result.exit_code,
                result.stderr_tail_lossy().trim()
            )))
        }
    }
}
