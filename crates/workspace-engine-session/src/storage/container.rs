//! Token storage inside the agent's container.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::debug;
use workspace_engine_core::{
    CommandExecutor, ContainerName, ConversationContext, ExecError, ExecutionRequest,
    ExecutionResult, SessionTokenStore, TokenStoreError, config::ProviderConfig,
};

const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Stores one token file per conversation under the provider's session
/// directory of whichever container ran the turn, so tokens live exactly
/// as long as that container's filesystem.
pub struct ContainerTokenStore {
    executor: Arc<dyn CommandExecutor>,
    config: ProviderConfig,
}

impl ContainerTokenStore {
    #[must_use]
    pub fn new(executor: Arc<dyn CommandExecutor>, config: ProviderConfig) -> Self {
        Self { executor, config }
    }

    async fn run(
        &self,
        container: &ContainerName,
        request: ExecutionRequest,
        action: &str,
    ) -> Result<ExecutionResult, TokenStoreError> {
        let result = self.executor.execute(container, request).await?;
        if result.timed_out {
            return Err(ExecError::Timeout { timeout: IO_TIMEOUT }.into());
        }
        if !result.success() {
            return Err(TokenStoreError::Internal(format!(
                "{action} token failed (exit {:?}): {}",
                result.exit_code,
                result.stderr_tail_lossy().trim()
            )));
        }
        Ok(result)
    }
}

#[async_trait]
impl SessionTokenStore for ContainerTokenStore {
    async fn load(
        &self,
        container: &ContainerName,
        conversation: &ConversationContext,
    ) -> Result<Option<String>, TokenStoreError> {
        let path = self.config.session_path_expr(&conversation.file_stem());
        let command = format!("if [ -f {path} ]; then cat {path}; fi");
        let result = self
            .run(container, ExecutionRequest::new(command, IO_TIMEOUT), "reading")
            .await?;

        let token = result.stdout_lossy().trim().to_string();
        debug!(
            container = %container,
            conversation = %conversation.conversation_id,
            found = !token.is_empty(),
            "Loaded session token"
        );
        Ok(Some(token).filter(|t| !t.is_empty()))
    }

    async fn save(
        &self,
        container: &ContainerName,
        conversation: &ConversationContext,
        token: &str,
    ) -> Result<(), TokenStoreError> {
        let command = format!(
            "mkdir -p {} && cat > {}",
            self.config.session_dir_expr(),
            self.config.session_path_expr(&conversation.file_stem())
        );
        let request = ExecutionRequest::new(command, IO_TIMEOUT).with_stdin(token.as_bytes());
        self.run(container, request, "writing").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use workspace_engine_core::HostRuntime;
    use workspace_engine_executor::ContainerExecutor;

    use super::*;

    fn store(home: &std::path::Path) -> ContainerTokenStore {
        let runtime = HostRuntime::new().with_env("HOME", home.to_string_lossy());
        let executor = ContainerExecutor::new(Arc::new(runtime));
        ContainerTokenStore::new(Arc::new(executor), ProviderConfig::default())
    }

    fn container() -> ContainerName {
        ContainerName::from_raw("agent-test")
    }

    fn session_files(home: &std::path::Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(home.join(".claude/wse-sessions"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_round_trip() {
        let home = tempfile::tempdir().unwrap();
        let store = store(home.path());
        let conv = ConversationContext::new("conv-1");

        assert_eq!(store.load(&container(), &conv).await.unwrap(), None);

        store.save(&container(), &conv, "session-abc").await.unwrap();
        assert_eq!(
            store.load(&container(), &conv).await.unwrap().as_deref(),
            Some("session-abc")
        );

        store.save(&container(), &conv, "session-def").await.unwrap();
        assert_eq!(
            store.load(&container(), &conv).await.unwrap().as_deref(),
            Some("session-def")
        );

        let on_disk = std::fs::read_to_string(home.path().join(".claude/wse-sessions/conv-1")).unwrap();
        assert_eq!(on_disk, "session-def");
    }

    #[tokio::test]
    async fn test_conversation_ids_cannot_escape() {
        let home = tempfile::tempdir().unwrap();
        let store = store(home.path());
        let conv = ConversationContext::new("../../evil id");

        store.save(&container(), &conv, "t").await.unwrap();
        assert_eq!(store.load(&container(), &conv).await.unwrap().as_deref(), Some("t"));

        let files = session_files(home.path());
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with(".._.._evil_id-"));
    }

    #[tokio::test]
    async fn test_rewritten_ids_keep_separate_files() {
        let home = tempfile::tempdir().unwrap();
        let store = store(home.path());
        let slashed = ConversationContext::new("a/b");
        let plain = ConversationContext::new("a_b");

        store.save(&container(), &slashed, "t-slashed").await.unwrap();
        assert_eq!(store.load(&container(), &plain).await.unwrap(), None);

        store.save(&container(), &plain, "t-plain").await.unwrap();
        assert_eq!(
            store.load(&container(), &slashed).await.unwrap().as_deref(),
            Some("t-slashed")
        );
        assert_eq!(
            store.load(&container(), &plain).await.unwrap().as_deref(),
            Some("t-plain")
        );
        assert_eq!(session_files(home.path()).len(), 2);
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let home = tempfile::tempdir().unwrap();
        // A file where the session directory should be.
        std::fs::create_dir_all(home.path().join(".claude")).unwrap();
        std::fs::write(home.path().join(".claude/wse-sessions"), "").unwrap();

        let err = store(home.path())
            .save(&container(), &ConversationContext::new("c"), "t")
            .await
            .unwrap_err();
        assert!(matches!(err, TokenStoreError::Internal(_)));
    }
}
