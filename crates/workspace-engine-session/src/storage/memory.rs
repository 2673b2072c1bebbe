//! In-memory session token storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use workspace_engine_core::{ContainerName, ConversationContext, SessionTokenStore, TokenStoreError};

/// In-memory token store.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart. Keyed by container and conversation id.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<(ContainerName, String), String>>,
}

impl MemoryTokenStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of conversations with a stored token.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn len(&self) -> Result<usize, TokenStoreError> {
        Ok(self
            .tokens
            .read()
            .map_err(|e| TokenStoreError::Internal(e.to_string()))?
            .len())
    }

    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, TokenStoreError> {
        self.len().map(|n| n == 0)
    }
}

#[async_trait]
impl SessionTokenStore for MemoryTokenStore {
    async fn load(
        &self,
        container: &ContainerName,
        conversation: &ConversationContext,
    ) -> Result<Option<String>, TokenStoreError> {
        let key = (container.clone(), conversation.conversation_id.clone());
        Ok(self
            .tokens
            .read()
            .map_err(|e| TokenStoreError::Internal(e.to_string()))?
            .get(&key)
            .cloned())
    }

    async fn save(
        &self,
        container: &ContainerName,
        conversation: &ConversationContext,
        token: &str,
    ) -> Result<(), TokenStoreError> {
        self.tokens
            .write()
            .map_err(|e| TokenStoreError::Internal(e.to_string()))?
            .insert((container.clone(), conversation.conversation_id.clone()), token.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(name: &str) -> ContainerName {
        ContainerName::from_raw(name)
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemoryTokenStore::new();
        let box1 = container("agent-one");
        let conv = ConversationContext::new("c1");
        assert_eq!(store.load(&box1, &conv).await.unwrap(), None);

        store.save(&box1, &conv, "t1").await.unwrap();
        store.save(&box1, &conv, "t2").await.unwrap();
        assert_eq!(store.load(&box1, &conv).await.unwrap().as_deref(), Some("t2"));
        assert_eq!(store.load(&box1, &ConversationContext::new("c2")).await.unwrap(), None);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_conversations_are_isolated() {
        let store = MemoryTokenStore::new();
        let box1 = container("agent-one");
        let a = ConversationContext::new("a");
        let b = ConversationContext::new("b");
        tokio_test::block_on(async {
            tokio_test::assert_ok!(store.save(&box1, &a, "ta").await);
            tokio_test::assert_ok!(store.save(&box1, &b, "tb").await);
            assert_eq!(store.load(&box1, &a).await.unwrap().as_deref(), Some("ta"));
            assert_eq!(store.load(&box1, &b).await.unwrap().as_deref(), Some("tb"));
        });
    }

    #[tokio::test]
    async fn test_same_conversation_in_two_containers() {
        let store = MemoryTokenStore::new();
        let conv = ConversationContext::new("shared");
        store.save(&container("agent-one"), &conv, "t-one").await.unwrap();

        assert_eq!(store.load(&container("agent-two"), &conv).await.unwrap(), None);
        store.save(&container("agent-two"), &conv, "t-two").await.unwrap();
        assert_eq!(
            store.load(&container("agent-one"), &conv).await.unwrap().as_deref(),
            Some("t-one")
        );
        assert_eq!(store.len().unwrap(), 2);
    }
}
