//! Conversation context for provider turns.

use serde::{Deserialize, Serialize};

use crate::agent::{fnv1a, has_hash_suffix};

/// Logical conversation a provider turn belongs to.
///
/// The conversation id namespaces the continuity token persisted inside the
/// container, so two conversations of the same agent never share a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: String,
}

impl ConversationContext {
    #[must_use]
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
        }
    }

    /// File name used for this conversation's token.
    ///
    /// Anything outside `[A-Za-z0-9._-]` becomes `_`, and names made only of
    /// dots are prefixed so they can never walk out of the session directory.
    /// A rewritten id gets a hash of the original appended, so distinct
    /// conversations never share a file.
    #[must_use]
    pub fn file_stem(&self) -> String {
        let stem: String = self
            .conversation_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if stem.is_empty() || stem.chars().all(|c| c == '.') {
            format!("_{stem}")
        } else if stem != self.conversation_id || has_hash_suffix(&stem) {
            format!("{stem}-{:08x}", fnv1a(self.conversation_id.as_bytes()))
        } else {
            stem
        }
    }
}
