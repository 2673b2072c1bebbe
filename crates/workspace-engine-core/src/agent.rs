//! Agent identity and container name resolution.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default prefix for agent container names.
pub const DEFAULT_CONTAINER_PREFIX: &str = "agent-";

/// Opaque identity of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create an agent id from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Uuid> for AgentId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable name of the container owned by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerName(String);

impl ContainerName {
    /// Wrap an already-known container name without resolution.
    #[must_use]
    pub fn from_raw(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ContainerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps agent identities to container names.
///
/// Resolution is pure: the same agent always yields the same name. Characters
/// the container runtime rejects are replaced with `-`; when that happens, or
/// when the id already ends like a hash suffix, a hash of the original id is
/// appended so distinct agents never collide.
#[derive(Debug, Clone)]
pub struct SessionResolver {
    prefix: String,
}

impl Default for SessionResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CONTAINER_PREFIX)
    }
}

impl SessionResolver {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Resolve the container name for an agent.
    #[must_use]
    pub fn resolve(&self, agent: &AgentId) -> ContainerName {
        let raw = agent.as_str();
        let sanitized: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();

        let name = if sanitized.is_empty() {
            format!("{}unnamed-{:08x}", self.prefix, fnv1a(raw.as_bytes()))
        } else if sanitized == raw && !has_hash_suffix(raw) {
            format!("{}{sanitized}", self.prefix)
        } else {
            format!("{}{sanitized}-{:08x}", self.prefix, fnv1a(raw.as_bytes()))
        };
        ContainerName(name)
    }
}

// FNV-1a, 32 bit. Stable across builds, unlike `DefaultHasher`.
pub(crate) fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5_u32, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(0x0100_0193)
    })
}

/// True if `name` ends in `-` plus 8 lowercase hex digits, the shape of an
/// appended hash. Such names are hashed again so a raw id can never pose as
/// the hashed form of another.
pub(crate) fn has_hash_suffix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 9
        && bytes[bytes.len() - 9] == b'-'
        && bytes[bytes.len() - 8..]
            .iter()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_agent_same_name() {
        let resolver = SessionResolver::default();
        let agent = AgentId::new("agent-42");
        assert_eq!(resolver.resolve(&agent), resolver.resolve(&agent.clone()));
        assert_eq!(resolver.resolve(&agent).as_str(), "agent-agent-42");
    }

    #[test]
    fn test_uuid_agent_is_kept_verbatim() {
        let id = Uuid::new_v4();
        let name = SessionResolver::new("ws-").resolve(&AgentId::from(id));
        assert_eq!(name.as_str(), format!("ws-{id}"));
    }

    #[test]
    fn test_sanitized_ids_do_not_collide() {
        let resolver = SessionResolver::default();
        let a = resolver.resolve(&AgentId::new("team a"));
        let b = resolver.resolve(&AgentId::new("team/a"));
        let c = resolver.resolve(&AgentId::new("team-a"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("agent-team-a-"));
        assert!(!a.as_str().contains(' '));
    }

    #[test]
    fn test_raw_id_cannot_mimic_hashed_name() {
        let resolver = SessionResolver::default();
        let hashed = resolver.resolve(&AgentId::new("team a"));
        let suffix = hashed.as_str().trim_start_matches("agent-");
        assert_eq!(suffix.len(), "team-a-".len() + 8);

        let mimic = resolver.resolve(&AgentId::new(suffix));
        assert_ne!(hashed, mimic);
        assert_eq!(mimic, resolver.resolve(&AgentId::new(suffix)));
    }

    #[test]
    fn test_hash_suffix_shape() {
        assert!(has_hash_suffix("x-0badcafe"));
        assert!(!has_hash_suffix("x-0BADCAFE"));
        assert!(!has_hash_suffix("x_0badcafe"));
        assert!(!has_hash_suffix("0badcafe"));
        assert!(!has_hash_suffix(&Uuid::new_v4().to_string()));
    }

    #[test]
    fn test_empty_agent_id() {
        let name = SessionResolver::default().resolve(&AgentId::new(""));
        assert!(name.as_str().starts_with("agent-unnamed-"));
    }
}
