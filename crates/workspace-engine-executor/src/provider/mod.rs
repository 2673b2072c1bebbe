//! Provider CLI integration: stream protocol and session adapter.

pub mod adapter;
pub mod protocol;

pub use adapter::{ChatMessage, ProviderAdapter, ProviderError, ProviderResponse, Role, TokenCallback};
pub use protocol::{ProviderEvent, parse_line};
