//! Command execution inside agent containers.
//!
//! Provides:
//! - `ContainerExecutor` - bounded and streaming execution with timeouts
//! - Command building utilities
//! - The provider stream protocol and session adapter

pub mod command;
pub mod exec;
pub mod provider;

pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use exec::ContainerExecutor;
pub use provider::{ChatMessage, ProviderAdapter, ProviderError, ProviderEvent, ProviderResponse, Role};
