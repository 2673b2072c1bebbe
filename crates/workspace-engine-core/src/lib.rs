//! Core abstractions for running work inside agent containers.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionResolver` - Agent id to container name mapping
//! - `ContainerRuntime` - How argv becomes a process attached to a container
//! - `SpawnedProcess` - Spawn, wait and terminate with process-group cleanup
//! - `EventStore` - Broadcast + history for terminal subscribers
//! - `CommandExecutor` and `SessionTokenStore` traits
//! - `EngineConfig` - TOML configuration with environment overrides

pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod event_store;
pub mod process;
pub mod runtime;
pub mod traits;

pub use agent::{AgentId, ContainerName, DEFAULT_CONTAINER_PREFIX, SessionResolver};
pub use config::{ConfigError, EngineConfig};
pub use context::ConversationContext;
pub use error::{BoxError, DockerError, ExecError, TokenStoreError};
pub use event_store::{EventStore, TerminalEvent, TerminalSubscription};
pub use process::SpawnedProcess;
pub use runtime::{ContainerRuntime, DockerRuntime, HostRuntime, runtime_from_config};
pub use traits::{
    CommandExecutor, ExecutionRequest, ExecutionResult, LineHandler, SessionTokenStore,
};
