//! Terminal session registry and session token storage.
//!
//! Provides:
//! - `TerminalManager` - Create, look up and terminate terminal sessions
//! - Token storage implementations (container, memory)

pub mod manager;
pub mod storage;

pub use manager::{ManagerError, TerminalManager};
pub use storage::ContainerTokenStore;
#[cfg(feature = "memory")]
pub use storage::MemoryTokenStore;
