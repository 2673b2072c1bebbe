//! Interactive PTY sessions inside agent containers.
//!
//! Provides:
//! - `TerminalSession` - a shell bridged through a pseudo-terminal
//! - Shell selection for containers with unknown shells

pub mod session;
pub mod shell;

pub use session::{TerminalError, TerminalId, TerminalOptions, TerminalSession, TerminalState};
pub use shell::{ContainerShell, interactive_argv};
