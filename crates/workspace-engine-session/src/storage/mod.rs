//! Session token storage implementations.

pub mod container;
#[cfg(feature = "memory")]
pub mod memory;

pub use container::ContainerTokenStore;
#[cfg(feature = "memory")]
pub use memory::MemoryTokenStore;
