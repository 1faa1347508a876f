//! Runner Bridge Library
//!
//! Hosts untrusted JavaScript content runners for the reader: loads their
//! bundles into embedded engines, enforces their advertised capabilities and
//! exposes every runner operation as a typed async call.

pub mod cache;
pub mod core;
pub mod plugin;

// Re-export commonly used types
pub use crate::core::{BridgeError, Config};
pub use plugin::{RunnerHandle, RunnerManager};

/// Host version runners are checked against
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias for the library
pub type Result<T> = crate::core::error::Result<T>;
