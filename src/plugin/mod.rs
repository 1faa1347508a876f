//! Runner bridge
//!
//! Loads JavaScript runner bundles into embedded engines and exposes them
//! through one capability-typed handle:
//! - Value marshaling and method dispatch
//! - Direct and page-hosted engine contexts
//! - Ready handshake and pending-call registry
//! - Message channels for logging, networking and storage
//! - Runner manager for loading, reloading and unloading bundles

pub mod bundle;
pub mod capability;
pub mod channels;
pub mod context;
pub mod direct;
pub mod dispatcher;
pub mod js_bindings;
pub mod js_runtime;
pub mod js_wrapper;
pub mod manager;
pub mod marshal;
pub mod page;
pub mod pending;
pub mod ready;
pub mod runner;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use bundle::{BundleFactory, RunnerBundle, RunnerManifest};
pub use capability::Capability;
pub use channels::{KeyValueStore, MemoryKeyValueStore, MessageChannels};
pub use context::{CallTarget, RunnerContext, Transport};
pub use direct::DirectContext;
pub use dispatcher::MethodDispatcher;
pub use js_bindings::EngineOptions;
pub use manager::RunnerManager;
pub use page::PageContext;
pub use runner::{ContextFactory, RunnerHandle};
pub use types::{RunnerDescriptor, RunnerId, RunnerIntents, RunnerProfile};
