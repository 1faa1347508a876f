//! Core application layer
//!
//! - Configuration management
//! - Structured logging
//! - Error handling and type system
//! - Content services built on loaded runners

pub mod config;
pub mod error;
pub mod logging;
pub mod services;

pub use config::Config;
pub use error::{BridgeError, ErrorContext, ErrorReport, Result};
pub use logging::Logger;
pub use services::{ContentService, ContentStore, ProgressStore, RunnerTracker, TrackerClient};
