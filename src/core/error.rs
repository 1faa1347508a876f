//! Error type system for the runner bridge
//!
//! This module provides:
//! - A single error enum covering plugin loading, dispatch and marshaling
//! - Marshaling sub-kinds kept distinct from plugin-thrown errors
//! - Stable error type names and retry classification
//! - JSON error reports with trace IDs

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Main error type for the runner bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    // Lifecycle errors
    #[error("Plugin load failed: {0}")]
    PluginLoad(String),

    #[error("Runner not found: {0}")]
    RunnerNotFound(String),

    #[error("Runner {0} is not ready")]
    NotReady(String),

    #[error("Runner torn down: {0}")]
    TornDown(String),

    // Dispatch errors
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Plugin {plugin_id} threw {name}: {message}")]
    PluginThrown {
        plugin_id: String,
        name: String,
        message: String,
    },

    #[error("Call to {method} timed out after {elapsed_ms}ms")]
    Timeout { method: String, elapsed_ms: u64 },

    #[error("Runner {runner} does not advertise {capability}")]
    CapabilityDisabled { runner: String, capability: String },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    // Engine and channel errors
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Store error: {0}")]
    Store(String),

    // System errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Failures converting between native values and the JSON wire text
#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    #[error("Failed to encode arguments: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Plugin returned null where {expected} was required")]
    NullResult { expected: &'static str },

    #[error("Plugin returned a value that could not be stringified: {0}")]
    Unstringifiable(String),

    #[error("Result does not match {expected}: {source}")]
    ShapeMismatch {
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Malformed completion envelope: {0}")]
    Envelope(String),
}

impl BridgeError {
    /// Get the error type name for reports
    pub fn error_type(&self) -> &'static str {
        match self {
            BridgeError::PluginLoad(_) => "PluginLoadError",
            BridgeError::RunnerNotFound(_) => "RunnerNotFound",
            BridgeError::NotReady(_) => "NotReady",
            BridgeError::TornDown(_) => "TornDown",
            BridgeError::MethodNotFound(_) => "MethodNotFound",
            BridgeError::PluginThrown { .. } => "PluginThrownError",
            BridgeError::Timeout { .. } => "Timeout",
            BridgeError::CapabilityDisabled { .. } => "CapabilityDisabled",
            BridgeError::UnsupportedOperation(_) => "UnsupportedOperation",
            BridgeError::Marshal(_) => "MarshalError",
            BridgeError::Engine(_) => "EngineError",
            BridgeError::Network(_) => "NetworkError",
            BridgeError::Store(_) => "StoreError",
            BridgeError::Config(_) => "ConfigError",
            BridgeError::Io(_) => "IoError",
            BridgeError::Validation(_) => "ValidationError",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::NotReady(_) | BridgeError::Timeout { .. } | BridgeError::Network(_)
        )
    }

    /// The plugin id carried by a plugin-thrown error
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            BridgeError::PluginThrown { plugin_id, .. } => Some(plugin_id),
            _ => None,
        }
    }
}

/// Error shape thrown across the plugin boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrownError {
    pub name: String,
    pub message: String,
}

impl ThrownError {
    /// Name used when a plugin throws something without `{name, message}`
    pub const UNKNOWN: &'static str = "UnknownError";

    /// Interpret whatever the plugin threw
    ///
    /// Objects with string `name` and `message` keep them; anything else
    /// becomes an `UnknownError` carrying the raw description.
    pub fn from_thrown(value: &serde_json::Value) -> Self {
        let field = |key: &str| value.get(key).and_then(|v| v.as_str());
        match (field("name"), field("message")) {
            (Some(name), Some(message)) => Self {
                name: name.to_string(),
                message: message.to_string(),
            },
            _ => Self {
                name: Self::UNKNOWN.to_string(),
                message: match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
            },
        }
    }

    /// Attribute the error to a runner
    pub fn into_error(self, plugin_id: &str) -> BridgeError {
        BridgeError::PluginThrown {
            plugin_id: plugin_id.to_string(),
            name: self.name,
            message: self.message,
        }
    }
}

/// JSON report of an error, printed by the CLI
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Error type identifier
    pub error: String,
    /// Human-readable error message
    pub message: String,
    /// Runner the error is attributed to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    pub retryable: bool,
    /// Unique trace ID for this error
    pub trace_id: String,
}

impl ErrorReport {
    /// Create a report from a BridgeError
    pub fn from_error(error: &BridgeError) -> Self {
        Self {
            error: error.error_type().to_string(),
            message: error.to_string(),
            plugin_id: error.plugin_id().map(str::to_string),
            retryable: error.is_retryable(),
            trace_id: Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} (trace_id: {})", self.error, self.message, self.trace_id)
    }
}

/// Result type alias for operations that can fail with BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Context extension trait for turning foreign errors into load failures
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| BridgeError::PluginLoad(format!("{}: {}", context.into(), e)))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| BridgeError::PluginLoad(format!("{}: {}", f(), e)))
    }
}
