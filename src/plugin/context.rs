//! The seam both transports implement

use async_trait::async_trait;
use std::fmt;

use super::marshal::CallOutcome;
use crate::core::error::Result;

/// Which bridging strategy hosts a runner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// In-process engine context with direct function handles
    #[default]
    Direct,
    /// Document-hosted runner behind a ready handshake
    Page,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Direct => f.write_str("direct"),
            Transport::Page => f.write_str("page"),
        }
    }
}

/// What an invocation addresses inside the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// A method of the `RUNNER` object
    Method(String),
    /// A top-level function of the evaluation context
    Function(String),
    /// A function body evaluated in the page, e.g. `return prepare(RUNNER.info)`
    Script(String),
}

impl CallTarget {
    /// Tag the engine-side helper dispatches on
    pub fn kind(&self) -> &'static str {
        match self {
            CallTarget::Method(_) => "method",
            CallTarget::Function(_) => "function",
            CallTarget::Script(_) => "script",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CallTarget::Method(name) | CallTarget::Function(name) => name,
            CallTarget::Script(_) => "<script>",
        }
    }

    /// Text handed to the engine helper: the name, or the script body
    pub fn payload(&self) -> &str {
        match self {
            CallTarget::Method(name) | CallTarget::Function(name) | CallTarget::Script(name) => name,
        }
    }
}

/// A loaded runner's evaluation context
///
/// Implementations own exactly one engine and marshal every interaction
/// onto its serialized execution queue.
#[async_trait]
pub trait RunnerContext: Send + Sync {
    fn transport(&self) -> Transport;

    /// Resolve once the context can accept calls
    async fn ensure_ready(&self) -> Result<()>;

    /// Whether `RUNNER[name]` is a function
    async fn has_method(&self, name: &str) -> Result<bool>;

    /// Invoke `target` with a JSON array of positional arguments
    async fn invoke(&self, target: CallTarget, args: String) -> Result<CallOutcome>;

    /// Invoke without suspension; only direct contexts support this
    fn invoke_blocking(&self, target: CallTarget, args: String) -> Result<CallOutcome>;

    /// Tear the engine down, resolving outstanding calls with a teardown error
    async fn shutdown(&self) -> Result<()>;
}
