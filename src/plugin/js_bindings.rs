//! Host bindings installed into every runner engine
//!
//! Runner scripts reach the host through three ops: completing a pending
//! call, posting to a message channel and posting to a reply channel.

use deno_core::error::AnyError;
use deno_core::{op2, Extension, JsRuntime, Op, OpState, RuntimeOptions};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::channels::{KeyValueStore, MessageChannels};
use super::marshal;
use super::pending::PendingCalls;
use crate::core::config::BridgeConfig;
use crate::core::error::{BridgeError, Result};

/// Channels, console and call helpers
pub const PRELUDE: &str = include_str!("js/prelude.js");

/// Minimal document for page-hosted runners
pub const PAGE_PRELUDE: &str = include_str!("js/page_prelude.js");

/// Shared shims (`NetworkClient`, `ObjectStore`) injected before a bundle
pub const DEFAULT_COMMONS: &str = include_str!("js/commons.js");

/// `prepare` and the loaded-state post, injected after a page bundle
pub const DEFAULT_BRIDGE_SHIM: &str = include_str!("js/page_bridge.js");

/// Finishes loading the page document, firing the `load` listeners
pub const BOOTSTRAP_DOCUMENT: &str = "__page.finishLoading();";

/// What every runner engine is built with
#[derive(Clone)]
pub struct EngineOptions {
    pub commons: String,
    pub bridge_shim: String,
    pub http: reqwest::Client,
    pub store: Arc<dyn KeyValueStore>,
    pub ready_timeout: Duration,
}

impl EngineOptions {
    /// Built-in scripts and a default HTTP client
    pub fn builtin(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            commons: DEFAULT_COMMONS.to_string(),
            bridge_shim: DEFAULT_BRIDGE_SHIM.to_string(),
            http: reqwest::Client::new(),
            store,
            ready_timeout: Duration::from_secs(15),
        }
    }

    pub fn from_config(config: &BridgeConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.network_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| BridgeError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            commons: read_override(config.commons_path.as_deref(), DEFAULT_COMMONS)?,
            bridge_shim: read_override(config.bridge_shim_path.as_deref(), DEFAULT_BRIDGE_SHIM)?,
            http,
            store,
            ready_timeout: config.ready_timeout(),
        })
    }

    /// The standard channel set for `runner`
    pub fn channels(&self, runner: &str) -> MessageChannels {
        MessageChannels::standard(runner, self.http.clone(), Arc::clone(&self.store))
    }
}

fn read_override(path: Option<&Path>, builtin: &str) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read script {}: {}", path.display(), e))
        }),
        None => Ok(builtin.to_string()),
    }
}

#[op2]
pub fn op_bridge_resolve(
    state: &mut OpState,
    call_id: u32,
    #[string] envelope: String,
) -> std::result::Result<(), AnyError> {
    let calls = state.borrow::<Arc<PendingCalls>>();
    let outcome = marshal::parse_envelope(&envelope).map_err(BridgeError::from);
    calls.resolve(call_id, outcome);
    Ok(())
}

#[op2]
pub fn op_post_message(
    state: &mut OpState,
    #[string] channel: String,
    #[string] body: String,
) -> std::result::Result<(), AnyError> {
    let channels = state.borrow::<Arc<MessageChannels>>();
    channels.post(&channel, &body)?;
    Ok(())
}

#[op2(async)]
#[string]
pub async fn op_post_message_reply(
    state: Rc<RefCell<OpState>>,
    #[string] channel: String,
    #[string] body: String,
) -> std::result::Result<String, AnyError> {
    let channels = state.borrow().borrow::<Arc<MessageChannels>>().clone();
    debug!(channel = %channel, "Runner posted a reply message");
    Ok(channels.request(&channel, body).await?)
}

/// Create an engine with the host ops and the prelude installed
pub fn create_runner_runtime(
    calls: Arc<PendingCalls>,
    channels: Arc<MessageChannels>,
    page: bool,
) -> Result<JsRuntime> {
    let ext = Extension {
        name: "runner_bridge",
        ops: std::borrow::Cow::Borrowed(&[
            op_bridge_resolve::DECL,
            op_post_message::DECL,
            op_post_message_reply::DECL,
        ]),
        ..Default::default()
    };

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![ext],
        ..Default::default()
    });

    {
        let op_state = runtime.op_state();
        let mut op_state = op_state.borrow_mut();
        op_state.put(calls);
        op_state.put(channels);
    }

    runtime
        .execute_script("<prelude>", PRELUDE.to_string().into())
        .map_err(|e| BridgeError::Engine(format!("Failed to install prelude: {}", e)))?;

    if page {
        runtime
            .execute_script("<page_prelude>", PAGE_PRELUDE.to_string().into())
            .map_err(|e| BridgeError::Engine(format!("Failed to install page document: {}", e)))?;
    }

    Ok(runtime)
}
