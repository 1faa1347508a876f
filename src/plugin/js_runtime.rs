//! One runner's Deno Core engine
//!
//! Not `Send`: a `RunnerRuntime` lives on its engine worker thread and is
//! only ever driven from there.

use deno_core::{v8, JsRuntime, PollEventLoopOptions};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::debug;

use super::channels::MessageChannels;
use super::context::CallTarget;
use super::js_bindings::create_runner_runtime;
use super::marshal::{self, CallOutcome};
use super::pending::PendingCalls;
use crate::core::error::{BridgeError, Result};

/// Global object the prelude installs its helpers on
const BRIDGE_GLOBAL: &str = "__bridge";

/// A script evaluated into the engine under a static name
#[derive(Debug, Clone)]
pub struct InjectedScript {
    pub name: &'static str,
    pub source: String,
}

impl InjectedScript {
    pub fn new(name: &'static str, source: impl Into<String>) -> Self {
        Self {
            name,
            source: source.into(),
        }
    }
}

pub struct RunnerRuntime {
    runtime: JsRuntime,
    runner: String,
}

impl RunnerRuntime {
    pub fn new(
        runner: &str,
        calls: Arc<PendingCalls>,
        channels: Arc<MessageChannels>,
        page: bool,
    ) -> Result<Self> {
        debug!(runner = %runner, page, "Creating runner engine");
        Ok(Self {
            runtime: create_runner_runtime(calls, channels, page)?,
            runner: runner.to_string(),
        })
    }

    /// Evaluate a script; failures are load failures
    pub fn execute(&mut self, script: &InjectedScript) -> Result<()> {
        debug!(runner = %self.runner, script = script.name, "Injecting script");
        self.runtime
            .execute_script(script.name, script.source.clone().into())
            .map_err(|e| {
                BridgeError::PluginLoad(format!("{}: {} failed: {}", self.runner, script.name, e))
            })?;
        Ok(())
    }

    /// Start an asynchronous call; its completion arrives through `op_bridge_resolve`
    pub fn begin_call(&mut self, call_id: u32, target: &CallTarget, args: &str) -> Result<()> {
        let id = call_id.to_string();
        self.call_bridge_helper("invoke", &[&id, target.kind(), target.payload(), args])?;
        Ok(())
    }

    /// Run a call to completion without returning to the event loop
    pub fn call_now(&mut self, target: &CallTarget, args: &str) -> Result<CallOutcome> {
        let envelope = self
            .call_bridge_helper("invokeSync", &[target.kind(), target.payload(), args])?
            .ok_or_else(|| BridgeError::Engine("invokeSync produced no envelope".to_string()))?;
        Ok(marshal::parse_envelope(&envelope)?)
    }

    pub fn has_method(&mut self, name: &str) -> Result<bool> {
        Ok(self.call_bridge_helper("hasMethod", &[name])?.as_deref() == Some("true"))
    }

    /// `{info, intents, config}` of the loaded `RUNNER`, as JSON text
    pub fn describe(&mut self) -> Result<String> {
        self.call_bridge_helper("describe", &[])?
            .ok_or_else(|| BridgeError::PluginLoad(format!("{}: describe returned nothing", self.runner)))
    }

    pub fn poll_event_loop(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), anyhow::Error>> {
        self.runtime.poll_event_loop(cx, PollEventLoopOptions::default())
    }

    /// Call `__bridge[helper]` with string arguments
    fn call_bridge_helper(&mut self, helper: &str, args: &[&str]) -> Result<Option<String>> {
        let scope = &mut self.runtime.handle_scope();
        let context = scope.get_current_context();
        let global = context.global(scope);

        let bridge_key = v8_string(scope, BRIDGE_GLOBAL)?;
        let bridge = global
            .get(scope, bridge_key.into())
            .and_then(|value| v8::Local::<v8::Object>::try_from(value).ok())
            .ok_or_else(|| BridgeError::Engine("bridge helpers are not installed".to_string()))?;

        let helper_key = v8_string(scope, helper)?;
        let func = bridge
            .get(scope, helper_key.into())
            .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
            .ok_or_else(|| BridgeError::Engine(format!("{} is not a bridge helper", helper)))?;

        let mut argv: Vec<v8::Local<v8::Value>> = Vec::with_capacity(args.len());
        for arg in args {
            argv.push(v8_string(scope, arg)?.into());
        }

        let scope = &mut v8::TryCatch::new(scope);
        match func.call(scope, bridge.into(), &argv) {
            Some(value) if value.is_null_or_undefined() => Ok(None),
            Some(value) => Ok(Some(value.to_rust_string_lossy(scope))),
            None => {
                let exception = scope.exception();
                let message = match exception {
                    Some(exception) => exception.to_rust_string_lossy(scope),
                    None => "execution terminated".to_string(),
                };
                Err(BridgeError::Engine(format!("{} failed: {}", helper, message)))
            }
        }
    }
}

fn v8_string<'s>(scope: &mut v8::HandleScope<'s>, text: &str) -> Result<v8::Local<'s, v8::String>> {
    v8::String::new(scope, text)
        .ok_or_else(|| BridgeError::Engine("string too large for the engine".to_string()))
}
