//! Method dispatch over a runner context
//!
//! The dispatcher is transport-agnostic: it encodes arguments, applies the
//! per-call timeout, attributes thrown errors to the runner and decodes the
//! result into the caller's type.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::context::{CallTarget, RunnerContext};
use super::marshal::{self, CallOutcome, WireValue};
use crate::core::error::{BridgeError, Result};

pub struct MethodDispatcher {
    runner_id: String,
    context: Arc<dyn RunnerContext>,
    call_timeout: Option<Duration>,
}

impl MethodDispatcher {
    pub fn new(
        runner_id: impl Into<String>,
        context: Arc<dyn RunnerContext>,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            runner_id: runner_id.into(),
            context,
            call_timeout,
        }
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    pub fn context(&self) -> &Arc<dyn RunnerContext> {
        &self.context
    }

    /// Whether the runner implements `name`
    pub async fn method_exists(&self, name: &str) -> Result<bool> {
        self.context.has_method(name).await
    }

    /// Call a method whose result is ignored; a missing method is a no-op
    pub async fn call_void(&self, name: &str, args: &[Value]) -> Result<()> {
        match self.settle(CallTarget::Method(name.to_string()), args).await? {
            Some(_) => Ok(()),
            None => {
                debug!(runner = %self.runner_id, method = %name, "Skipping unimplemented method");
                Ok(())
            }
        }
    }

    /// Call a method that must exist and return a `T`
    pub async fn call_returning<T: DeserializeOwned>(&self, name: &str, args: &[Value]) -> Result<T> {
        let wire = self.settle_existing(CallTarget::Method(name.to_string()), args).await?;
        Ok(marshal::decode_required(wire)?)
    }

    /// Call a method that must exist; null or undefined becomes `None`
    pub async fn call_optional<T: DeserializeOwned>(&self, name: &str, args: &[Value]) -> Result<Option<T>> {
        let wire = self.settle_existing(CallTarget::Method(name.to_string()), args).await?;
        Ok(marshal::decode_optional(wire)?)
    }

    /// Call a method without suspending; only direct contexts support this
    pub fn call_synchronous<T: DeserializeOwned>(&self, name: &str, args: &[Value]) -> Result<T> {
        let encoded = marshal::encode_arguments(args)?;
        debug!(runner = %self.runner_id, method = %name, "Dispatching synchronous runner call");

        let outcome = self
            .context
            .invoke_blocking(CallTarget::Method(name.to_string()), encoded)?;
        let wire = self
            .interpret(name, outcome)?
            .ok_or_else(|| BridgeError::MethodNotFound(name.to_string()))?;
        Ok(marshal::decode_required(wire)?)
    }

    /// Call a top-level function of the evaluation context
    pub async fn call_context<T: DeserializeOwned>(&self, function: &str, args: &[Value]) -> Result<T> {
        let wire = self.settle_existing(CallTarget::Function(function.to_string()), args).await?;
        Ok(marshal::decode_required(wire)?)
    }

    /// Call a top-level function whose result is ignored; missing is a no-op
    pub async fn call_context_void(&self, function: &str, args: &[Value]) -> Result<()> {
        self.settle(CallTarget::Function(function.to_string()), args)
            .await
            .map(|_| ())
    }

    async fn settle_existing(&self, target: CallTarget, args: &[Value]) -> Result<WireValue> {
        let name = target.name().to_string();
        self.settle(target, args)
            .await?
            .ok_or(BridgeError::MethodNotFound(name))
    }

    /// Invoke `target`; `None` means it does not exist
    async fn settle(&self, target: CallTarget, args: &[Value]) -> Result<Option<WireValue>> {
        let encoded = marshal::encode_arguments(args)?;
        let method = target.name().to_string();
        debug!(runner = %self.runner_id, method = %method, "Dispatching runner call");

        let started = Instant::now();
        let invocation = self.context.invoke(target, encoded);
        let outcome = match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, invocation).await.map_err(|_| {
                warn!(runner = %self.runner_id, method = %method, "Runner call timed out");
                BridgeError::Timeout {
                    method: method.clone(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
            })??,
            None => invocation.await?,
        };

        self.interpret(&method, outcome)
    }

    fn interpret(&self, method: &str, outcome: CallOutcome) -> Result<Option<WireValue>> {
        match outcome {
            CallOutcome::Returned(wire) => Ok(Some(wire)),
            CallOutcome::MissingMethod => Ok(None),
            CallOutcome::Thrown(thrown) => {
                warn!(
                    runner = %self.runner_id,
                    method = %method,
                    error = %thrown.name,
                    "Runner call threw: {}",
                    thrown.message
                );
                Err(thrown.into_error(&self.runner_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::MarshalError;
    use crate::plugin::testing::{Scripted, ScriptedContext};
    use serde_json::json;

    fn dispatcher(context: ScriptedContext, timeout: Option<Duration>) -> (MethodDispatcher, Arc<ScriptedContext>) {
        let context = Arc::new(context);
        let dispatcher = MethodDispatcher::new("runner.test", context.clone(), timeout);
        (dispatcher, context)
    }

    #[tokio::test]
    async fn test_missing_method_void_vs_returning() {
        let (dispatcher, context) = dispatcher(ScriptedContext::direct(), None);

        assert!(!dispatcher.method_exists("onChapterRead").await.unwrap());
        dispatcher.call_void("onChapterRead", &[json!("c1")]).await.unwrap();
        assert_eq!(context.total_invocations(), 0);

        let err = dispatcher.call_returning::<Value>("getContent", &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::MethodNotFound(name) if name == "getContent"));
    }

    #[tokio::test]
    async fn test_returning_decodes_and_passes_arguments() {
        let (dispatcher, context) = dispatcher(
            ScriptedContext::direct().method("getChapters", Scripted::Returns(json!([1, 2, 3]))),
            None,
        );

        let chapters: Vec<u32> = dispatcher.call_returning("getChapters", &[json!("content-9")]).await.unwrap();
        assert_eq!(chapters, vec![1, 2, 3]);
        assert_eq!(context.last_args("getChapters").as_deref(), Some(r#"["content-9"]"#));
    }

    #[tokio::test]
    async fn test_thrown_error_is_attributed() {
        let (dispatcher, _) = dispatcher(
            ScriptedContext::direct().method("getContent", Scripted::throws("X", "Y")),
            None,
        );

        let err = dispatcher.call_returning::<Value>("getContent", &[]).await.unwrap_err();
        match err {
            BridgeError::PluginThrown { plugin_id, name, message } => {
                assert_eq!(plugin_id, "runner.test");
                assert_eq!(name, "X");
                assert!(message.contains('Y'));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_void_still_propagates_throws() {
        let (dispatcher, _) = dispatcher(
            ScriptedContext::direct().method("onChapterRead", Scripted::ThrowsRaw(json!("bad"))),
            None,
        );

        let err = dispatcher.call_void("onChapterRead", &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::PluginThrown { name, .. } if name == "UnknownError"));
    }

    #[tokio::test]
    async fn test_decode_failures_are_not_plugin_errors() {
        let (dispatcher, _) = dispatcher(
            ScriptedContext::direct()
                .method("getUser", Scripted::ReturnsNull)
                .method("getCycle", Scripted::Unstringifiable),
            None,
        );

        let err = dispatcher.call_returning::<String>("getUser", &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Marshal(MarshalError::NullResult { .. })));

        let none: Option<String> = dispatcher.call_optional("getUser", &[]).await.unwrap();
        assert_eq!(none, None);

        let err = dispatcher.call_returning::<Value>("getCycle", &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Marshal(MarshalError::Unstringifiable(_))));
    }

    #[tokio::test]
    async fn test_concurrent_calls_resolve_independently() {
        let (dispatcher, _) = dispatcher(
            ScriptedContext::direct()
                .method("slow", Scripted::Delayed(Duration::from_millis(40), json!("slow")))
                .method("fast", Scripted::Delayed(Duration::from_millis(5), json!("fast"))),
            None,
        );

        let (slow, fast) = tokio::join!(
            dispatcher.call_returning::<String>("slow", &[]),
            dispatcher.call_returning::<String>("fast", &[]),
        );
        assert_eq!(slow.unwrap(), "slow");
        assert_eq!(fast.unwrap(), "fast");
    }

    #[tokio::test]
    async fn test_timeout_tolerates_late_response() {
        let (dispatcher, context) = dispatcher(
            ScriptedContext::direct().method("getContent", Scripted::Delayed(Duration::from_millis(80), json!({}))),
            Some(Duration::from_millis(10)),
        );

        let err = dispatcher.call_returning::<Value>("getContent", &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { ref method, .. } if method == "getContent"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(context.late_completions(), 1);
    }

    #[tokio::test]
    async fn test_synchronous_path() {
        let (dispatcher, _) = dispatcher(
            ScriptedContext::direct().method("getReaderContext", Scripted::Returns(json!({"page": 3}))),
            None,
        );
        let value: Value = dispatcher.call_synchronous("getReaderContext", &[]).unwrap();
        assert_eq!(value, json!({"page": 3}));

        let err = dispatcher.call_synchronous::<Value>("missing", &[]).unwrap_err();
        assert!(matches!(err, BridgeError::MethodNotFound(_)));

        let (page, _) = dispatcher_page();
        let err = page.call_synchronous::<Value>("getReaderContext", &[]).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedOperation(_)));
    }

    fn dispatcher_page() -> (MethodDispatcher, Arc<ScriptedContext>) {
        dispatcher(
            ScriptedContext::page().method("getReaderContext", Scripted::Returns(json!({}))),
            None,
        )
    }

    #[tokio::test]
    async fn test_context_functions() {
        let (dispatcher, context) = dispatcher(
            ScriptedContext::direct()
                .function("generatePreferenceMenu", Scripted::Returns(json!([]))),
            None,
        );

        let menu: Vec<Value> = dispatcher.call_context("generatePreferenceMenu", &[]).await.unwrap();
        assert!(menu.is_empty());
        assert_eq!(context.invocations("generatePreferenceMenu"), 1);

        dispatcher.call_context_void("updateSourcePreferences", &[json!("k"), json!(1)]).await.unwrap();
        let err = dispatcher.call_context::<Value>("updateSourcePreferences", &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::MethodNotFound(_)));
    }
}
