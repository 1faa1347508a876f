//! Scripted in-memory runner context for unit tests

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::context::{CallTarget, RunnerContext, Transport};
use super::marshal::{CallOutcome, WireValue};
use super::pending::PendingCalls;
use crate::core::error::{BridgeError, Result, ThrownError};

/// How a scripted method settles
#[derive(Debug, Clone)]
pub enum Scripted {
    Returns(Value),
    ReturnsNull,
    Throws { name: String, message: String },
    ThrowsRaw(Value),
    Unstringifiable,
    /// Returns after a delay, through the pending-call registry
    Delayed(Duration, Value),
    /// Never settles
    Hangs,
}

impl Scripted {
    pub fn throws(name: &str, message: &str) -> Self {
        Scripted::Throws { name: name.to_string(), message: message.to_string() }
    }
}

pub struct ScriptedContext {
    transport: Transport,
    methods: Mutex<HashMap<String, Scripted>>,
    functions: Mutex<HashMap<String, Scripted>>,
    invocations: Mutex<Vec<(String, String)>>,
    calls: Arc<PendingCalls>,
    ready: AtomicBool,
    ready_checks: AtomicUsize,
    late_completions: Arc<AtomicUsize>,
    shutdowns: AtomicUsize,
}

impl ScriptedContext {
    pub fn direct() -> Self {
        Self::with_transport(Transport::Direct, true)
    }

    /// A page context that is not ready until `ensure_ready` runs
    pub fn page() -> Self {
        Self::with_transport(Transport::Page, false)
    }

    fn with_transport(transport: Transport, ready: bool) -> Self {
        Self {
            transport,
            methods: Mutex::new(HashMap::new()),
            functions: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            calls: Arc::new(PendingCalls::new("scripted")),
            ready: AtomicBool::new(ready),
            ready_checks: AtomicUsize::new(0),
            late_completions: Arc::new(AtomicUsize::new(0)),
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub fn method(self, name: &str, behaviour: Scripted) -> Self {
        self.methods.lock().unwrap().insert(name.to_string(), behaviour);
        self
    }

    pub fn function(self, name: &str, behaviour: Scripted) -> Self {
        self.functions.lock().unwrap().insert(name.to_string(), behaviour);
        self
    }

    /// Number of invocations that reached the engine for `name`
    pub fn invocations(&self, name: &str) -> usize {
        self.invocations.lock().unwrap().iter().filter(|(n, _)| n == name).count()
    }

    pub fn last_args(&self, name: &str) -> Option<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, args)| args.clone())
    }

    pub fn total_invocations(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    pub fn ready_checks(&self) -> usize {
        self.ready_checks.load(Ordering::SeqCst)
    }

    /// Completions that arrived after their caller stopped waiting
    pub fn late_completions(&self) -> usize {
        self.late_completions.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    fn lookup(&self, target: &CallTarget) -> Option<Scripted> {
        match target {
            CallTarget::Method(name) => self.methods.lock().unwrap().get(name).cloned(),
            CallTarget::Function(name) => self.functions.lock().unwrap().get(name).cloned(),
            CallTarget::Script(_) => None,
        }
    }

    fn settle_now(behaviour: Scripted) -> CallOutcome {
        match behaviour {
            Scripted::Returns(value) | Scripted::Delayed(_, value) => {
                CallOutcome::Returned(WireValue::Text(value.to_string()))
            }
            Scripted::ReturnsNull => CallOutcome::Returned(WireValue::Null),
            Scripted::Throws { name, message } => CallOutcome::Thrown(ThrownError { name, message }),
            Scripted::ThrowsRaw(value) => CallOutcome::Thrown(ThrownError::from_thrown(&value)),
            Scripted::Unstringifiable => {
                CallOutcome::Returned(WireValue::Unstringifiable("circular structure".to_string()))
            }
            Scripted::Hangs => unreachable!("hanging calls never settle"),
        }
    }
}

#[async_trait]
impl RunnerContext for ScriptedContext {
    fn transport(&self) -> Transport {
        self.transport
    }

    async fn ensure_ready(&self) -> Result<()> {
        self.ready_checks.fetch_add(1, Ordering::SeqCst);
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn has_method(&self, name: &str) -> Result<bool> {
        Ok(self.methods.lock().unwrap().contains_key(name))
    }

    async fn invoke(&self, target: CallTarget, args: String) -> Result<CallOutcome> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(BridgeError::NotReady("scripted".to_string()));
        }

        let Some(behaviour) = self.lookup(&target) else {
            return Ok(CallOutcome::MissingMethod);
        };
        self.invocations.lock().unwrap().push((target.name().to_string(), args.clone()));

        let pending = self.calls.register(target.name(), &args);
        let id = pending.id();
        match behaviour {
            Scripted::Hangs => {}
            Scripted::Delayed(delay, _) => {
                let calls = Arc::clone(&self.calls);
                let late = Arc::clone(&self.late_completions);
                let outcome = Self::settle_now(behaviour);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if !calls.resolve(id, Ok(outcome)) {
                        late.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
            other => {
                self.calls.resolve(id, Ok(Self::settle_now(other)));
            }
        }

        pending.wait().await
    }

    fn invoke_blocking(&self, target: CallTarget, args: String) -> Result<CallOutcome> {
        if self.transport == Transport::Page {
            return Err(BridgeError::UnsupportedOperation(
                "synchronous calls need a direct context".to_string(),
            ));
        }
        let Some(behaviour) = self.lookup(&target) else {
            return Ok(CallOutcome::MissingMethod);
        };
        self.invocations.lock().unwrap().push((target.name().to_string(), args));
        Ok(Self::settle_now(behaviour))
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        self.calls.cancel_all("scripted context shut down");
        Ok(())
    }
}
