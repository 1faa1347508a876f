//! In-flight runner calls and their single-resolution completion slots

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

use super::marshal::CallOutcome;
use crate::core::error::{BridgeError, Result};

/// Resolves at most once; later attempts report `false`
struct CompletionSlot {
    sender: Option<oneshot::Sender<Result<CallOutcome>>>,
}

impl CompletionSlot {
    fn resolve(&mut self, result: Result<CallOutcome>) -> bool {
        match self.sender.take() {
            Some(sender) => {
                // The waiter may already be gone; the call still counts as resolved
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }
}

/// One invocation waiting for the engine
struct PendingCall {
    method: String,
    args: String,
    slot: CompletionSlot,
}

/// Registry of in-flight calls for one runner, keyed by call id
pub struct PendingCalls {
    runner: String,
    next_id: AtomicU32,
    calls: Mutex<HashMap<u32, PendingCall>>,
}

impl PendingCalls {
    pub fn new(runner: impl Into<String>) -> Self {
        Self {
            runner: runner.into(),
            next_id: AtomicU32::new(1),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn runner(&self) -> &str {
        &self.runner
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<u32, PendingCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call and get the receiver its completion arrives on
    pub fn register(self: &Arc<Self>, method: &str, args: &str) -> PendingReceiver {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();

        self.calls().insert(
            id,
            PendingCall {
                method: method.to_string(),
                args: args.to_string(),
                slot: CompletionSlot { sender: Some(sender) },
            },
        );

        PendingReceiver {
            id,
            receiver,
            calls: Arc::clone(self),
            settled: false,
        }
    }

    /// Deliver the result of call `id`
    ///
    /// Returns `false` when the call is unknown: already resolved, abandoned
    /// by its caller, or cancelled by teardown.
    pub fn resolve(&self, id: u32, result: Result<CallOutcome>) -> bool {
        let call = self.calls().remove(&id);
        match call {
            Some(mut call) => call.slot.resolve(result),
            None => {
                debug!(runner = %self.runner, call_id = id, "Ignoring completion for settled call");
                false
            }
        }
    }

    /// Forget call `id` without resolving it
    pub fn abandon(&self, id: u32) -> bool {
        let removed = self.calls().remove(&id);
        if let Some(call) = &removed {
            debug!(runner = %self.runner, call_id = id, method = %call.method, "Call abandoned by caller");
        }
        removed.is_some()
    }

    /// Resolve every outstanding call with a teardown error
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(u32, PendingCall)> = self.calls().drain().collect();
        let count = drained.len();

        for (id, mut call) in drained {
            debug!(
                runner = %self.runner,
                call_id = id,
                method = %call.method,
                args = %call.args,
                "Cancelling pending call"
            );
            call.slot.resolve(Err(BridgeError::TornDown(format!(
                "{} call {} ({}) cancelled: {}",
                self.runner, id, call.method, reason
            ))));
        }

        count
    }

    pub fn len(&self) -> usize {
        self.calls().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller side of a pending call
///
/// Dropping it before the call settles abandons the call, so a late engine
/// response finds nothing to resolve.
pub struct PendingReceiver {
    id: u32,
    receiver: oneshot::Receiver<Result<CallOutcome>>,
    calls: Arc<PendingCalls>,
    settled: bool,
}

impl PendingReceiver {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the call to settle
    pub async fn wait(mut self) -> Result<CallOutcome> {
        let received = (&mut self.receiver).await;
        self.settled = true;
        received.unwrap_or_else(|_| {
            Err(BridgeError::TornDown(format!(
                "{} call {} dropped by the engine",
                self.calls.runner, self.id
            )))
        })
    }
}

impl Drop for PendingReceiver {
    fn drop(&mut self) {
        if !self.settled {
            self.calls.abandon(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::marshal::WireValue;

    fn text(s: &str) -> Result<CallOutcome> {
        Ok(CallOutcome::Returned(WireValue::Text(s.to_string())))
    }

    #[tokio::test]
    async fn test_resolves_exactly_once() {
        let calls = Arc::new(PendingCalls::new("runner.a"));
        let pending = calls.register("getContent", "[]");
        let id = pending.id();

        assert!(calls.resolve(id, text("1")));
        assert!(!calls.resolve(id, text("2")));
        assert_eq!(pending.wait().await.unwrap(), CallOutcome::Returned(WireValue::Text("1".into())));
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_calls_keep_their_own_slots() {
        let calls = Arc::new(PendingCalls::new("runner.a"));
        let first = calls.register("getContent", r#"["a"]"#);
        let second = calls.register("getContent", r#"["b"]"#);
        assert_ne!(first.id(), second.id());

        // Resolve out of order
        assert!(calls.resolve(second.id(), text("\"b\"")));
        assert!(calls.resolve(first.id(), text("\"a\"")));

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(a.unwrap(), CallOutcome::Returned(WireValue::Text("\"a\"".into())));
        assert_eq!(b.unwrap(), CallOutcome::Returned(WireValue::Text("\"b\"".into())));
    }

    #[tokio::test]
    async fn test_dropped_receiver_abandons_call() {
        let calls = Arc::new(PendingCalls::new("runner.a"));
        let pending = calls.register("getChapters", "[]");
        let id = pending.id();
        drop(pending);

        assert!(calls.is_empty());
        assert!(!calls.resolve(id, text("[]")));
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_with_teardown() {
        let calls = Arc::new(PendingCalls::new("runner.a"));
        let first = calls.register("getContent", "[]");
        let second = calls.register("getChapters", "[]");

        assert_eq!(calls.cancel_all("runner unloaded"), 2);
        assert!(matches!(first.wait().await, Err(BridgeError::TornDown(_))));
        assert!(matches!(second.wait().await, Err(BridgeError::TornDown(_))));
        assert!(calls.is_empty());
    }
}
