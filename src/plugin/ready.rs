//! Ready handshake for page-hosted runners
//!
//! A page context starts uninitialized. The first caller that needs it
//! builds the page; every concurrent caller waits on the same build, and
//! everyone is released when the page posts its loaded state.

use futures::future::{FutureExt, Shared};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePhase {
    Uninitialized,
    /// Scripts are being injected
    Building,
    /// Scripts are in; waiting for the page to post `loaded`
    AwaitingReady,
    Ready,
    /// Shut down for good; never rebuilt
    Closed,
}

struct GateState {
    phase: PagePhase,
    /// Resolves when the page becomes ready; `Err` means the build was abandoned
    waiter: Option<Shared<oneshot::Receiver<()>>>,
    signal: Option<oneshot::Sender<()>>,
}

pub struct ReadyGate {
    runner: String,
    state: Mutex<GateState>,
}

/// Resets the gate if the build future is dropped or fails before the page is ready
struct BuildGuard<'a> {
    gate: &'a ReadyGate,
    armed: bool,
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.reset();
        }
    }
}

impl ReadyGate {
    pub fn new(runner: impl Into<String>) -> Self {
        Self {
            runner: runner.into(),
            state: Mutex::new(GateState {
                phase: PagePhase::Uninitialized,
                waiter: None,
                signal: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> PagePhase {
        self.state().phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == PagePhase::Ready
    }

    /// Wait until the page is ready, running `build` if nobody has yet
    ///
    /// Only the first caller since the last reset runs `build`; the rest
    /// wait on the same handshake. `timeout` bounds the whole wait.
    pub async fn ensure_ready<F, Fut>(&self, timeout: Duration, build: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let (waiter, builds) = {
            let mut state = self.state();
            match state.phase {
                PagePhase::Ready => return Ok(()),
                PagePhase::Closed => return Err(self.torn_down()),
                PagePhase::Uninitialized => {
                    let (signal, receiver) = oneshot::channel();
                    let waiter = receiver.shared();
                    state.phase = PagePhase::Building;
                    state.waiter = Some(waiter.clone());
                    state.signal = Some(signal);
                    (waiter, true)
                }
                PagePhase::Building | PagePhase::AwaitingReady => match &state.waiter {
                    Some(waiter) => (waiter.clone(), false),
                    None => return Err(BridgeError::NotReady(self.runner.clone())),
                },
            }
        };

        let handshake = async {
            if builds {
                let mut guard = BuildGuard { gate: self, armed: true };
                debug!(runner = %self.runner, "Building page context");
                build().await?;
                self.mark_loading();
                if waiter.clone().await.is_ok() {
                    guard.armed = false;
                    return Ok(());
                }
            } else if waiter.await.is_ok() {
                return Ok(());
            }
            Err(self.abandoned())
        };

        match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result,
            Err(_) => {
                warn!(runner = %self.runner, timeout_ms = timeout.as_millis() as u64, "Page never became ready");
                Err(self.abandoned())
            }
        }
    }

    fn torn_down(&self) -> BridgeError {
        BridgeError::TornDown(format!("{} page context is closed", self.runner))
    }

    fn abandoned(&self) -> BridgeError {
        if self.phase() == PagePhase::Closed {
            self.torn_down()
        } else {
            BridgeError::NotReady(self.runner.clone())
        }
    }

    /// Scripts are injected; the page may now post its loaded state
    pub fn mark_loading(&self) {
        let mut state = self.state();
        if state.phase == PagePhase::Building {
            state.phase = PagePhase::AwaitingReady;
        }
    }

    /// The page posted `loaded`; releases every waiter
    ///
    /// Returns `false` when no build is in progress.
    pub fn mark_ready(&self) -> bool {
        let mut state = self.state();
        match state.phase {
            PagePhase::Building | PagePhase::AwaitingReady => {
                state.phase = PagePhase::Ready;
                if let Some(signal) = state.signal.take() {
                    let _ = signal.send(());
                }
                debug!(runner = %self.runner, "Page context ready");
                true
            }
            PagePhase::Ready => true,
            PagePhase::Uninitialized | PagePhase::Closed => {
                debug!(runner = %self.runner, "Ignoring loaded state outside a build");
                false
            }
        }
    }

    /// Back to uninitialized; current waiters fail and the next caller rebuilds
    ///
    /// A closed gate stays closed.
    pub fn reset(&self) {
        let mut state = self.state();
        if state.phase != PagePhase::Closed {
            state.phase = PagePhase::Uninitialized;
        }
        state.waiter = None;
        state.signal = None;
    }

    /// Close the gate; current waiters and every later caller get a teardown error
    pub fn close(&self) {
        let mut state = self.state();
        state.phase = PagePhase::Closed;
        state.waiter = None;
        state.signal = None;
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == PagePhase::Closed
    }
}
