//! Sandboxed page context
//!
//! The runner lives inside a minimal document on its own engine worker.
//! Nothing is callable until the page has been built and has posted
//! `loaded` on its `state` channel.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::bundle::RunnerBundle;
use super::channels::MessageHandler;
use super::context::{CallTarget, RunnerContext, Transport};
use super::js_bindings::{EngineOptions, BOOTSTRAP_DOCUMENT};
use super::js_runtime::InjectedScript;
use super::js_wrapper::EngineWorker;
use super::marshal::{self, CallOutcome};
use super::ready::{PagePhase, ReadyGate};
use super::types::{PreparedInfo, RunnerIntents, RunnerProfile};
use crate::core::error::{BridgeError, Result};

const PREPARE_SCRIPT: &str = "return prepare(RUNNER.info);";
const INTENTS_SCRIPT: &str = "return RUNNER.intents ?? {};";

/// Releases the ready gate when the page posts `loaded`
struct StateHandler {
    runner: String,
    gate: Arc<ReadyGate>,
}

impl MessageHandler for StateHandler {
    fn did_receive(&self, body: &str) -> Result<()> {
        match body {
            "loaded" => {
                self.gate.mark_ready();
            }
            other => debug!(runner = %self.runner, state = %other, "Ignoring page state"),
        }
        Ok(())
    }
}

pub struct PageContext {
    runner: String,
    bundle: RunnerBundle,
    options: EngineOptions,
    gate: Arc<ReadyGate>,
    worker: Mutex<Option<Arc<EngineWorker>>>,
    injections: AtomicUsize,
}

impl PageContext {
    /// An unbuilt page; the first `ensure_ready` builds it
    pub fn new(bundle: RunnerBundle, options: EngineOptions) -> Self {
        let runner = bundle.id().to_string();
        Self {
            gate: Arc::new(ReadyGate::new(runner.clone())),
            runner,
            bundle,
            options,
            worker: Mutex::new(None),
            injections: AtomicUsize::new(0),
        }
    }

    /// Build the page, wait for it, then pull the runner's profile
    pub async fn open(bundle: RunnerBundle, options: EngineOptions) -> Result<(Self, RunnerProfile)> {
        let context = Self::new(bundle, options);

        let loaded = match context.ensure_ready().await {
            Ok(()) => context.read_profile().await,
            Err(BridgeError::NotReady(_)) => Err(BridgeError::PluginLoad(format!(
                "{}: page did not become ready within {}ms",
                context.runner,
                context.options.ready_timeout.as_millis()
            ))),
            Err(e) => Err(e),
        };

        match loaded {
            Ok(profile) => {
                info!(runner = %context.runner, name = %profile.descriptor.name, "Runner loaded in page context");
                Ok((context, profile))
            }
            Err(e) => {
                context.shutdown().await?;
                Err(e)
            }
        }
    }

    /// How many times the ordered bundles have been injected
    pub fn injection_count(&self) -> usize {
        self.injections.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> PagePhase {
        self.gate.phase()
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<Arc<EngineWorker>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The page worker, once the handshake has completed
    fn ready_worker(&self) -> Result<Arc<EngineWorker>> {
        if self.gate.is_closed() {
            return Err(BridgeError::TornDown(format!("{} page context is closed", self.runner)));
        }
        if !self.gate.is_ready() {
            return Err(BridgeError::NotReady(self.runner.clone()));
        }
        self.worker_slot()
            .clone()
            .ok_or_else(|| BridgeError::NotReady(self.runner.clone()))
    }

    async fn read_profile(&self) -> Result<RunnerProfile> {
        let prepared: PreparedInfo = self.evaluate(PREPARE_SCRIPT).await?;
        let intents: RunnerIntents = self.evaluate(INTENTS_SCRIPT).await?;
        Ok(RunnerProfile {
            descriptor: prepared.descriptor,
            intents,
            config: prepared.config,
        })
    }

    async fn evaluate<T: serde::de::DeserializeOwned>(&self, script: &str) -> Result<T> {
        let load_error = |e: BridgeError| BridgeError::PluginLoad(format!("{}: {}", self.runner, e));

        let outcome = self
            .invoke(CallTarget::Script(script.to_string()), "[]".to_string())
            .await
            .map_err(load_error)?;
        match outcome {
            CallOutcome::Returned(wire) => marshal::decode_required(wire).map_err(|e| load_error(e.into())),
            CallOutcome::Thrown(thrown) => Err(load_error(thrown.into_error(&self.runner))),
            CallOutcome::MissingMethod => Err(load_error(BridgeError::MethodNotFound(script.to_string()))),
        }
    }

    async fn stop_worker(&self) -> Result<()> {
        let worker = self.worker_slot().take();
        if let Some(worker) = worker {
            worker.shutdown().await?;
        }
        Ok(())
    }

    /// Create the worker, register channels and inject the ordered bundles
    async fn build(&self) -> Result<()> {
        let mut channels = self.options.channels(&self.runner);
        channels.add(
            "state",
            Arc::new(StateHandler {
                runner: self.runner.clone(),
                gate: Arc::clone(&self.gate),
            }),
        );

        let worker = Arc::new(EngineWorker::spawn(&self.runner, channels, true, Vec::new()).await?);
        let scripts = vec![
            InjectedScript::new("<commons>", self.options.commons.clone()),
            InjectedScript::new("<runner>", self.bundle.source()?),
            InjectedScript::new("<bridge>", self.options.bridge_shim.clone()),
        ];

        let injected = async {
            worker.inject(scripts).await?;
            self.injections.fetch_add(1, Ordering::SeqCst);
            *self.worker_slot() = Some(Arc::clone(&worker));

            self.gate.mark_loading();
            worker
                .inject(vec![InjectedScript::new("<document>", BOOTSTRAP_DOCUMENT)])
                .await
        };

        if let Err(e) = injected.await {
            warn!(runner = %self.runner, "Page build failed: {}", e);
            self.worker_slot().take();
            worker.shutdown().await?;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl RunnerContext for PageContext {
    fn transport(&self) -> Transport {
        Transport::Page
    }

    async fn ensure_ready(&self) -> Result<()> {
        let result = self
            .gate
            .ensure_ready(self.options.ready_timeout, || self.build())
            .await;
        // A build that raced shutdown leaves a worker behind
        if self.gate.is_closed() {
            self.stop_worker().await?;
        }
        result
    }

    async fn has_method(&self, name: &str) -> Result<bool> {
        self.ready_worker()?.has_method(name).await
    }

    async fn invoke(&self, target: CallTarget, args: String) -> Result<CallOutcome> {
        self.ready_worker()?.invoke(target, args).await
    }

    fn invoke_blocking(&self, _target: CallTarget, _args: String) -> Result<CallOutcome> {
        Err(BridgeError::UnsupportedOperation(format!(
            "{}: synchronous calls need a direct context",
            self.runner
        )))
    }

    async fn shutdown(&self) -> Result<()> {
        self.gate.close();
        self.stop_worker().await
    }
}
