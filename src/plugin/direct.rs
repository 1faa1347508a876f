//! Direct engine context
//!
//! The bundle is evaluated into a fresh engine at construction; the runner
//! is callable as soon as `open` returns.

use async_trait::async_trait;
use tracing::info;

use super::bundle::RunnerBundle;
use super::context::{CallTarget, RunnerContext, Transport};
use super::js_bindings::EngineOptions;
use super::js_runtime::InjectedScript;
use super::js_wrapper::EngineWorker;
use super::marshal::{self, CallOutcome};
use super::types::RunnerProfile;
use crate::core::error::{BridgeError, Result};

pub struct DirectContext {
    worker: EngineWorker,
}

impl DirectContext {
    /// Evaluate shared shims then the bundle, and read the runner's profile
    pub async fn open(bundle: &RunnerBundle, options: &EngineOptions) -> Result<(Self, RunnerProfile)> {
        let runner = bundle.id();
        let boot = vec![
            InjectedScript::new("<commons>", options.commons.clone()),
            InjectedScript::new("<runner>", bundle.source()?),
        ];

        let worker = EngineWorker::spawn(runner, options.channels(runner), false, boot).await?;
        let context = Self { worker };

        match context.read_profile().await {
            Ok(profile) => {
                info!(runner = %runner, name = %profile.descriptor.name, "Runner loaded in direct context");
                Ok((context, profile))
            }
            Err(e) => {
                context.worker.shutdown().await?;
                Err(e)
            }
        }
    }

    async fn read_profile(&self) -> Result<RunnerProfile> {
        let runner = self.worker.runner();
        let described = self.worker.describe().await.map_err(|e| match e {
            BridgeError::Engine(message) => BridgeError::PluginLoad(format!("{}: {}", runner, message)),
            other => other,
        })?;
        marshal::decode(&described)
            .map_err(|e| BridgeError::PluginLoad(format!("{}: invalid runner info: {}", runner, e)))
    }
}

#[async_trait]
impl RunnerContext for DirectContext {
    fn transport(&self) -> Transport {
        Transport::Direct
    }

    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn has_method(&self, name: &str) -> Result<bool> {
        self.worker.has_method(name).await
    }

    async fn invoke(&self, target: CallTarget, args: String) -> Result<CallOutcome> {
        self.worker.invoke(target, args).await
    }

    fn invoke_blocking(&self, target: CallTarget, args: String) -> Result<CallOutcome> {
        self.worker.invoke_blocking(target, args)
    }

    async fn shutdown(&self) -> Result<()> {
        self.worker.shutdown().await
    }
}
