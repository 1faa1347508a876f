use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::core::error::{BridgeError, Result};
use crate::plugin::bundle::{BundleFactory, RunnerBundle, MANIFEST};
use crate::plugin::js_bindings::EngineOptions;
use crate::plugin::runner::RunnerHandle;
use crate::plugin::types::{RunnerDescriptor, RunnerId};

/// Registry of loaded runners, keyed by descriptor id
pub struct RunnerManager {
    options: EngineOptions,
    call_timeout: Option<Duration>,
    runners: RwLock<HashMap<RunnerId, Arc<RunnerHandle>>>,
}

impl RunnerManager {
    pub fn new(options: EngineOptions, call_timeout: Option<Duration>) -> Self {
        Self {
            options,
            call_timeout,
            runners: RwLock::new(HashMap::new()),
        }
    }

    /// Load every sub-directory of `dir` that holds a manifest
    ///
    /// Bundles that fail to load are logged and skipped.
    pub async fn discover(&self, dir: &Path) -> Result<Vec<RunnerId>> {
        info!("Discovering runners in {}", dir.display());
        let mut discovered = Vec::new();

        if !dir.exists() {
            warn!("Runner directory {} does not exist", dir.display());
            return Ok(discovered);
        }

        let mut read_dir = tokio::fs::read_dir(dir).await?;
        let mut candidates = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.is_dir() && path.join(MANIFEST).exists() {
                candidates.push(path);
            }
        }
        candidates.sort();

        for path in candidates {
            match self.load(&path).await {
                Ok(handle) => discovered.push(handle.id().to_string()),
                Err(e) => error!("Failed to load runner from {}: {}", path.display(), e),
            }
        }

        info!(count = discovered.len(), "Runner discovery finished");
        Ok(discovered)
    }

    /// Load the bundle in `dir` with the transport its manifest declares
    pub async fn load(&self, dir: &Path) -> Result<Arc<RunnerHandle>> {
        let bundle = RunnerBundle::read(dir)?;
        let manifest_id = bundle.id().to_string();

        if self.runners.read().await.contains_key(&manifest_id) {
            return Err(BridgeError::Validation(format!("Runner {} is already loaded", manifest_id)));
        }

        info!(runner = %manifest_id, transport = ?bundle.transport(), "Loading runner");
        let factory = BundleFactory::new(bundle, self.options.clone());
        let handle = RunnerHandle::open(Box::new(factory), self.call_timeout).await?;

        if handle.id() != manifest_id {
            let reported = handle.id().to_string();
            handle.shutdown().await?;
            return Err(BridgeError::PluginLoad(format!(
                "Manifest id {} does not match runner id {}",
                manifest_id, reported
            )));
        }

        let handle = Arc::new(handle);
        let mut runners = self.runners.write().await;
        if runners.contains_key(&manifest_id) {
            drop(runners);
            handle.shutdown().await?;
            return Err(BridgeError::Validation(format!("Runner {} is already loaded", manifest_id)));
        }
        runners.insert(manifest_id.clone(), Arc::clone(&handle));

        let descriptor = handle.descriptor();
        info!(runner = %manifest_id, name = %descriptor.name, version = descriptor.version, "Runner loaded");
        Ok(handle)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<RunnerHandle>> {
        self.runners
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::RunnerNotFound(id.to_string()))
    }

    /// Loaded ids, sorted
    pub async fn ids(&self) -> Vec<RunnerId> {
        let mut ids: Vec<RunnerId> = self.runners.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn descriptors(&self) -> Vec<RunnerDescriptor> {
        let runners = self.runners.read().await;
        let mut descriptors: Vec<RunnerDescriptor> = runners.values().map(|h| h.descriptor()).collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    pub async fn reload(&self, id: &str) -> Result<()> {
        info!(runner = %id, "Reloading runner");
        let handle = self.get(id).await?;
        handle.reload().await.map_err(|e| {
            error!(runner = %id, error = %e, "Failed to reload runner");
            e
        })
    }

    pub async fn unload(&self, id: &str) -> Result<()> {
        let handle = self
            .runners
            .write()
            .await
            .remove(id)
            .ok_or_else(|| BridgeError::RunnerNotFound(id.to_string()))?;
        handle.shutdown().await?;
        info!(runner = %id, "Runner unloaded");
        Ok(())
    }

    /// Unload every runner; failures are logged
    pub async fn shutdown_all(&self) {
        let drained: Vec<(RunnerId, Arc<RunnerHandle>)> = self.runners.write().await.drain().collect();
        for (id, handle) in drained {
            if let Err(e) = handle.shutdown().await {
                warn!(runner = %id, error = %e, "Runner did not shut down cleanly");
            }
        }
    }
}
