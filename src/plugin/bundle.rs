//! On-disk runner bundles
//!
//! A bundle is a directory holding a `runner.json` manifest and the script
//! entry it names.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::context::{RunnerContext, Transport};
use super::direct::DirectContext;
use super::js_bindings::EngineOptions;
use super::page::PageContext;
use super::runner::ContextFactory;
use super::types::RunnerProfile;
use crate::core::error::{BridgeError, ErrorContext, Result};

/// Manifest file name inside a bundle directory
pub const MANIFEST: &str = "runner.json";

fn default_entry() -> String {
    "runner.js".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerManifest {
    pub id: String,
    pub name: String,
    pub version: f64,
    #[serde(default = "default_entry")]
    pub entry: String,
    /// Execution mode; selects the transport
    #[serde(default)]
    pub environment: Transport,
}

#[derive(Debug, Clone)]
pub struct RunnerBundle {
    dir: PathBuf,
    manifest: RunnerManifest,
}

impl RunnerBundle {
    /// Read and validate the manifest in `dir`
    pub fn read(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join(MANIFEST);
        let raw = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("Failed to read {}", manifest_path.display()))?;
        let manifest: RunnerManifest = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid manifest {}", manifest_path.display()))?;

        let bundle = Self {
            dir: dir.to_path_buf(),
            manifest,
        };
        bundle.validate()?;
        debug!(runner = %bundle.manifest.id, dir = %dir.display(), "Read runner manifest");
        Ok(bundle)
    }

    fn validate(&self) -> Result<()> {
        if self.manifest.id.trim().is_empty() {
            return Err(BridgeError::PluginLoad(format!(
                "{}: manifest id is empty",
                self.dir.display()
            )));
        }

        let entry = Path::new(&self.manifest.entry);
        let escapes = entry
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(BridgeError::PluginLoad(format!(
                "{}: entry {} must be a relative path inside the bundle",
                self.manifest.id, self.manifest.entry
            )));
        }

        if !self.entry_path().is_file() {
            return Err(BridgeError::PluginLoad(format!(
                "{}: entry {} does not exist",
                self.manifest.id, self.manifest.entry
            )));
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &RunnerManifest {
        &self.manifest
    }

    pub fn transport(&self) -> Transport {
        self.manifest.environment
    }

    pub fn entry_path(&self) -> PathBuf {
        self.dir.join(&self.manifest.entry)
    }

    /// The bundle's script source
    pub fn source(&self) -> Result<String> {
        let path = self.entry_path();
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
    }
}

/// Opens fresh contexts for a bundle, with the transport its manifest declares
pub struct BundleFactory {
    bundle: RunnerBundle,
    options: EngineOptions,
}

impl BundleFactory {
    pub fn new(bundle: RunnerBundle, options: EngineOptions) -> Self {
        Self { bundle, options }
    }

    pub fn bundle(&self) -> &RunnerBundle {
        &self.bundle
    }
}

#[async_trait]
impl ContextFactory for BundleFactory {
    async fn open(&self) -> Result<(Arc<dyn RunnerContext>, RunnerProfile)> {
        // Re-read so a reload picks up a changed manifest
        let bundle = RunnerBundle::read(self.bundle.dir())?;
        match bundle.transport() {
            Transport::Direct => {
                let (context, profile) = DirectContext::open(&bundle, &self.options).await?;
                Ok((Arc::new(context) as Arc<dyn RunnerContext>, profile))
            }
            Transport::Page => {
                let (context, profile) = PageContext::open(bundle, self.options.clone()).await?;
                Ok((Arc::new(context) as Arc<dyn RunnerContext>, profile))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a bundle directory and return its path
    pub(crate) fn write_bundle(root: &Path, id: &str, environment: &str, source: &str) -> PathBuf {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(MANIFEST),
            format!(
                r#"{{"id":"{}","name":"{}","version":1,"environment":"{}"}}"#,
                id, id, environment
            ),
        )
        .unwrap();
        std::fs::write(dir.join("runner.js"), source).unwrap();
        dir
    }

    #[test]
    fn test_manifest_defaults() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("plain");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST), r#"{"id":"plain","name":"Plain","version":1.5}"#).unwrap();
        std::fs::write(dir.join("runner.js"), "const RUNNER = {};").unwrap();

        let bundle = RunnerBundle::read(&dir).unwrap();
        assert_eq!(bundle.manifest().entry, "runner.js");
        assert_eq!(bundle.transport(), Transport::Direct);
        assert_eq!(bundle.source().unwrap(), "const RUNNER = {};");
    }

    #[test]
    fn test_page_environment() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_bundle(root.path(), "paged", "page", "const RUNNER = {};");
        assert_eq!(RunnerBundle::read(&dir).unwrap().transport(), Transport::Page);
    }

    #[test]
    fn test_invalid_bundles() {
        let root = tempfile::tempdir().unwrap();

        let missing = root.path().join("missing");
        assert!(matches!(RunnerBundle::read(&missing), Err(BridgeError::PluginLoad(_))));

        let escaping = root.path().join("escaping");
        std::fs::create_dir_all(&escaping).unwrap();
        std::fs::write(
            escaping.join(MANIFEST),
            r#"{"id":"escaping","name":"E","version":1,"entry":"../outside.js"}"#,
        )
        .unwrap();
        let err = RunnerBundle::read(&escaping).unwrap_err();
        assert!(err.to_string().contains("relative path"));

        let no_entry = root.path().join("no-entry");
        std::fs::create_dir_all(&no_entry).unwrap();
        std::fs::write(no_entry.join(MANIFEST), r#"{"id":"no-entry","name":"N","version":1}"#).unwrap();
        let err = RunnerBundle::read(&no_entry).unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        let blank = root.path().join("blank");
        std::fs::create_dir_all(&blank).unwrap();
        std::fs::write(blank.join(MANIFEST), r#"{"id":" ","name":"B","version":1}"#).unwrap();
        assert!(RunnerBundle::read(&blank).unwrap_err().to_string().contains("id is empty"));
    }
}
