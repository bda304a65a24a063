//! Seams to the external plugin loader. The coordinator only knows how to
//! ask for a loaded module's metadata and to materialize handlers from it;
//! parsing and validating real plugin modules happens gateway-side.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;

use crate::facade::Facade;

/// One configured, running copy of a plugin, invoked by phase name.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    /// Run one phase to completion. Host calls go through the facade and
    /// block until the gateway core resumes the event with a result.
    async fn run(&self, phase: &str, facade: Facade) -> anyhow::Result<()>;

    /// Cleanup hook invoked when the instance is closed.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Produces a fresh handler from a decoded instance configuration.
pub trait PluginFactory: Send + Sync {
    fn instantiate(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn PhaseHandler>>;
}

/// Everything the loader extracts from one plugin module.
pub struct LoadedPlugin {
    pub phases: Vec<String>,
    pub priority: i32,
    pub schema: serde_json::Value,
    pub factory: Arc<dyn PluginFactory>,
}

/// Parses and validates plugin modules from disk. Production loaders live
/// outside this workspace; [`crate::scripted::ScriptedLoader`] is the
/// bundled one.
pub trait PluginLoader: Send + Sync {
    /// File extensions (without the dot) this loader recognizes.
    fn extensions(&self) -> &[&str];

    fn load(&self, name: &str, path: &Path) -> anyhow::Result<LoadedPlugin>;
}
