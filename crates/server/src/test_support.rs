//! Shared fixtures for the crate's unit tests.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;

use crate::{
    facade::Facade,
    loader::{LoadedPlugin, PhaseHandler, PluginFactory, PluginLoader},
    registry::PluginRegistry,
};

/// Loader stub: every `*.plug` file becomes a plugin with the given phases
/// and factory, except files named `broken*`, which refuse to load.
pub struct StubLoader {
    pub phases: Vec<String>,
    pub factory: Arc<dyn PluginFactory>,
}

impl PluginLoader for StubLoader {
    fn extensions(&self) -> &[&str] {
        &["plug"]
    }

    fn load(&self, name: &str, _path: &Path) -> anyhow::Result<LoadedPlugin> {
        if name.starts_with("broken") {
            anyhow::bail!("deliberately unloadable");
        }
        Ok(LoadedPlugin {
            phases: self.phases.clone(),
            priority: 100,
            schema: serde_json::json!({}),
            factory: Arc::clone(&self.factory),
        })
    }
}

/// Factory handing out the same handler for any config.
pub struct FixedFactory(pub Arc<dyn PhaseHandler>);

impl PluginFactory for FixedFactory {
    fn instantiate(&self, _config: &serde_json::Value) -> anyhow::Result<Arc<dyn PhaseHandler>> {
        Ok(Arc::clone(&self.0))
    }
}

/// A handler that returns without making any host call.
pub struct NoopHandler;

#[async_trait]
impl PhaseHandler for NoopHandler {
    async fn run(&self, _phase: &str, _facade: Facade) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A registry with one `echo.plug` plugin backed by `handler`.
pub async fn fixture_registry(
    dir: &Path,
    phases: &[&str],
    handler: Arc<dyn PhaseHandler>,
) -> PluginRegistry {
    std::fs::write(dir.join("echo.plug"), "").unwrap();
    let registry = PluginRegistry::new(Arc::new(StubLoader {
        phases: phases.iter().map(|p| p.to_string()).collect(),
        factory: Arc::new(FixedFactory(handler)),
    }));
    registry.rescan(dir).await.unwrap();
    registry
}
