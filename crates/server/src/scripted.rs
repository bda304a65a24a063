//! The bundled demo/test loader. Plugins are declarative toml manifests
//! with a scripted sequence of host calls, so the coordinator and a worker
//! process can materialize identical handlers from the same directory.
//! Production module loaders live gateway-side behind
//! [`crate::loader::PluginLoader`].

use std::{path::Path, sync::Arc};

use {async_trait::async_trait, serde::Deserialize};

use crate::{
    error::CoordinatorError,
    facade::{Facade, FacadeCallError},
    loader::{LoadedPlugin, PhaseHandler, PluginFactory, PluginLoader},
};

/// One scripted host call.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedCall {
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    /// What to do when the gateway core resumes this call via the error
    /// path.
    #[serde(default)]
    pub on_error: OnError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Fail the run, surfacing the error through the terminal sentinel.
    #[default]
    Propagate,
    /// Swallow the error and continue with the next scripted call.
    Recover,
}

/// Manifest shape of a scripted plugin file.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedManifest {
    #[serde(default)]
    pub priority: i32,
    pub phases: Vec<String>,
    #[serde(default)]
    pub schema: serde_json::Value,
    #[serde(default)]
    pub calls: Vec<ScriptedCall>,
}

struct ScriptedFactory {
    manifest: ScriptedManifest,
}

impl PluginFactory for ScriptedFactory {
    fn instantiate(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn PhaseHandler>> {
        if !config.is_object() {
            anyhow::bail!("config must be an object");
        }
        Ok(Arc::new(ScriptedHandler {
            calls: self.manifest.calls.clone(),
        }))
    }
}

/// Replays the manifest's scripted calls through the facade.
struct ScriptedHandler {
    calls: Vec<ScriptedCall>,
}

#[async_trait]
impl PhaseHandler for ScriptedHandler {
    async fn run(&self, _phase: &str, facade: Facade) -> anyhow::Result<()> {
        for call in &self.calls {
            match facade.call(&call.method, call.args.clone()).await {
                Ok(_) => {}
                Err(e) if call.on_error == OnError::Recover && e.is::<FacadeCallError>() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Loads `*.toml` scripted plugin manifests.
#[derive(Default)]
pub struct ScriptedLoader;

impl PluginLoader for ScriptedLoader {
    fn extensions(&self) -> &[&str] {
        &["toml"]
    }

    fn load(&self, _name: &str, path: &Path) -> anyhow::Result<LoadedPlugin> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoordinatorError::Load(e.to_string()))?;
        let manifest: ScriptedManifest =
            toml::from_str(&raw).map_err(|e| CoordinatorError::Load(e.to_string()))?;
        Ok(LoadedPlugin {
            phases: manifest.phases.clone(),
            priority: manifest.priority,
            schema: manifest.schema.clone(),
            factory: Arc::new(ScriptedFactory { manifest }),
        })
    }
}
