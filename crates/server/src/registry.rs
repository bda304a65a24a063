//! Loaded plugin definitions: scanned once at startup (or on an explicit
//! `set_plugin_dir`), immutable afterwards except the instance start/close
//! timestamps.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use {
    tokio::sync::RwLock,
    tracing::{debug, warn},
};

use crate::{
    error::{CoordinatorError, Result},
    loader::{PhaseHandler, PluginFactory, PluginLoader},
};

fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

pub(crate) fn now_secs() -> u64 {
    epoch_secs(SystemTime::now())
}

/// One loaded plugin module.
pub struct PluginDefinition {
    pub name: String,
    /// Source file modification time, epoch seconds.
    pub modtime: u64,
    /// When the registry loaded this module, epoch seconds.
    pub load_time: u64,
    pub phases: Vec<String>,
    pub priority: i32,
    pub schema: serde_json::Value,
    factory: Arc<dyn PluginFactory>,
    last_start_instance: Mutex<Option<u64>>,
    last_close_instance: Mutex<Option<u64>>,
}

impl PluginDefinition {
    pub fn has_phase(&self, phase: &str) -> bool {
        self.phases.iter().any(|p| p == phase)
    }

    /// The instantiation hook: decoded config → fresh handler state.
    pub fn instantiate(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn PhaseHandler>> {
        self.factory.instantiate(config)
    }

    pub fn note_instance_started(&self) {
        if let Ok(mut at) = self.last_start_instance.lock() {
            *at = Some(now_secs());
        }
    }

    pub fn note_instance_closed(&self) {
        if let Ok(mut at) = self.last_close_instance.lock() {
            *at = Some(now_secs());
        }
    }

    pub fn last_start_instance(&self) -> Option<u64> {
        self.last_start_instance.lock().ok().and_then(|at| *at)
    }

    pub fn last_close_instance(&self) -> Option<u64> {
        self.last_close_instance.lock().ok().and_then(|at| *at)
    }

    /// The record-wrapped schema shape the gateway core expects.
    pub fn wrapped_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "fields": [{
                "config": {
                    "type": "record",
                    "fields": self.schema,
                }
            }],
        })
    }

    /// The `get_plugin_info` projection.
    pub fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "Name": self.name,
            "Phases": self.phases,
            "Priority": self.priority,
            "Schema": self.wrapped_schema(),
        })
    }
}

/// Registry of loaded plugin definitions.
pub struct PluginRegistry {
    loader: Arc<dyn PluginLoader>,
    plugins: RwLock<HashMap<String, Arc<PluginDefinition>>>,
}

impl PluginRegistry {
    pub fn new(loader: Arc<dyn PluginLoader>) -> Self {
        Self {
            loader,
            plugins: RwLock::new(HashMap::new()),
        }
    }

    /// Scan `dir` and replace the registry contents. A file that fails to
    /// load is logged and skipped; it never aborts the scan.
    pub async fn rescan(&self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            return Err(CoordinatorError::PluginDirNotFound(
                dir.display().to_string(),
            ));
        }
        let entries = std::fs::read_dir(dir)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", dir.display()))?;

        let mut loaded = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = plugin_name(&path, self.loader.extensions()) else {
                continue;
            };
            match self.loader.load(&name, &path) {
                Ok(module) => {
                    let modtime = entry
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .map(epoch_secs)
                        .unwrap_or(0);
                    debug!(plugin = %name, path = %path.display(), "loaded plugin");
                    loaded.insert(
                        name.clone(),
                        Arc::new(PluginDefinition {
                            name,
                            modtime,
                            load_time: now_secs(),
                            phases: module.phases,
                            priority: module.priority,
                            schema: module.schema,
                            factory: module.factory,
                            last_start_instance: Mutex::new(None),
                            last_close_instance: Mutex::new(None),
                        }),
                    );
                }
                Err(e) => {
                    warn!(plugin = %name, error = %e, "error loading plugin, skipping");
                }
            }
        }

        let count = loaded.len();
        *self.plugins.write().await = loaded;
        Ok(count)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<PluginDefinition>> {
        self.plugins
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CoordinatorError::PluginNotFound(name.to_string()))
    }

    /// Stable snapshot for status reads.
    pub async fn snapshot(&self) -> Vec<Arc<PluginDefinition>> {
        self.plugins.read().await.values().cloned().collect()
    }
}

/// Plugin name from a recognized file, `None` for anything else.
fn plugin_name(path: &Path, extensions: &[&str]) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    if !extensions.contains(&ext) {
        return None;
    }
    Some(path.file_stem()?.to_str()?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{NoopHandler, fixture_registry};
    use std::sync::Arc;

    #[tokio::test]
    async fn broken_plugin_is_skipped_without_aborting_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken-thing.plug"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let registry =
            fixture_registry(dir.path(), &["access"], Arc::new(NoopHandler)).await;

        assert!(registry.get("echo").await.is_ok());
        assert!(matches!(
            registry.get("broken-thing").await,
            Err(CoordinatorError::PluginNotFound(_))
        ));
        assert!(matches!(
            registry.get("notes").await,
            Err(CoordinatorError::PluginNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rescan_on_a_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            fixture_registry(dir.path(), &["access"], Arc::new(NoopHandler)).await;
        let gone = dir.path().join("nope");
        assert!(matches!(
            registry.rescan(&gone).await,
            Err(CoordinatorError::PluginDirNotFound(_))
        ));
    }

    #[tokio::test]
    async fn info_wraps_the_schema_in_the_record_shape() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            fixture_registry(dir.path(), &["access", "log"], Arc::new(NoopHandler)).await;
        let def = registry.get("echo").await.unwrap();

        assert!(def.has_phase("log"));
        assert!(!def.has_phase("response"));

        let info = def.info();
        assert_eq!(info["Name"], "echo");
        assert_eq!(info["Phases"][0], "access");
        assert_eq!(info["Schema"]["name"], "echo");
        assert_eq!(info["Schema"]["fields"][0]["config"]["type"], "record");
    }
}
