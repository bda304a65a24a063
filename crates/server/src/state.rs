//! The explicit coordinator handle threaded through the method layer and
//! background tasks.

use std::{path::PathBuf, sync::Arc};

use tracing::info;

use crate::{
    config::CoordinatorConfig,
    error::Result,
    events::EventDispatcher,
    instances::InstanceTable,
    loader::PluginLoader,
    registry::PluginRegistry,
    worker::WorkerBackend,
};

/// Shared coordinator runtime state, wrapped in `Arc` across tasks.
pub struct Coordinator {
    pub registry: PluginRegistry,
    pub instances: Arc<InstanceTable>,
    pub dispatcher: EventDispatcher,
    pub config: CoordinatorConfig,
    pub pid: u32,
    backend: Arc<dyn WorkerBackend>,
}

impl Coordinator {
    pub async fn new(
        config: CoordinatorConfig,
        loader: Arc<dyn PluginLoader>,
        backend: Arc<dyn WorkerBackend>,
    ) -> Result<Arc<Self>> {
        let registry = PluginRegistry::new(loader);
        if let Some(dir) = &config.plugin_dir {
            let count = registry.rescan(dir).await?;
            info!(plugins = count, dir = %dir.display(), "plugin registry loaded");
        }
        let instances = Arc::new(InstanceTable::default());
        let dispatcher = EventDispatcher::new(
            Arc::clone(&instances),
            Arc::clone(&backend),
            config.event_deadline(),
        );
        Ok(Arc::new(Self {
            registry,
            instances,
            dispatcher,
            pid: std::process::id(),
            backend,
            config,
        }))
    }

    /// `set_plugin_dir`: validate the directory and rescan the registry.
    pub async fn set_plugin_dir(&self, dir: PathBuf) -> Result<usize> {
        let count = self.registry.rescan(&dir).await?;
        info!(plugins = count, dir = %dir.display(), "plugin dir reconfigured");
        Ok(count)
    }

    /// The aggregate admin view: process identity plus, per definition, its
    /// load metadata and live instances.
    pub async fn status(&self) -> serde_json::Value {
        let definitions = self.registry.snapshot().await;
        let instances = self.instances.snapshot().await;
        let mut plugins = serde_json::Map::new();
        for def in definitions {
            let statuses: Vec<_> = instances
                .iter()
                .filter(|i| i.definition.name == def.name)
                .map(|i| i.status())
                .collect();
            plugins.insert(
                def.name.clone(),
                serde_json::json!({
                    "Name": def.name,
                    "Modtime": def.modtime,
                    "LoadTime": def.load_time,
                    "Instances": statuses,
                    "LastStartInstance": def.last_start_instance(),
                    "LastCloseInstance": def.last_close_instance(),
                }),
            );
        }
        serde_json::json!({
            "Pid": self.pid,
            "Plugins": plugins,
        })
    }

    /// Graceful teardown of pooled workers.
    pub async fn shutdown(&self) {
        self.backend.shutdown().await;
    }
}
