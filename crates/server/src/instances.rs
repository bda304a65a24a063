//! Live plugin instances and their exclusive-lock table.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use {
    tokio::sync::RwLock,
    tracing::{info, warn},
};

use crate::{
    error::{CoordinatorError, Result},
    loader::PhaseHandler,
    registry::{PluginDefinition, PluginRegistry, now_secs},
};

/// One configured, running copy of a plugin definition.
pub struct PluginInstance {
    pub id: u64,
    pub definition: Arc<PluginDefinition>,
    pub config: serde_json::Value,
    pub handler: Arc<dyn PhaseHandler>,
    /// Creation time, epoch seconds.
    pub start_time: u64,
    last_active: Mutex<Instant>,
}

impl PluginInstance {
    /// Refresh the activity timestamp. Called on every event touching the
    /// instance, before and after the blocking channel wait, so the sweeper
    /// never evicts an instance with in-flight work.
    pub fn touch(&self) {
        if let Ok(mut at) = self.last_active.lock() {
            *at = Instant::now();
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// The `instance_status` projection.
    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "Name": self.definition.name,
            "Id": self.id,
            "Config": self.config,
            "StartTime": self.start_time,
        })
    }
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    map: HashMap<u64, Arc<PluginInstance>>,
}

/// Exclusive-lock table of live instances. The id counter lives inside the
/// lock, so lookup, allocation, and insertion form one critical section and
/// ids stay strictly increasing for the process lifetime.
#[derive(Default)]
pub struct InstanceTable {
    inner: RwLock<Inner>,
}

impl InstanceTable {
    /// `start_instance`: definition lookup, config decode, instantiation
    /// hook, id allocation, and insertion, serialized against concurrent
    /// starts, closes, status reads, and sweeps.
    pub async fn start(
        &self,
        registry: &PluginRegistry,
        name: &str,
        raw_config: &str,
    ) -> Result<Arc<PluginInstance>> {
        let mut inner = self.inner.write().await;
        let definition = registry.get(name).await?;
        let config: serde_json::Value =
            serde_json::from_str(raw_config).map_err(|e| CoordinatorError::InvalidConfig {
                plugin: name.to_string(),
                reason: e.to_string(),
            })?;
        let handler =
            definition
                .instantiate(&config)
                .map_err(|e| CoordinatorError::InvalidConfig {
                    plugin: name.to_string(),
                    reason: e.to_string(),
                })?;

        let id = inner.next_id;
        inner.next_id += 1;
        let instance = Arc::new(PluginInstance {
            id,
            definition: Arc::clone(&definition),
            config,
            handler,
            start_time: now_secs(),
            last_active: Mutex::new(Instant::now()),
        });
        inner.map.insert(id, Arc::clone(&instance));
        definition.note_instance_started();
        info!(instance = id, plugin = %name, "instance started");
        Ok(instance)
    }

    pub async fn get(&self, id: u64) -> Result<Arc<PluginInstance>> {
        self.inner
            .read()
            .await
            .map
            .get(&id)
            .cloned()
            .ok_or(CoordinatorError::InstanceNotFound(id))
    }

    /// `close_instance`: removes the entry, then runs the close hook outside
    /// the lock. The returned record still carries every descriptor field.
    pub async fn close(&self, id: u64) -> Result<Arc<PluginInstance>> {
        let instance = {
            let mut inner = self.inner.write().await;
            inner
                .map
                .remove(&id)
                .ok_or(CoordinatorError::InstanceNotFound(id))?
        };
        if let Err(e) = instance.handler.close().await {
            warn!(instance = id, error = %e, "instance close hook failed");
        }
        instance.definition.note_instance_closed();
        info!(instance = id, plugin = %instance.definition.name, "instance closed");
        Ok(instance)
    }

    /// Stable snapshot for status reads.
    pub async fn snapshot(&self) -> Vec<Arc<PluginInstance>> {
        self.inner.read().await.map.values().cloned().collect()
    }

    /// One locked scan removing every instance idle longer than `ttl`.
    pub async fn evict_idle(&self, ttl: Duration) -> Vec<Arc<PluginInstance>> {
        let mut inner = self.inner.write().await;
        let expired: Vec<u64> = inner
            .map
            .values()
            .filter(|i| i.idle_for() > ttl)
            .map(|i| i.id)
            .collect();
        let mut evicted = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(instance) = inner.map.remove(&id) {
                evicted.push(instance);
            }
        }
        evicted
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.map.len()
    }
}
