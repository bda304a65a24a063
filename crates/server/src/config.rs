//! Coordinator configuration: serde defaults plus `outrig.toml` discovery.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    serde::Deserialize,
    tracing::{debug, warn},
};

/// Which worker backend runs phase handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Cooperative tokio task per event.
    Task,
    /// Fixed pool of isolated worker processes.
    Pool,
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Directory of plugin modules scanned at startup.
    pub plugin_dir: Option<PathBuf>,
    pub backend: BackendKind,
    /// Worker processes kept in the pool (pool backend only).
    pub pool_size: usize,
    /// Seconds an event may spend awaiting one worker message.
    pub event_deadline_secs: u64,
    /// Seconds of inactivity before the sweeper evicts an instance.
    pub instance_ttl_secs: u64,
    /// Seconds between sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            plugin_dir: None,
            backend: BackendKind::Task,
            pool_size: 4,
            event_deadline_secs: 30,
            instance_ttl_secs: 60,
            sweep_interval_secs: 60,
        }
    }
}

impl CoordinatorConfig {
    pub fn event_deadline(&self) -> Duration {
        Duration::from_secs(self.event_deadline_secs)
    }

    pub fn instance_ttl(&self) -> Duration {
        Duration::from_secs(self.instance_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        // A zero interval would spin; sweep at least once a second.
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

const CONFIG_FILENAME: &str = "outrig.toml";

/// Discover and load config: `./outrig.toml`, then
/// `~/.config/outrig/outrig.toml`. Defaults when neither exists or the file
/// is unreadable.
pub fn discover_and_load() -> CoordinatorConfig {
    for path in candidate_paths() {
        if !path.exists() {
            continue;
        }
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            }
        }
    }
    CoordinatorConfig::default()
}

/// Load config from the given path.
pub fn load_config(path: &Path) -> anyhow::Result<CoordinatorConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    Ok(toml::from_str(&raw)?)
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILENAME)];
    if let Ok(home) = std::env::var("HOME") {
        paths.push(
            PathBuf::from(home)
                .join(".config")
                .join("outrig")
                .join(CONFIG_FILENAME),
        );
    }
    paths
}
