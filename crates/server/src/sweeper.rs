//! Background eviction of idle instances and stale continuations.

use std::sync::Arc;

use {tokio::task::JoinHandle, tracing::debug};

use crate::state::Coordinator;

/// Spawn the periodic sweep task. Runs for the life of the coordinator.
pub fn spawn_sweeper(state: Arc<Coordinator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.sweep_interval());
        // The first tick fires immediately; skip it so a fresh coordinator
        // is not swept at startup.
        interval.tick().await;
        loop {
            interval.tick().await;
            sweep(&state).await;
        }
    })
}

/// One sweep: a single locked scan evicting instances idle past the ttl,
/// then collection of continuations that timed out at least one ttl ago.
pub async fn sweep(state: &Coordinator) {
    let ttl = state.config.instance_ttl();
    let evicted = state.instances.evict_idle(ttl).await;
    for instance in &evicted {
        debug!(
            instance = instance.id,
            plugin = %instance.definition.name,
            "cleaned up expired instance"
        );
    }
    let pruned = state.dispatcher.prune_timed_out(ttl).await;
    if !evicted.is_empty() || pruned > 0 {
        debug!(
            instances = evicted.len(),
            continuations = pruned,
            "sweep complete"
        );
    }
}
