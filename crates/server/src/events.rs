//! The continuation protocol: begin/resume relay between the gateway core
//! and a suspended worker run.
//!
//! The table lock covers only map access. Each continuation carries its own
//! mutex serializing the channel conversation, so exactly one resume is in
//! flight per event and no lock is ever held across channel I/O.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    tokio::sync::{Mutex, RwLock},
    tracing::{debug, warn},
};

use outrig_protocol::{StepResult, WorkerMsg};

use crate::{
    channel::EventChannel,
    error::{CoordinatorError, Result},
    instances::InstanceTable,
    worker::WorkerBackend,
};

/// Relay state of one in-flight event, guarded by the conversation mutex.
enum ContinuationState {
    Pending,
    TimedOut { at: Instant },
}

/// The suspended state of one in-flight event.
pub struct Continuation {
    pub event_id: u64,
    pub instance_id: u64,
    channel: Arc<dyn EventChannel>,
    convo: Mutex<ContinuationState>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    map: HashMap<u64, Arc<Continuation>>,
}

/// Exclusive-lock table of in-flight continuations. Event ids are strictly
/// increasing for the process lifetime; each maps to at most one live entry.
#[derive(Default)]
pub struct ContinuationTable {
    inner: RwLock<Inner>,
}

impl ContinuationTable {
    async fn insert(&self, instance_id: u64, channel: Arc<dyn EventChannel>) -> Arc<Continuation> {
        let mut inner = self.inner.write().await;
        let event_id = inner.next_id;
        inner.next_id += 1;
        let continuation = Arc::new(Continuation {
            event_id,
            instance_id,
            channel,
            convo: Mutex::new(ContinuationState::Pending),
        });
        inner.map.insert(event_id, Arc::clone(&continuation));
        continuation
    }

    async fn get(&self, event_id: u64) -> Result<Arc<Continuation>> {
        self.inner
            .read()
            .await
            .map
            .get(&event_id)
            .cloned()
            .ok_or(CoordinatorError::EventNotFound(event_id))
    }

    async fn remove(&self, event_id: u64) {
        self.inner.write().await.map.remove(&event_id);
    }

    pub async fn contains(&self, event_id: u64) -> bool {
        self.inner.read().await.map.contains_key(&event_id)
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.map.len()
    }

    /// Remove and return continuations whose deadline expired more than
    /// `older_than` ago. A timed-out entry's conversation mutex is free, so
    /// `try_lock` only skips entries still mid-conversation.
    async fn drain_timed_out(&self, older_than: Duration) -> Vec<Arc<Continuation>> {
        let mut inner = self.inner.write().await;
        let mut stale = Vec::new();
        inner.map.retain(|_, continuation| {
            if let Ok(state) = continuation.convo.try_lock() {
                if let ContinuationState::TimedOut { at } = *state {
                    if at.elapsed() > older_than {
                        stale.push(Arc::clone(continuation));
                        return false;
                    }
                }
            }
            true
        });
        stale
    }
}

/// One begin/resume turn's answer to the gateway core.
#[derive(Debug)]
pub struct EventTurn {
    pub event_id: u64,
    pub data: serde_json::Value,
}

/// Orchestrates the continuation protocol against the instance table and
/// the active worker backend.
pub struct EventDispatcher {
    instances: Arc<InstanceTable>,
    continuations: ContinuationTable,
    backend: Arc<dyn WorkerBackend>,
    deadline: Duration,
}

impl EventDispatcher {
    pub fn new(
        instances: Arc<InstanceTable>,
        backend: Arc<dyn WorkerBackend>,
        deadline: Duration,
    ) -> Self {
        Self {
            instances,
            continuations: ContinuationTable::default(),
            backend,
            deadline,
        }
    }

    pub fn continuations(&self) -> &ContinuationTable {
        &self.continuations
    }

    /// `handle_event`: launch a worker for one phase run and relay its first
    /// outward message.
    pub async fn begin(&self, instance_id: u64, event_name: &str) -> Result<EventTurn> {
        let instance = self.instances.get(instance_id).await?;
        if !instance.definition.has_phase(event_name) {
            return Err(CoordinatorError::PhaseNotFound {
                plugin: instance.definition.name.clone(),
                phase: event_name.to_string(),
            });
        }
        instance.touch();

        let channel = self.backend.launch(&instance, event_name).await?;
        let continuation = self.continuations.insert(instance_id, channel).await;
        debug!(
            event = continuation.event_id,
            instance = instance_id,
            phase = event_name,
            "event started"
        );

        let mut convo = continuation.convo.lock().await;
        let msg = self.await_worker(&continuation, &mut convo).await?;
        instance.touch();
        self.conclude(&continuation, &msg).await;
        Ok(EventTurn {
            event_id: continuation.event_id,
            data: msg.into_data(),
        })
    }

    /// `step` / `step_error`: forward a two-slot result into the worker
    /// channel and relay the next outward message.
    pub async fn resume(
        &self,
        event_id: u64,
        payload: Option<serde_json::Value>,
        is_error: bool,
    ) -> Result<EventTurn> {
        let continuation = self.continuations.get(event_id).await?;
        let mut convo = continuation.convo.lock().await;
        if let ContinuationState::TimedOut { .. } = *convo {
            // Late resume: collect the entry and report the expiry.
            drop(convo);
            self.continuations.remove(event_id).await;
            return Err(CoordinatorError::Timeout(event_id));
        }

        if let Ok(instance) = self.instances.get(continuation.instance_id).await {
            instance.touch();
        }

        let result = if is_error {
            StepResult::Fault(payload)
        } else {
            StepResult::Data(payload)
        };
        if let Err(e) = continuation.channel.send(result).await {
            warn!(event = event_id, error = %e, "worker channel broke on resume");
            self.continuations.remove(event_id).await;
            continuation.channel.abandon().await;
            return Err(CoordinatorError::Worker(e.to_string()));
        }

        let msg = self.await_worker(&continuation, &mut convo).await?;
        if let Ok(instance) = self.instances.get(continuation.instance_id).await {
            instance.touch();
        }
        self.conclude(&continuation, &msg).await;
        Ok(EventTurn {
            event_id,
            data: msg.into_data(),
        })
    }

    /// Await one outward message under the event deadline.
    async fn await_worker(
        &self,
        continuation: &Continuation,
        state: &mut ContinuationState,
    ) -> Result<WorkerMsg> {
        match tokio::time::timeout(self.deadline, continuation.channel.recv()).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(e)) => {
                warn!(event = continuation.event_id, error = %e, "worker channel broke");
                self.continuations.remove(continuation.event_id).await;
                continuation.channel.abandon().await;
                Err(CoordinatorError::Worker(e.to_string()))
            }
            Err(_) => {
                warn!(event = continuation.event_id, "event deadline expired");
                *state = ContinuationState::TimedOut { at: Instant::now() };
                continuation.channel.abandon().await;
                Err(CoordinatorError::Timeout(continuation.event_id))
            }
        }
    }

    async fn conclude(&self, continuation: &Continuation, msg: &WorkerMsg) {
        if msg.is_terminal() {
            self.continuations.remove(continuation.event_id).await;
            debug!(event = continuation.event_id, "event completed");
        }
    }

    /// Sweeper hook: collect continuations that timed out more than
    /// `older_than` ago. Their workers were already torn down at expiry.
    pub async fn prune_timed_out(&self, older_than: Duration) -> usize {
        let stale = self.continuations.drain_timed_out(older_than).await;
        for continuation in &stale {
            debug!(
                event = continuation.event_id,
                "pruned timed-out continuation"
            );
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        facade::Facade,
        loader::PhaseHandler,
        test_support::fixture_registry,
        worker::CooperativeBackend,
    };
    use async_trait::async_trait;

    /// Makes one host call, propagating any fault the gateway resumes with.
    struct OneCallHandler;

    #[async_trait]
    impl PhaseHandler for OneCallHandler {
        async fn run(&self, _phase: &str, facade: Facade) -> anyhow::Result<()> {
            facade
                .call("gateway.log.info", vec![serde_json::json!("hi")])
                .await?;
            Ok(())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl PhaseHandler for PanickingHandler {
        async fn run(&self, _phase: &str, _facade: Facade) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    struct StalledHandler;

    #[async_trait]
    impl PhaseHandler for StalledHandler {
        async fn run(&self, _phase: &str, facade: Facade) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(300)).await;
            facade.call("gateway.log.info", vec![]).await?;
            Ok(())
        }
    }

    async fn dispatcher_with(
        dir: &std::path::Path,
        handler: Arc<dyn PhaseHandler>,
        deadline: Duration,
    ) -> (EventDispatcher, u64) {
        let registry = fixture_registry(dir, &["access"], handler).await;
        let instances = Arc::new(InstanceTable::default());
        let instance = instances.start(&registry, "echo", "{}").await.unwrap();
        let dispatcher =
            EventDispatcher::new(instances, Arc::new(CooperativeBackend), deadline);
        (dispatcher, instance.id)
    }

    #[tokio::test]
    async fn begin_resume_terminal_walks_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, instance_id) =
            dispatcher_with(dir.path(), Arc::new(OneCallHandler), Duration::from_secs(5)).await;

        let turn = dispatcher.begin(instance_id, "access").await.unwrap();
        assert_eq!(turn.event_id, 0);
        assert_eq!(turn.data["Method"], "gateway.log.info");
        assert_eq!(turn.data["Args"][0], "hi");
        assert!(dispatcher.continuations().contains(0).await);

        let turn = dispatcher.resume(0, None, false).await.unwrap();
        assert_eq!(turn.data, serde_json::json!("ret"));
        assert!(!dispatcher.continuations().contains(0).await);

        assert!(matches!(
            dispatcher.resume(0, None, false).await,
            Err(CoordinatorError::EventNotFound(0))
        ));
    }

    #[tokio::test]
    async fn unknown_instance_and_phase_fail_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, instance_id) =
            dispatcher_with(dir.path(), Arc::new(OneCallHandler), Duration::from_secs(5)).await;

        assert!(matches!(
            dispatcher.begin(99, "access").await,
            Err(CoordinatorError::InstanceNotFound(99))
        ));
        assert!(matches!(
            dispatcher.begin(instance_id, "response").await,
            Err(CoordinatorError::PhaseNotFound { .. })
        ));
        assert!(matches!(
            dispatcher.resume(7, None, false).await,
            Err(CoordinatorError::EventNotFound(7))
        ));
    }

    #[tokio::test]
    async fn error_resume_propagates_into_the_terminal_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, instance_id) =
            dispatcher_with(dir.path(), Arc::new(OneCallHandler), Duration::from_secs(5)).await;

        dispatcher.begin(instance_id, "access").await.unwrap();
        let turn = dispatcher
            .resume(0, Some(serde_json::json!("boom")), true)
            .await
            .unwrap();
        // OneCallHandler propagates the fault, so the run ends with an
        // error-carrying sentinel.
        assert!(turn.data["ret"]["error"].is_string());
        assert!(!dispatcher.continuations().contains(0).await);
    }

    #[tokio::test]
    async fn a_panicking_handler_still_emits_the_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, instance_id) =
            dispatcher_with(dir.path(), Arc::new(PanickingHandler), Duration::from_secs(5)).await;

        let turn = dispatcher.begin(instance_id, "access").await.unwrap();
        assert_eq!(turn.data["ret"]["error"], "boom");
        assert_eq!(dispatcher.continuations().count().await, 0);
    }

    #[tokio::test]
    async fn a_stalled_worker_times_out_and_late_resumes_see_it() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, instance_id) =
            dispatcher_with(dir.path(), Arc::new(StalledHandler), Duration::from_millis(50))
                .await;

        assert!(matches!(
            dispatcher.begin(instance_id, "access").await,
            Err(CoordinatorError::Timeout(0))
        ));
        // The entry lingers, marked, until a late resume collects it.
        assert!(dispatcher.continuations().contains(0).await);
        assert!(matches!(
            dispatcher.resume(0, None, false).await,
            Err(CoordinatorError::Timeout(0))
        ));
        assert!(!dispatcher.continuations().contains(0).await);
    }

    #[tokio::test]
    async fn the_sweeper_prunes_abandoned_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, instance_id) =
            dispatcher_with(dir.path(), Arc::new(StalledHandler), Duration::from_millis(50))
                .await;

        assert!(dispatcher.begin(instance_id, "access").await.is_err());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(dispatcher.prune_timed_out(Duration::ZERO).await, 1);
        assert!(!dispatcher.continuations().contains(0).await);
        assert_eq!(dispatcher.prune_timed_out(Duration::ZERO).await, 0);
    }

    #[tokio::test]
    async fn event_ids_are_monotonic_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, instance_id) =
            dispatcher_with(dir.path(), Arc::new(OneCallHandler), Duration::from_secs(5)).await;

        for expected in 0..3u64 {
            let turn = dispatcher.begin(instance_id, "access").await.unwrap();
            assert_eq!(turn.event_id, expected);
            dispatcher.resume(expected, None, false).await.unwrap();
        }
    }
}
