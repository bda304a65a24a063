//! Worker execution: the backend seam and the cooperative in-process
//! backend. Every run gets exactly one channel endpoint and must end with
//! the terminal sentinel, whatever the handler does.

use std::sync::Arc;

use {async_trait::async_trait, futures::FutureExt, tracing::debug};

use outrig_protocol::WorkerMsg;

use crate::{
    channel::{EventChannel, WorkerEnd, task_channel},
    error::Result,
    facade::Facade,
    instances::PluginInstance,
    loader::PhaseHandler,
};

/// Execution strategy for phase runs, selected once at startup.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Launch one phase run and hand back the coordinator end of its
    /// channel. Fails `Busy` when the backend cannot take another run.
    async fn launch(
        &self,
        instance: &PluginInstance,
        phase: &str,
    ) -> Result<Arc<dyn EventChannel>>;

    /// Tear down pooled resources at coordinator shutdown.
    async fn shutdown(&self) {}
}

/// Runs each event as a cooperatively scheduled task in the coordinator's
/// own memory; the channel is an in-process rendezvous pair.
#[derive(Default)]
pub struct CooperativeBackend;

#[async_trait]
impl WorkerBackend for CooperativeBackend {
    async fn launch(
        &self,
        instance: &PluginInstance,
        phase: &str,
    ) -> Result<Arc<dyn EventChannel>> {
        let (channel, end) = task_channel();
        let handler = Arc::clone(&instance.handler);
        let handle = tokio::spawn(run_worker(handler, phase.to_string(), Arc::new(end)));
        channel.bind(handle).await;
        Ok(Arc::new(channel))
    }
}

/// The worker loop shared by both backends: invoke the handler with a bound
/// facade, then always emit the terminal sentinel. A handler error or panic
/// becomes `Ret { error }`; a worker never dies silently.
pub async fn run_worker(handler: Arc<dyn PhaseHandler>, phase: String, end: Arc<WorkerEnd>) {
    let facade = Facade::new(Arc::clone(&end));
    let outcome = std::panic::AssertUnwindSafe(handler.run(&phase, facade))
        .catch_unwind()
        .await;
    let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(panic) => Some(panic_message(panic.as_ref())),
    };
    if end.emit(WorkerMsg::Ret { error }).await.is_err() {
        debug!(phase = %phase, "run abandoned before its terminal message");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
