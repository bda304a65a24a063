//! The uniform duplex channel between the dispatcher and one worker run.
//! Both backends sit behind [`EventChannel`]: strict request/response, one
//! pending item at a time, blocking send and receive.

use {
    anyhow::{Result, anyhow},
    async_trait::async_trait,
    tokio::{
        sync::{Mutex, mpsc},
        task::JoinHandle,
    },
};

use outrig_protocol::{StepResult, WorkerMsg};

/// Coordinator-side capability over one worker run's channel.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Forward a resume result to the worker.
    async fn send(&self, result: StepResult) -> Result<()>;

    /// Await the worker's next outward message.
    async fn recv(&self) -> Result<WorkerMsg>;

    /// Tear the run down after a deadline expiry; the worker must not be
    /// left permanently blocked.
    async fn abandon(&self);
}

// ── In-process rendezvous pair ───────────────────────────────────────────────

/// Coordinator end of a cooperative-task run.
pub struct TaskChannel {
    tx: mpsc::Sender<StepResult>,
    rx: Mutex<mpsc::Receiver<WorkerMsg>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskChannel {
    /// Attach the spawned worker task so `abandon` can cancel it.
    pub async fn bind(&self, handle: JoinHandle<()>) {
        *self.handle.lock().await = Some(handle);
    }
}

#[async_trait]
impl EventChannel for TaskChannel {
    async fn send(&self, result: StepResult) -> Result<()> {
        self.tx
            .send(result)
            .await
            .map_err(|_| anyhow!("worker hung up"))
    }

    async fn recv(&self) -> Result<WorkerMsg> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow!("worker channel closed"))
    }

    async fn abandon(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }
}

/// Worker end of the pair: what the facade drives.
pub struct WorkerEnd {
    tx: mpsc::Sender<WorkerMsg>,
    rx: Mutex<mpsc::Receiver<StepResult>>,
}

impl WorkerEnd {
    /// Emit an outward message without awaiting a reply (the terminal
    /// sentinel).
    pub async fn emit(&self, msg: WorkerMsg) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| anyhow!("coordinator hung up"))
    }

    /// Make one host call: emit the descriptor, block for the result tuple.
    pub async fn call(&self, msg: WorkerMsg) -> Result<StepResult> {
        self.emit(msg).await?;
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow!("coordinator hung up"))
    }
}

/// A fresh rendezvous pair: capacity one in each direction.
pub fn task_channel() -> (TaskChannel, WorkerEnd) {
    let (out_tx, out_rx) = mpsc::channel(1);
    let (in_tx, in_rx) = mpsc::channel(1);
    (
        TaskChannel {
            tx: in_tx,
            rx: Mutex::new(out_rx),
            handle: Mutex::new(None),
        },
        WorkerEnd {
            tx: out_tx,
            rx: Mutex::new(in_rx),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use outrig_protocol::CallDescriptor;

    #[tokio::test]
    async fn rendezvous_relays_one_item_each_way() {
        let (chan, end) = task_channel();

        let worker = tokio::spawn(async move {
            let result = end
                .call(WorkerMsg::Call(CallDescriptor {
                    method: "gateway.log.info".into(),
                    args: vec![],
                }))
                .await
                .unwrap();
            assert_eq!(result, StepResult::Data(Some(serde_json::json!("pong"))));
            end.emit(WorkerMsg::Ret { error: None }).await.unwrap();
        });

        let msg = chan.recv().await.unwrap();
        assert!(!msg.is_terminal());
        chan.send(StepResult::Data(Some(serde_json::json!("pong"))))
            .await
            .unwrap();
        assert!(chan.recv().await.unwrap().is_terminal());
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn recv_fails_once_the_worker_is_gone() {
        let (chan, end) = task_channel();
        drop(end);
        assert!(chan.recv().await.is_err());
    }
}
