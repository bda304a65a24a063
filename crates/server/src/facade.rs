//! The handle plugin code drives. Each call crosses the channel as a
//! descriptor and blocks the worker until the gateway core resumes the
//! event with a result; the typed per-method host API is assembled
//! gateway-side on top of this relay.

use std::sync::Arc;

use outrig_protocol::{CallDescriptor, StepResult, WorkerMsg};

use crate::channel::WorkerEnd;

/// Raised into the handler when the gateway core resumed the pending call
/// via the error path.
#[derive(Debug, thiserror::Error)]
#[error("host call failed: {0}")]
pub struct FacadeCallError(pub serde_json::Value);

/// Plugin-facing handle bound to one worker run's channel endpoint.
#[derive(Clone)]
pub struct Facade {
    end: Arc<WorkerEnd>,
}

impl Facade {
    pub fn new(end: Arc<WorkerEnd>) -> Self {
        Self { end }
    }

    /// Invoke a host API method. Blocks until the gateway core performs the
    /// real call and resumes the event.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> anyhow::Result<serde_json::Value> {
        let msg = WorkerMsg::Call(CallDescriptor {
            method: method.to_string(),
            args,
        });
        match self.end.call(msg).await? {
            StepResult::Data(value) => Ok(value.unwrap_or(serde_json::Value::Null)),
            StepResult::Fault(value) => {
                Err(FacadeCallError(value.unwrap_or(serde_json::Value::Null)).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{EventChannel, task_channel};

    #[tokio::test]
    async fn fault_slot_surfaces_as_a_facade_error() {
        let (chan, end) = task_channel();
        let facade = Facade::new(Arc::new(end));

        let caller = tokio::spawn(async move {
            let err = facade
                .call("gateway.service.get", vec![])
                .await
                .expect_err("fault slot must fail the call");
            assert!(err.is::<FacadeCallError>());
        });

        chan.recv().await.unwrap();
        chan.send(StepResult::Fault(Some(serde_json::json!("boom"))))
            .await
            .unwrap();
        caller.await.unwrap();
    }
}
