//! Wire types shared between the coordinator, its worker processes, and the
//! gateway-facing dispatch surface.
//!
//! Dispatch-surface field names are PascalCase to match the frames the
//! gateway core exchanges with its plugin runtimes. The production transport
//! and codec live outside this workspace; everything here is
//! transport-neutral.

use serde::{Deserialize, Serialize};

/// Reserved terminal value. A worker emits this once its handler has
/// finished; observing it retires the continuation.
pub const MSG_RET: &str = "ret";

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const INVALID_CONFIG: &str = "INVALID_CONFIG";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const LOAD_ERROR: &str = "LOAD_ERROR";
    pub const WORKER_ERROR: &str = "WORKER_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const BUSY: &str = "BUSY";
    pub const INTERNAL: &str = "INTERNAL";
}

/// Error payload carried in a response frame.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ── Dispatch frames ──────────────────────────────────────────────────────────

/// One request from the transport adapter: a method name plus its params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The response to a request frame: exactly one of `result` / `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: Option<u64>, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<u64>, error: ErrorShape) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

// ── Worker conversation ──────────────────────────────────────────────────────

/// An outward host call made by plugin code through its facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallDescriptor {
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

/// The two-slot result a resume forwards into the worker channel: the data
/// slot on success, the fault slot on error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "slot", content = "value", rename_all = "snake_case")]
pub enum StepResult {
    Data(Option<serde_json::Value>),
    Fault(Option<serde_json::Value>),
}

/// A message a worker sends outward to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerMsg {
    /// The handler made a host call and is now blocked on its result.
    Call(CallDescriptor),
    /// The handler finished; the continuation must be retired. `error` is
    /// set when the handler failed or panicked instead of returning.
    Ret {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WorkerMsg {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerMsg::Ret { .. })
    }

    /// The wire `Data` value handed back to the gateway core: the call
    /// descriptor, the bare sentinel, or the sentinel wrapping error details.
    pub fn into_data(self) -> serde_json::Value {
        match self {
            WorkerMsg::Call(call) => serde_json::to_value(call).unwrap_or(serde_json::Value::Null),
            WorkerMsg::Ret { error: None } => serde_json::Value::String(MSG_RET.to_string()),
            WorkerMsg::Ret { error: Some(e) } => serde_json::json!({ "ret": { "error": e } }),
        }
    }
}

// ── Worker-process wire ──────────────────────────────────────────────────────

/// Coordinator → worker-process operations, one JSON line each. Replies flow
/// back as [`WorkerMsg`] lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PoolRequest {
    /// Start one phase run. The worker re-materializes the handler from its
    /// own plugin registry; no handler state crosses the process boundary.
    Run {
        plugin: String,
        phase: String,
        config: serde_json::Value,
    },
    /// Resume the in-flight run with a facade-call result.
    Step(StepResult),
    /// Drain and exit.
    Shutdown,
}
