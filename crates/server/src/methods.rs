//! Gateway-facing dispatch surface: method name → handler, including the
//! entity-kind step aliases. The production transport decodes its frames,
//! calls [`MethodRegistry::dispatch`], and encodes the response; nothing
//! here panics across that boundary.

use std::{collections::HashMap, future::Future, path::PathBuf, pin::Pin, sync::Arc};

use tracing::{debug, warn};

use outrig_protocol::{ErrorShape, ResponseFrame, error_codes};

use crate::state::Coordinator;

// ── Types ────────────────────────────────────────────────────────────────────

/// Context passed to every method handler.
pub struct MethodContext {
    pub params: serde_json::Value,
    pub state: Arc<Coordinator>,
}

/// The result a method handler produces.
pub type MethodResult = Result<serde_json::Value, ErrorShape>;

/// A boxed async method handler.
pub type HandlerFn =
    Box<dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

/// Entity kinds the gateway core declares on step calls; each alias routes
/// to the plain step handler with identical behavior.
const STEP_ENTITIES: &[&str] = &[
    "service",
    "consumer",
    "route",
    "plugin",
    "credential",
    "memory_stats",
];

// ── Param helpers ────────────────────────────────────────────────────────────

fn require_str(params: &serde_json::Value, key: &str) -> Result<String, ErrorShape> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ErrorShape::new(error_codes::INVALID_REQUEST, format!("missing {key}")))
}

fn require_u64(params: &serde_json::Value, key: &str) -> Result<u64, ErrorShape> {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| ErrorShape::new(error_codes::INVALID_REQUEST, format!("missing {key}")))
}

// ── Method registry ──────────────────────────────────────────────────────────

pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        reg.register_defaults();
        reg
    }

    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    pub async fn dispatch(
        &self,
        method: &str,
        ctx: MethodContext,
        request_id: Option<u64>,
    ) -> ResponseFrame {
        let Some(handler) = self.handlers.get(method) else {
            warn!(method, "unknown method");
            return ResponseFrame::err(
                request_id,
                ErrorShape::new(
                    error_codes::INVALID_REQUEST,
                    format!("unknown method: {method}"),
                ),
            );
        };

        debug!(method, "dispatching method");
        match handler(ctx).await {
            Ok(payload) => ResponseFrame::ok(request_id, payload),
            Err(err) => {
                warn!(method, code = %err.code, msg = %err.message, "method error");
                ResponseFrame::err(request_id, err)
            }
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn register_defaults(&mut self) {
        self.register_admin_methods();
        self.register_instance_methods();
        self.register_event_methods();
    }

    // ── Admin/status methods ─────────────────────────────────────────────

    fn register_admin_methods(&mut self) {
        // get_status: aggregate admin view
        self.register(
            "get_status",
            Box::new(|ctx| Box::pin(async move { Ok(ctx.state.status().await) })),
        );

        // get_plugin_info
        self.register(
            "get_plugin_info",
            Box::new(|ctx| {
                Box::pin(async move {
                    let name = require_str(&ctx.params, "Name")?;
                    let definition = ctx
                        .state
                        .registry
                        .get(&name)
                        .await
                        .map_err(ErrorShape::from)?;
                    Ok(definition.info())
                })
            }),
        );

        // set_plugin_dir: validate + rescan
        self.register(
            "set_plugin_dir",
            Box::new(|ctx| {
                Box::pin(async move {
                    let dir = require_str(&ctx.params, "Dir")?;
                    ctx.state
                        .set_plugin_dir(PathBuf::from(dir))
                        .await
                        .map_err(ErrorShape::from)?;
                    Ok(serde_json::json!("ok"))
                })
            }),
        );
    }

    // ── Instance lifecycle methods ───────────────────────────────────────

    fn register_instance_methods(&mut self) {
        // start_instance
        self.register(
            "start_instance",
            Box::new(|ctx| {
                Box::pin(async move {
                    let name = require_str(&ctx.params, "Name")?;
                    let raw = require_str(&ctx.params, "Config")?;
                    let instance = ctx
                        .state
                        .instances
                        .start(&ctx.state.registry, &name, &raw)
                        .await
                        .map_err(ErrorShape::from)?;
                    Ok(instance.status())
                })
            }),
        );

        // instance_status
        self.register(
            "instance_status",
            Box::new(|ctx| {
                Box::pin(async move {
                    let id = require_u64(&ctx.params, "Id")?;
                    let instance = ctx
                        .state
                        .instances
                        .get(id)
                        .await
                        .map_err(ErrorShape::from)?;
                    Ok(instance.status())
                })
            }),
        );

        // close_instance: the descriptor is captured before the close hook
        // and removal run.
        self.register(
            "close_instance",
            Box::new(|ctx| {
                Box::pin(async move {
                    let id = require_u64(&ctx.params, "Id")?;
                    let instance = ctx
                        .state
                        .instances
                        .close(id)
                        .await
                        .map_err(ErrorShape::from)?;
                    Ok(serde_json::json!({
                        "Name": instance.definition.name,
                        "Id": instance.id,
                        "Config": instance.config,
                    }))
                })
            }),
        );
    }

    // ── Event methods ────────────────────────────────────────────────────

    fn register_event_methods(&mut self) {
        // handle_event = begin
        self.register(
            "handle_event",
            Box::new(|ctx| {
                Box::pin(async move {
                    let instance_id = require_u64(&ctx.params, "InstanceId")?;
                    let event_name = require_str(&ctx.params, "EventName")?;
                    let turn = ctx
                        .state
                        .dispatcher
                        .begin(instance_id, &event_name)
                        .await
                        .map_err(ErrorShape::from)?;
                    Ok(serde_json::json!({
                        "Data": turn.data,
                        "EventId": turn.event_id,
                    }))
                })
            }),
        );

        // step / step_error, plus the entity aliases routed through the
        // same handler factory.
        self.register("step", step_handler(false));
        self.register("step_error", step_handler(true));
        for entity in STEP_ENTITIES {
            self.register(format!("step_{entity}"), step_handler(false));
        }
        self.register("step_multi_map", step_handler(false));
    }
}

/// Resume handler shared by `step`, `step_error`, and the entity aliases.
fn step_handler(is_error: bool) -> HandlerFn {
    Box::new(move |ctx| {
        Box::pin(async move {
            let event_id = require_u64(&ctx.params, "EventId")?;
            let payload = match ctx.params.get("Data") {
                None | Some(serde_json::Value::Null) => None,
                Some(value) => Some(value.clone()),
            };
            let turn = ctx
                .state
                .dispatcher
                .resume(event_id, payload, is_error)
                .await
                .map_err(ErrorShape::from)?;
            Ok(serde_json::json!({
                "Data": turn.data,
                "EventId": turn.event_id,
            }))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CoordinatorConfig, scripted::ScriptedLoader, worker::CooperativeBackend,
    };

    const ECHO: &str = "priority = 5\nphases = [\"access\"]\n";

    async fn coordinator(dir: &std::path::Path) -> Arc<Coordinator> {
        let config = CoordinatorConfig {
            plugin_dir: Some(dir.to_path_buf()),
            ..CoordinatorConfig::default()
        };
        Coordinator::new(
            config,
            Arc::new(ScriptedLoader),
            Arc::new(CooperativeBackend),
        )
        .await
        .unwrap()
    }

    async fn call(
        registry: &MethodRegistry,
        state: &Arc<Coordinator>,
        method: &str,
        params: serde_json::Value,
    ) -> ResponseFrame {
        registry
            .dispatch(
                method,
                MethodContext {
                    params,
                    state: Arc::clone(state),
                },
                Some(7),
            )
            .await
    }

    #[tokio::test]
    async fn unknown_methods_are_rejected_not_crashed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("echo.toml"), ECHO).unwrap();
        let state = coordinator(dir.path()).await;
        let registry = MethodRegistry::new();

        let resp = call(&registry, &state, "does_not_exist", serde_json::json!({})).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_REQUEST);
        assert_eq!(resp.id, Some(7));
    }

    #[tokio::test]
    async fn get_plugin_info_not_found_is_well_formed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("echo.toml"), ECHO).unwrap();
        let state = coordinator(dir.path()).await;
        let registry = MethodRegistry::new();

        let resp = call(
            &registry,
            &state,
            "get_plugin_info",
            serde_json::json!({"Name": "ghost"}),
        )
        .await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, error_codes::NOT_FOUND);
        assert!(err.message.contains("ghost"));

        let resp = call(
            &registry,
            &state,
            "get_plugin_info",
            serde_json::json!({"Name": "echo"}),
        )
        .await;
        let info = resp.result.unwrap();
        assert_eq!(info["Name"], "echo");
        assert_eq!(info["Priority"], 5);
    }

    #[tokio::test]
    async fn every_step_alias_is_registered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("echo.toml"), ECHO).unwrap();
        let state = coordinator(dir.path()).await;
        let registry = MethodRegistry::new();

        for method in [
            "step",
            "step_error",
            "step_service",
            "step_consumer",
            "step_route",
            "step_plugin",
            "step_credential",
            "step_memory_stats",
            "step_multi_map",
        ] {
            // Behavior is identical: an unknown event id is NOT_FOUND, not
            // an unknown method.
            let resp = call(
                &registry,
                &state,
                method,
                serde_json::json!({"EventId": 123}),
            )
            .await;
            assert_eq!(resp.error.unwrap().code, error_codes::NOT_FOUND, "{method}");
        }
    }

    #[tokio::test]
    async fn missing_params_are_invalid_requests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("echo.toml"), ECHO).unwrap();
        let state = coordinator(dir.path()).await;
        let registry = MethodRegistry::new();

        let resp = call(&registry, &state, "start_instance", serde_json::json!({})).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_REQUEST);

        let resp = call(&registry, &state, "handle_event", serde_json::json!({})).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn set_plugin_dir_validates_and_rescans() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("echo.toml"), ECHO).unwrap();
        let state = coordinator(dir.path()).await;
        let registry = MethodRegistry::new();

        let other = tempfile::tempdir().unwrap();
        std::fs::write(other.path().join("fresh.toml"), ECHO).unwrap();

        let resp = call(
            &registry,
            &state,
            "set_plugin_dir",
            serde_json::json!({"Dir": other.path().to_str().unwrap()}),
        )
        .await;
        assert_eq!(resp.result.unwrap(), serde_json::json!("ok"));
        assert!(state.registry.get("fresh").await.is_ok());
        assert!(state.registry.get("echo").await.is_err());

        let resp = call(
            &registry,
            &state,
            "set_plugin_dir",
            serde_json::json!({"Dir": "/definitely/not/here"}),
        )
        .await;
        assert_eq!(resp.error.unwrap().code, error_codes::NOT_FOUND);
    }
}
