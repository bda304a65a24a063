//! Reference stdio transport: one dispatch frame per line on stdin, one
//! response frame per line on stdout. The production transport lives
//! gateway-side and drives `MethodRegistry::dispatch` directly.

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::{Result, bail},
    tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    tracing::info,
};

use outrig_protocol::{ErrorShape, RequestFrame, ResponseFrame, error_codes};
use outrig_server::{
    config::{self, BackendKind, CoordinatorConfig},
    methods::{MethodContext, MethodRegistry},
    pool::{ProcessPoolBackend, WorkerCommand},
    scripted::ScriptedLoader,
    state::Coordinator,
    sweeper,
    worker::{CooperativeBackend, WorkerBackend},
};

pub struct ServeOpts {
    pub plugin_dir: Option<PathBuf>,
    pub backend: Option<String>,
    pub pool_size: Option<usize>,
    pub event_deadline: Option<u64>,
    pub instance_ttl: Option<u64>,
}

pub async fn run(opts: ServeOpts) -> Result<()> {
    let mut cfg = config::discover_and_load();
    if let Some(dir) = opts.plugin_dir {
        cfg.plugin_dir = Some(dir);
    }
    if let Some(backend) = opts.backend.as_deref() {
        cfg.backend = match backend {
            "task" => BackendKind::Task,
            "pool" => BackendKind::Pool,
            other => bail!("unknown backend: {other}"),
        };
    }
    if let Some(n) = opts.pool_size {
        cfg.pool_size = n;
    }
    if let Some(secs) = opts.event_deadline {
        cfg.event_deadline_secs = secs;
    }
    if let Some(secs) = opts.instance_ttl {
        cfg.instance_ttl_secs = secs;
    }

    let backend = build_backend(&cfg).await?;
    let state = Coordinator::new(cfg, Arc::new(ScriptedLoader), backend).await?;
    sweeper::spawn_sweeper(Arc::clone(&state));

    let methods = Arc::new(MethodRegistry::new());
    info!(
        pid = state.pid,
        methods = methods.method_names().len(),
        "coordinator ready"
    );

    serve_stdio(state, methods).await
}

async fn build_backend(cfg: &CoordinatorConfig) -> Result<Arc<dyn WorkerBackend>> {
    match cfg.backend {
        BackendKind::Task => Ok(Arc::new(CooperativeBackend)),
        BackendKind::Pool => {
            let dir = cfg
                .plugin_dir
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("the pool backend requires a plugin dir"))?;
            let cmd = WorkerCommand::current_exe(dir)?;
            Ok(Arc::new(ProcessPoolBackend::new(cmd, cfg.pool_size).await?))
        }
    }
}

async fn serve_stdio(state: Arc<Coordinator>, methods: Arc<MethodRegistry>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RequestFrame>(trimmed) {
            Ok(frame) => {
                let ctx = MethodContext {
                    params: frame.params,
                    state: Arc::clone(&state),
                };
                methods.dispatch(&frame.method, ctx, frame.id).await
            }
            Err(e) => ResponseFrame::err(
                None,
                ErrorShape::new(
                    error_codes::INVALID_REQUEST,
                    format!("malformed request: {e}"),
                ),
            ),
        };
        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        stdout.write_all(payload.as_bytes()).await?;
        stdout.flush().await?;
    }

    state.shutdown().await;
    Ok(())
}
