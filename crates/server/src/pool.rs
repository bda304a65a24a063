//! Process-isolated worker backend: a fixed pool of worker OS processes
//! speaking line-delimited JSON over stdio, plus the child-side loop.
//!
//! Handler state never crosses the boundary. A worker re-materializes the
//! handler from `(plugin, phase, config)` against its own registry; only
//! facade call/response traffic flows over the pipe.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    anyhow::{Context, Result, bail},
    async_trait::async_trait,
    serde::Serialize,
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin, Stdout},
        process::{Child, ChildStdin, ChildStdout, Command},
        sync::Mutex,
    },
    tracing::{debug, warn},
};

use outrig_protocol::{PoolRequest, StepResult, WorkerMsg};

use crate::{
    channel::{EventChannel, task_channel},
    error::CoordinatorError,
    instances::PluginInstance,
    loader::{PhaseHandler, PluginLoader},
    registry::PluginRegistry,
    worker::{WorkerBackend, run_worker},
};

/// How the pool re-executes itself as a worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// The coordinator binary's own hidden `worker` subcommand.
    pub fn current_exe(plugin_dir: &Path) -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe().context("cannot locate coordinator binary")?,
            args: vec![
                "worker".into(),
                "--plugin-dir".into(),
                plugin_dir.display().to_string(),
            ],
        })
    }
}

// ── Pooled worker process ────────────────────────────────────────────────────

struct PoolWorker {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    lines: Mutex<Lines<BufReader<ChildStdout>>>,
}

impl PoolWorker {
    async fn spawn(cmd: &WorkerCommand) -> Result<Arc<Self>> {
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Worker tracing shares the coordinator's stderr.
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn worker: {}", cmd.program.display()))?;
        let stdin = child.stdin.take().context("failed to capture worker stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("failed to capture worker stdout")?;
        Ok(Arc::new(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            lines: Mutex::new(BufReader::new(stdout).lines()),
        }))
    }

    async fn write_line<T: Serialize>(&self, value: &T) -> Result<()> {
        let mut payload = serde_json::to_string(value)?;
        payload.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn read_msg(&self) -> Result<WorkerMsg> {
        let mut lines = self.lines.lock().await;
        loop {
            let Some(line) = lines.next_line().await? else {
                bail!("worker process closed its pipe");
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .with_context(|| format!("bad worker message: {trimmed}"));
        }
    }

    async fn kill(&self) {
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}

// ── Pool backend ─────────────────────────────────────────────────────────────

struct PoolState {
    cmd: WorkerCommand,
    free: Mutex<VecDeque<Arc<PoolWorker>>>,
}

async fn replace_worker(state: &PoolState, dead: Arc<PoolWorker>) {
    dead.kill().await;
    match PoolWorker::spawn(&state.cmd).await {
        Ok(fresh) => state.free.lock().await.push_back(fresh),
        Err(e) => warn!(error = %e, "failed to respawn pool worker"),
    }
}

/// Fixed-size pool of isolated worker processes. An empty free list is
/// reported as `Busy` backpressure, never an indefinite block.
pub struct ProcessPoolBackend {
    state: Arc<PoolState>,
}

impl ProcessPoolBackend {
    pub async fn new(cmd: WorkerCommand, size: usize) -> Result<Self> {
        let mut free = VecDeque::with_capacity(size);
        for _ in 0..size {
            free.push_back(PoolWorker::spawn(&cmd).await?);
        }
        debug!(size, "worker pool ready");
        Ok(Self {
            state: Arc::new(PoolState {
                cmd,
                free: Mutex::new(free),
            }),
        })
    }
}

#[async_trait]
impl WorkerBackend for ProcessPoolBackend {
    async fn launch(
        &self,
        instance: &PluginInstance,
        phase: &str,
    ) -> crate::error::Result<Arc<dyn EventChannel>> {
        let worker = {
            let mut free = self.state.free.lock().await;
            free.pop_front().ok_or(CoordinatorError::Busy)?
        };
        let run = PoolRequest::Run {
            plugin: instance.definition.name.clone(),
            phase: phase.to_string(),
            config: instance.config.clone(),
        };
        if let Err(e) = worker.write_line(&run).await {
            replace_worker(&self.state, worker).await;
            return Err(CoordinatorError::Worker(e.to_string()));
        }
        Ok(Arc::new(PipeChannel {
            worker,
            pool: Arc::clone(&self.state),
            done: AtomicBool::new(false),
        }))
    }

    async fn shutdown(&self) {
        let mut free = self.state.free.lock().await;
        while let Some(worker) = free.pop_front() {
            let _ = worker.write_line(&PoolRequest::Shutdown).await;
            worker.kill().await;
        }
    }
}

/// Coordinator end of one leased worker-process run.
struct PipeChannel {
    worker: Arc<PoolWorker>,
    pool: Arc<PoolState>,
    done: AtomicBool,
}

#[async_trait]
impl EventChannel for PipeChannel {
    async fn send(&self, result: StepResult) -> Result<()> {
        self.worker.write_line(&PoolRequest::Step(result)).await
    }

    async fn recv(&self) -> Result<WorkerMsg> {
        let msg = self.worker.read_msg().await?;
        if msg.is_terminal() && !self.done.swap(true, Ordering::SeqCst) {
            // Run finished cleanly: the worker goes back on the free list.
            self.pool
                .free
                .lock()
                .await
                .push_back(Arc::clone(&self.worker));
        }
        Ok(msg)
    }

    async fn abandon(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        // Mid-run teardown: the worker may be wedged, so replace it.
        replace_worker(&self.pool, Arc::clone(&self.worker)).await;
    }
}

// ── Child-side loop ──────────────────────────────────────────────────────────

/// Entry point for the hidden `worker` subcommand: rebuild the registry from
/// the plugin dir, then serve phase runs over stdio until shutdown.
pub async fn worker_main(plugin_dir: PathBuf, loader: Arc<dyn PluginLoader>) -> Result<()> {
    let registry = PluginRegistry::new(loader);
    let loaded = registry.rescan(&plugin_dir).await?;
    debug!(plugins = loaded, "worker registry ready");

    let mut requests = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(request) = next_request(&mut requests).await? {
        match request {
            PoolRequest::Shutdown => break,
            PoolRequest::Step(_) => warn!("step with no run in flight"),
            PoolRequest::Run {
                plugin,
                phase,
                config,
            } => serve_run(&registry, &plugin, &phase, config, &mut requests, &mut stdout).await?,
        }
    }
    Ok(())
}

/// One phase run: bridge the coordinator's pipe to the in-process worker
/// loop, strictly alternating outward messages and step results.
async fn serve_run(
    registry: &PluginRegistry,
    plugin: &str,
    phase: &str,
    config: serde_json::Value,
    requests: &mut Lines<BufReader<Stdin>>,
    stdout: &mut Stdout,
) -> Result<()> {
    let handler = match materialize(registry, plugin, &config).await {
        Ok(handler) => handler,
        Err(e) => {
            // Load or instantiation failures surface as an error-carrying
            // terminal, not a dead worker.
            emit(stdout, &WorkerMsg::Ret {
                error: Some(e.to_string()),
            })
            .await?;
            return Ok(());
        }
    };

    let (channel, end) = task_channel();
    let task = tokio::spawn(run_worker(handler, phase.to_string(), Arc::new(end)));
    channel.bind(task).await;

    loop {
        let msg = channel.recv().await?;
        let terminal = msg.is_terminal();
        emit(stdout, &msg).await?;
        if terminal {
            break;
        }
        match next_request(requests).await? {
            Some(PoolRequest::Step(result)) => channel.send(result).await?,
            Some(_) => bail!("unexpected request while a run is in flight"),
            None => bail!("coordinator closed the pipe mid-run"),
        }
    }
    Ok(())
}

async fn materialize(
    registry: &PluginRegistry,
    plugin: &str,
    config: &serde_json::Value,
) -> Result<Arc<dyn PhaseHandler>> {
    let definition = registry.get(plugin).await?;
    definition.instantiate(config)
}

async fn next_request(requests: &mut Lines<BufReader<Stdin>>) -> Result<Option<PoolRequest>> {
    while let Some(line) = requests.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str(trimmed) {
            Ok(request) => return Ok(Some(request)),
            Err(e) => warn!(error = %e, "discarding malformed request line"),
        }
    }
    Ok(None)
}

async fn emit(stdout: &mut Stdout, msg: &WorkerMsg) -> Result<()> {
    let mut payload = serde_json::to_string(msg)?;
    payload.push('\n');
    stdout.write_all(payload.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{NoopHandler, fixture_registry};
    use std::time::Duration;

    #[tokio::test]
    async fn an_exhausted_pool_reports_busy() {
        let dir = tempfile::tempdir().unwrap();
        let registry = fixture_registry(dir.path(), &["access"], Arc::new(NoopHandler)).await;
        let table = crate::instances::InstanceTable::default();
        let instance = table.start(&registry, "echo", "{}").await.unwrap();

        let cmd = WorkerCommand {
            program: PathBuf::from("true"),
            args: vec![],
        };
        let backend = ProcessPoolBackend::new(cmd, 0).await.unwrap();
        assert!(matches!(
            backend.launch(&instance, "access").await,
            Err(CoordinatorError::Busy)
        ));
    }

    #[tokio::test]
    async fn a_dead_worker_breaks_the_channel_instead_of_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let registry = fixture_registry(dir.path(), &["access"], Arc::new(NoopHandler)).await;
        let table = crate::instances::InstanceTable::default();
        let instance = table.start(&registry, "echo", "{}").await.unwrap();

        // `cat` accepts the run request, echoes it (which is not a valid
        // worker message), and exits when its stdin closes.
        let cmd = WorkerCommand {
            program: PathBuf::from("cat"),
            args: vec![],
        };
        let backend = ProcessPoolBackend::new(cmd, 1).await.unwrap();
        let channel = backend.launch(&instance, "access").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), channel.recv()).await;
        assert!(result.is_ok_and(|r| r.is_err()));
        channel.abandon().await;
        backend.shutdown().await;
    }
}
