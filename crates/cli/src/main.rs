mod serve;

use std::{path::PathBuf, sync::Arc};

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(
    name = "outrig",
    about = "Outrig — out-of-process plugin runtime for API gateways"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator and serve dispatch frames over stdio.
    Serve {
        /// Directory of plugin modules.
        #[arg(long)]
        plugin_dir: Option<PathBuf>,
        /// Worker backend: task (cooperative) or pool (isolated processes).
        #[arg(long)]
        backend: Option<String>,
        /// Worker processes kept in the pool.
        #[arg(long)]
        pool_size: Option<usize>,
        /// Seconds an event may spend awaiting one worker message.
        #[arg(long)]
        event_deadline: Option<u64>,
        /// Seconds of inactivity before an instance is evicted.
        #[arg(long)]
        instance_ttl: Option<u64>,
    },
    /// Internal: run as a pooled worker process.
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        plugin_dir: PathBuf,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // stdout carries protocol frames, so logs always go to stderr.
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    match cli.command {
        Commands::Serve {
            plugin_dir,
            backend,
            pool_size,
            event_deadline,
            instance_ttl,
        } => {
            info!(version = env!("CARGO_PKG_VERSION"), "outrig starting");
            serve::run(serve::ServeOpts {
                plugin_dir,
                backend,
                pool_size,
                event_deadline,
                instance_ttl,
            })
            .await
        }
        Commands::Worker { plugin_dir } => {
            outrig_server::pool::worker_main(
                plugin_dir,
                Arc::new(outrig_server::scripted::ScriptedLoader),
            )
            .await
        }
    }
}
