//! Verdict server process.
//!
//! Usage:
//!     verdict-server --bind tcp://127.0.0.1:8591 --server-id srv-1

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use verdict_logging::LogConfig;
use verdict_protocol::defaults;
use verdict_server::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "verdict-server", about = "Multi-product analysis results server")]
struct Args {
    /// RPC bind address
    #[arg(long, default_value = defaults::DEFAULT_RPC_BIND_ADDR)]
    bind: String,

    /// Stable name of this server process
    #[arg(long, env = "VERDICT_SERVER_ID", default_value = "verdict-1")]
    server_id: String,

    /// Configuration store path
    #[arg(long, env = "VERDICT_CONFIG_STORE")]
    config_store: Option<PathBuf>,

    /// Root directory for task data directories
    #[arg(long)]
    scratch_root: Option<PathBuf>,

    /// Worker process count (0 = CPU count)
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Worker binary (defaults to verdict-worker next to this executable)
    #[arg(long)]
    worker_bin: Option<PathBuf>,

    /// Serve everyone as superuser without sessions
    #[arg(long)]
    no_auth: bool,

    /// Heartbeat staleness bound in seconds
    #[arg(long, default_value_t = defaults::DEFAULT_STALE_SECS)]
    stale_secs: i64,

    /// Graceful shutdown window for workers, in seconds
    #[arg(long, default_value_t = defaults::DEFAULT_GRACEFUL_SHUTDOWN_SECS)]
    graceful_secs: u64,

    /// Optional wall-clock bound on task runtime, in seconds
    #[arg(long)]
    max_task_runtime_secs: Option<i64>,

    /// Verbose console logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    verdict_logging::init_logging(LogConfig {
        app_name: "verdict-server",
        verbose: args.verbose,
        quiet_console: false,
    })?;

    let config = ServerConfig {
        bind_addr: args.bind,
        server_id: args.server_id,
        config_store_path: args
            .config_store
            .unwrap_or_else(verdict_protocol::paths::default_config_store_path),
        scratch_root: args
            .scratch_root
            .unwrap_or_else(verdict_protocol::paths::default_scratch_root),
        worker_count: args.workers,
        worker_binary: args.worker_bin,
        auth_disabled: args.no_auth,
        stale_secs: args.stale_secs,
        graceful_shutdown: Duration::from_secs(args.graceful_secs),
        max_task_runtime_secs: args.max_task_runtime_secs,
        ..Default::default()
    };

    tracing::info!("Starting Verdict server");
    tracing::info!("  Bind: {}", config.bind_addr);
    tracing::info!("  Server ID: {}", config.server_id);
    tracing::info!("  Config store: {}", config.config_store_path.display());
    tracing::info!("  Scratch root: {}", config.scratch_root.display());

    let server = Server::new(config).await?;
    spawn_signal_handler(server.shutdown_trigger());
    server.run().await
}

#[cfg(unix)]
fn spawn_signal_handler(trigger: std::sync::Arc<tokio::sync::watch::Sender<bool>>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::info!("Stop signal received, draining");
        let _ = trigger.send(true);
    });
}

#[cfg(not(unix))]
fn spawn_signal_handler(trigger: std::sync::Arc<tokio::sync::watch::Sender<bool>>) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Stop signal received, draining");
        let _ = trigger.send(true);
    });
}
