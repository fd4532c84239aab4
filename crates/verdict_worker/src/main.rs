//! Verdict worker process.
//!
//! Usage:
//!     verdict-worker --server-id srv-1 [--config-store ~/.verdict/verdict.sqlite]
//!
//! On SIGTERM the worker drains: the current task observes
//! `should_cancel`, raises the cancellation sentinel, and the process
//! exits once the claim loop winds down.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use verdict_logging::LogConfig;
use verdict_protocol::defaults;
use verdict_worker::{DrainToken, Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "verdict-worker", about = "Background task worker for Verdict")]
struct Args {
    /// Configuration store path
    #[arg(long, env = "VERDICT_CONFIG_STORE")]
    config_store: Option<PathBuf>,

    /// Server this worker belongs to
    #[arg(long, env = "VERDICT_SERVER_ID")]
    server_id: String,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Queue poll interval in milliseconds
    #[arg(long, default_value_t = defaults::WORKER_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,

    /// Verbose console logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    verdict_logging::init_logging(LogConfig {
        app_name: "verdict-worker",
        verbose: args.verbose,
        quiet_console: false,
    })?;

    let worker_id = args.worker_id.unwrap_or_else(|| {
        format!(
            "{}-{}",
            args.server_id,
            uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
        )
    });
    let config_store = args
        .config_store
        .unwrap_or_else(verdict_protocol::paths::default_config_store_path);

    tracing::info!("Starting Verdict worker");
    tracing::info!("  Config store: {}", config_store.display());
    tracing::info!("  Server ID: {}", args.server_id);
    tracing::info!("  Worker ID: {}", worker_id);

    let drain = DrainToken::new();
    spawn_signal_handler(drain.clone());

    let config = WorkerConfig {
        config_store_path: config_store,
        server_id: args.server_id,
        worker_id,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
    };

    let worker = Worker::connect(config, drain).await?;
    worker.run().await?;

    Ok(())
}

#[cfg(unix)]
fn spawn_signal_handler(drain: DrainToken) {
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
        drain.start_drain();
    });
}

#[cfg(not(unix))]
fn spawn_signal_handler(drain: DrainToken) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Stop signal received, draining");
        drain.start_drain();
    });
}
