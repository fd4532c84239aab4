//! Worker pool supervisor.
//!
//! Spawns a fixed set of worker OS processes at boot, respawns any that
//! die unexpectedly, and tears them down on shutdown: SIGTERM first so
//! in-flight tasks can raise the cancellation sentinel, SIGKILL for
//! whatever remains after the graceful window.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::ServerConfig;

pub struct WorkerPool {
    config: ServerConfig,
    worker_binary: PathBuf,
    children: Vec<Child>,
}

impl WorkerPool {
    /// Locate the worker binary and spawn the pool.
    pub async fn spawn(config: &ServerConfig) -> Result<Self> {
        let worker_binary = match &config.worker_binary {
            Some(path) => path.clone(),
            None => default_worker_binary()?,
        };

        let mut pool = Self {
            config: config.clone(),
            worker_binary,
            children: Vec::new(),
        };

        let count = config.effective_worker_count();
        for index in 0..count {
            let child = pool.spawn_one(index).await?;
            pool.children.push(child);
        }
        info!("Spawned {} worker processes", count);
        Ok(pool)
    }

    async fn spawn_one(&self, index: usize) -> Result<Child> {
        let worker_id = format!("{}-w{}", self.config.server_id, index);
        let child = Command::new(&self.worker_binary)
            .arg("--config-store")
            .arg(&self.config.config_store_path)
            .arg("--server-id")
            .arg(&self.config.server_id)
            .arg("--worker-id")
            .arg(&worker_id)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!("Failed to spawn worker from {}", self.worker_binary.display())
            })?;
        info!(
            "Worker {} started (pid {:?})",
            worker_id,
            child.id()
        );
        Ok(child)
    }

    /// Supervise until shutdown: respawn dead workers, then drain.
    pub async fn supervise(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(2)) => {
                    self.respawn_dead().await;
                }
                _ = shutdown.changed() => {
                    self.drain().await;
                    return;
                }
            }
        }
    }

    async fn respawn_dead(&mut self) {
        for index in 0..self.children.len() {
            let exited = match self.children[index].try_wait() {
                Ok(Some(status)) => {
                    warn!("Worker {} exited ({}), respawning", index, status);
                    true
                }
                Ok(None) => false,
                Err(err) => {
                    error!("Failed to poll worker {}: {}", index, err);
                    false
                }
            };
            if exited {
                match self.spawn_one(index).await {
                    Ok(child) => self.children[index] = child,
                    Err(err) => error!("Failed to respawn worker {}: {}", index, err),
                }
            }
        }
    }

    /// Graceful teardown: SIGTERM, bounded wait, SIGKILL stragglers.
    /// Tasks still RUNNING after the kill are demoted to DROPPED by the
    /// next reaper pass.
    async fn drain(&mut self) {
        info!(
            "Draining {} workers (graceful window {:?})",
            self.children.len(),
            self.config.graceful_shutdown
        );
        for child in &self.children {
            if let Some(pid) = child.id() {
                terminate(pid);
            }
        }

        let deadline = Instant::now() + self.config.graceful_shutdown;
        for child in &mut self.children {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, child.wait()).await {
                Ok(Ok(status)) => info!("Worker exited: {}", status),
                Ok(Err(err)) => warn!("Worker wait failed: {}", err),
                Err(_) => {
                    warn!("Worker did not drain in time; killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        info!("Worker pool drained");
    }
}

fn default_worker_binary() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate server executable")?;
    let dir = exe
        .parent()
        .context("Server executable has no parent directory")?;
    let candidate = dir.join("verdict-worker");
    if !candidate.exists() {
        anyhow::bail!(
            "verdict-worker not found next to the server binary ({}); pass --worker-bin",
            candidate.display()
        );
    }
    Ok(candidate)
}

#[cfg(unix)]
fn terminate(pid: u32) {
    // SIGTERM lets the worker drain its current task.
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {
    // No SIGTERM equivalent; the kill path below handles teardown.
}
