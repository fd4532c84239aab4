//! Heartbeat reaper and housekeeping sweep.
//!
//! A periodic pass that demotes silent `RUNNING` records to `DROPPED`,
//! drops never-pushed allocations, recovers abandoned queue payloads,
//! ages out terminal data directories past their grace window, flags
//! overdue tasks for cancellation, and purges expired sessions.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use verdict_protocol::TaskToken;
use verdict_store::{now_secs, ConfigStore};

use crate::config::ServerConfig;
use crate::metrics::METRICS;

pub struct Reaper {
    store: ConfigStore,
    server_id: String,
    scratch_root: PathBuf,
    stale_secs: i64,
    orphan_secs: i64,
    allocated_timeout_secs: i64,
    data_dir_grace_secs: i64,
    max_task_runtime_secs: Option<i64>,
    interval: Duration,
    /// Allocations older than the boot instant belong to a previous
    /// incarnation and are dropped on the first sweep.
    boot_time: i64,
}

impl Reaper {
    pub fn new(store: ConfigStore, config: &ServerConfig) -> Self {
        Self {
            store,
            server_id: config.server_id.clone(),
            scratch_root: config.scratch_root.clone(),
            stale_secs: config.stale_secs,
            orphan_secs: config.orphan_secs,
            allocated_timeout_secs: config.allocated_timeout_secs,
            data_dir_grace_secs: config.data_dir_grace_secs,
            max_task_runtime_secs: config.max_task_runtime_secs,
            interval: config.reaper_interval,
            boot_time: now_secs(),
        }
    }

    /// Run sweeps until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Reaper started (interval {:?})", self.interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    info!("Reaper stopped");
                    return;
                }
            }
            if let Err(err) = self.sweep().await {
                warn!("Reaper sweep failed: {}", err);
                METRICS.inc_db_errors();
            }
        }
    }

    /// One full housekeeping pass.
    pub async fn sweep(&self) -> Result<()> {
        let tasks = self.store.tasks();
        let queue = self.store.queue();

        let demoted = tasks
            .reap_stale_running(&self.server_id, self.stale_secs, self.orphan_secs)
            .await?;
        if !demoted.is_empty() {
            info!("Demoted {} silent RUNNING tasks to DROPPED", demoted.len());
            METRICS.inc_tasks_dropped_by(demoted.len() as u64);
        }

        let cutoff = self.boot_time.max(now_secs() - self.allocated_timeout_secs);
        let dropped = tasks.reap_stale_allocated(cutoff).await?;
        if !dropped.is_empty() {
            info!("Dropped {} never-pushed allocations", dropped.len());
            METRICS.inc_tasks_dropped_by(dropped.len() as u64);
        }

        if let Some(max_runtime) = self.max_task_runtime_secs {
            let flagged = tasks.request_cancel_overdue(max_runtime).await?;
            if flagged > 0 {
                info!("Flagged {} overdue tasks for cancellation", flagged);
            }
        }

        queue.reclaim_abandoned(self.stale_secs).await?;
        queue.purge_settled().await?;

        self.remove_expired_data_dirs().await?;
        self.remove_orphan_data_dirs().await?;

        let purged = self.store.auth().purge_expired_sessions().await?;
        if purged > 0 {
            debug!("Purged {} expired sessions", purged);
        }

        Ok(())
    }

    /// Remove data directories whose task concluded past the grace
    /// window. Removal happens exactly once per task.
    async fn remove_expired_data_dirs(&self) -> Result<()> {
        let tasks = self.store.tasks();
        for (token, dir) in tasks.data_dirs_to_remove(self.data_dir_grace_secs).await? {
            let path = PathBuf::from(&dir);
            if path.exists() {
                if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                    warn!("Failed to remove data directory {}: {}", path.display(), err);
                    continue;
                }
                debug!("Removed data directory for {}", token);
            }
            tasks.mark_data_dir_removed(token).await?;
        }
        Ok(())
    }

    /// Remove scratch entries whose task record no longer exists (e.g.
    /// left behind by a crash before the record write).
    async fn remove_orphan_data_dirs(&self) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.scratch_root).await {
            Ok(entries) => entries,
            Err(_) => return Ok(()), // scratch root not created yet
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(token) = name.parse::<TaskToken>() else {
                continue; // not one of ours
            };
            if self.store.tasks().get_row(token).await?.is_none() {
                let path = entry.path();
                if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                    warn!("Failed to remove orphan directory {}: {}", path.display(), err);
                } else {
                    info!("Removed orphan data directory {}", path.display());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use verdict_protocol::TaskStatus;

    async fn setup(stale_secs: i64, grace_secs: i64) -> (TempDir, ConfigStore, Reaper) {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open_in_memory().await.unwrap();
        store.init().await.unwrap();
        let config = ServerConfig {
            server_id: "srv-test".to_string(),
            scratch_root: dir.path().to_path_buf(),
            stale_secs,
            data_dir_grace_secs: grace_secs,
            ..Default::default()
        };
        let reaper = Reaper::new(store.clone(), &config);
        (dir, store, reaper)
    }

    #[tokio::test]
    async fn test_sweep_demotes_stale_running() {
        let (_dir, store, reaper) = setup(-1, 3600).await;
        let tasks = store.tasks();

        let token = verdict_protocol::TaskToken::new();
        tasks.allocate(token, "echo", "x", None, None).await.unwrap();
        tasks.mark_enqueued(token, "srv-test").await.unwrap();
        tasks.claim_running(token, "srv-test").await.unwrap();

        reaper.sweep().await.unwrap();

        let info = tasks.get_info(token).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Dropped);
        assert!(info.owning_server.is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_data_dir_once() {
        let (dir, store, reaper) = setup(3600, -1).await;
        let tasks = store.tasks();

        let token = verdict_protocol::TaskToken::new();
        tasks.allocate(token, "echo", "x", None, None).await.unwrap();
        let data_dir = dir.path().join(token.to_string());
        std::fs::create_dir_all(&data_dir).unwrap();
        tasks
            .set_data_dir(token, &data_dir.display().to_string())
            .await
            .unwrap();
        tasks.mark_enqueued(token, "srv-test").await.unwrap();
        tasks.claim_running(token, "srv-test").await.unwrap();
        tasks.finish(token, TaskStatus::Completed).await.unwrap();

        reaper.sweep().await.unwrap();
        assert!(!data_dir.exists());

        // Second sweep has nothing left to remove.
        assert!(tasks
            .data_dirs_to_remove(-1)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_sweep_keeps_dir_within_grace() {
        let (dir, store, reaper) = setup(3600, 3600).await;
        let tasks = store.tasks();

        let token = verdict_protocol::TaskToken::new();
        tasks.allocate(token, "echo", "x", None, None).await.unwrap();
        let data_dir = dir.path().join(token.to_string());
        std::fs::create_dir_all(&data_dir).unwrap();
        tasks
            .set_data_dir(token, &data_dir.display().to_string())
            .await
            .unwrap();
        tasks.mark_enqueued(token, "srv-test").await.unwrap();
        tasks.claim_running(token, "srv-test").await.unwrap();
        tasks.finish(token, TaskStatus::Failed).await.unwrap();

        reaper.sweep().await.unwrap();
        // Within the grace window the client can still fetch outputs.
        assert!(data_dir.exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_orphan_dirs() {
        let (dir, _store, reaper) = setup(3600, 3600).await;
        let orphan_token = verdict_protocol::TaskToken::new();
        let orphan = dir.path().join(orphan_token.to_string());
        std::fs::create_dir_all(&orphan).unwrap();
        // Unrelated entries are left alone.
        let unrelated = dir.path().join("not-a-token");
        std::fs::create_dir_all(&unrelated).unwrap();

        reaper.sweep().await.unwrap();
        assert!(!orphan.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_sweep_drops_pre_boot_allocations() {
        let (_dir, store, reaper) = setup(3600, 3600).await;
        let tasks = store.tasks();

        // Simulate a record allocated before this server booted.
        let token = verdict_protocol::TaskToken::new();
        tasks.allocate(token, "echo", "x", None, None).await.unwrap();
        sqlx::query("UPDATE tasks SET created_at = created_at - 10 WHERE token = ?")
            .bind(token.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        reaper.sweep().await.unwrap();
        let info = tasks.get_info(token).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Dropped);
    }
}
