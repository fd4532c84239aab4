//! Worker execution loop.
//!
//! Claim a payload from the durable queue, take the record through
//! `ENQUEUED -> RUNNING`, run the implementation, and publish the
//! terminal status. Faults outside the implementation (unreadable
//! envelope, unknown kind) mark the task FAILED with a system comment.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use verdict_protocol::{defaults, TaskEnvelope, TaskKind, TaskParams, TaskStatus, TaskToken};
use verdict_store::models::QueueRow;
use verdict_store::{ConfigStore, StoreError};

use crate::cancel::DrainToken;
use crate::context::{TaskContext, TaskError};
use crate::kinds;

/// Worker configuration (plain data).
pub struct WorkerConfig {
    pub config_store_path: PathBuf,
    /// Server this worker belongs to; stamped on claims and heartbeats.
    pub server_id: String,
    pub worker_id: String,
    pub poll_interval: Duration,
}

pub struct Worker {
    store: ConfigStore,
    config: WorkerConfig,
    drain: DrainToken,
}

impl Worker {
    /// Open the configuration store and create the worker.
    pub async fn connect(config: WorkerConfig, drain: DrainToken) -> Result<Self> {
        let store = ConfigStore::open(&config.config_store_path)
            .await
            .context("Failed to open configuration store")?;
        info!("Worker {} connected to {}", config.worker_id, config.config_store_path.display());
        Ok(Self {
            store,
            config,
            drain,
        })
    }

    /// Build a worker over an already-open store (tests).
    pub fn with_store(store: ConfigStore, config: WorkerConfig, drain: DrainToken) -> Self {
        Self {
            store,
            config,
            drain,
        }
    }

    /// Main loop: claim-and-run until asked to drain.
    pub async fn run(&self) -> Result<()> {
        info!("Worker {} entering claim loop", self.config.worker_id);
        loop {
            if self.drain.is_draining() {
                info!("Worker {} draining, exiting claim loop", self.config.worker_id);
                return Ok(());
            }
            // A processed payload means the queue may hold more; only
            // sleep when it came back empty.
            if !self.run_once().await? {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    /// Claim and process a single payload. Returns false when the queue
    /// was empty.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(row) = self.store.queue().claim(&self.config.worker_id).await? else {
            return Ok(false);
        };
        let queue_id = row.id;
        self.process_payload(&row).await?;
        self.store.queue().remove(queue_id).await?;
        Ok(true)
    }

    async fn process_payload(&self, row: &QueueRow) -> Result<()> {
        let tasks = self.store.tasks();

        let envelope = match TaskEnvelope::unpack(&row.envelope) {
            Ok(envelope) => envelope,
            Err(err) => {
                // The envelope header is unusable; fall back to the
                // queue row's own token column.
                let token: TaskToken = row
                    .token
                    .parse()
                    .map_err(|e| anyhow!("queue row {} has an invalid token: {e}", row.id))?;
                self.fail_unstartable(token, &format!("unhandled: unreadable task payload: {err}"))
                    .await?;
                return Ok(());
            }
        };
        let token = envelope.token;

        // ENQUEUED -> RUNNING. Losing the race means the record moved
        // (cancelled, reaped, or claimed elsewhere): discard, no
        // transition written.
        if !tasks.claim_running(token, &self.config.server_id).await? {
            debug!("Discarding payload for {}: record is not ENQUEUED", token);
            return Ok(());
        }

        let Some(kind) = TaskKind::from_tag(&envelope.kind_tag) else {
            self.conclude(
                token,
                TaskStatus::Failed,
                Some(format!("unhandled: unknown task kind '{}'", envelope.kind_tag)),
            )
            .await?;
            return Ok(());
        };

        let params = match TaskParams::from_payload(kind, &envelope.payload) {
            Ok(params) => params,
            Err(err) => {
                self.conclude(
                    token,
                    TaskStatus::Failed,
                    Some(format!("unhandled: malformed {kind} parameters: {err}")),
                )
                .await?;
                return Ok(());
            }
        };

        let record = tasks
            .get_row(token)
            .await?
            .ok_or_else(|| anyhow!("task {token} vanished after claim"))?;
        let ctx = TaskContext::new(
            self.store.clone(),
            self.config.server_id.clone(),
            token,
            record.product_endpoint.clone(),
            record.data_dir.clone().map(PathBuf::from),
            self.drain.clone(),
        );

        info!("Running task {} kind={}", token, kind);
        match kinds::run_task(&ctx, &params).await {
            Ok(()) => {
                self.conclude(token, TaskStatus::Completed, None).await?;
            }
            Err(TaskError::Cancelled) => {
                // Same sentinel, two meanings: an administrative cancel
                // concludes CANCELLED, a drain-induced one DROPPED.
                let cancel_requested = tasks
                    .get_row(token)
                    .await?
                    .map(|r| r.cancel_requested)
                    .unwrap_or(false);
                let status = if cancel_requested {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Dropped
                };
                self.conclude(token, status, None).await?;
            }
            Err(TaskError::Failed(err)) => {
                self.conclude(token, TaskStatus::Failed, Some(format!("unhandled: {err:#}")))
                    .await?;
            }
        }
        Ok(())
    }

    /// Mark a payload that never reached its implementation as FAILED.
    async fn fail_unstartable(&self, token: TaskToken, comment: &str) -> Result<()> {
        if !self
            .store
            .tasks()
            .claim_running(token, &self.config.server_id)
            .await?
        {
            warn!("Unstartable payload for {} discarded: record is not ENQUEUED", token);
            return Ok(());
        }
        self.conclude(token, TaskStatus::Failed, Some(comment.to_string()))
            .await
    }

    /// Publish the terminal status, retrying transient storage failures
    /// with bounded backoff. If the write remains impossible the worker
    /// process must exit so the reaper demotes the task.
    async fn conclude(
        &self,
        token: TaskToken,
        status: TaskStatus,
        system_comment: Option<String>,
    ) -> Result<()> {
        let tasks = self.store.tasks();

        if let Some(body) = &system_comment {
            if let Err(err) = tasks
                .add_comment(token, defaults::SYSTEM_ACTOR, body)
                .await
            {
                warn!("Failed to attach system comment to {}: {}", token, err);
            }
        }

        let mut attempt: u32 = 0;
        loop {
            match tasks.finish(token, status).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict(_)) => {
                    // The record concluded underneath us (reaper
                    // demotion); the terminal write stands as-is.
                    warn!("Task {} already terminal; skipped {} write", token, status);
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    if attempt > defaults::TERMINAL_WRITE_RETRIES {
                        return Err(anyhow!(
                            "giving up on terminal write for {token}: {err}"
                        ));
                    }
                    let backoff = defaults::TERMINAL_WRITE_BACKOFF_MS << (attempt - 1);
                    warn!(
                        "Terminal write for {} failed (attempt {}): {}; retrying in {}ms",
                        token, attempt, err, backoff
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdict_protocol::EchoParams;

    async fn setup() -> (ConfigStore, Worker) {
        let store = ConfigStore::open_in_memory().await.unwrap();
        store.init().await.unwrap();
        let worker = Worker::with_store(
            store.clone(),
            WorkerConfig {
                config_store_path: PathBuf::new(),
                server_id: "srv-test".to_string(),
                worker_id: "w-test".to_string(),
                poll_interval: Duration::from_millis(10),
            },
            DrainToken::new(),
        );
        (store, worker)
    }

    async fn push_task(store: &ConfigStore, params: &TaskParams) -> TaskToken {
        let token = TaskToken::new();
        store
            .tasks()
            .allocate(token, params.kind().as_str(), "test", Some("alice"), None)
            .await
            .unwrap();
        store.tasks().mark_enqueued(token, "srv-test").await.unwrap();
        let envelope = TaskEnvelope::new(
            token,
            params.kind().as_str(),
            params.to_payload().unwrap(),
        )
        .unwrap();
        store
            .queue()
            .push(token, &envelope.pack().unwrap())
            .await
            .unwrap();
        token
    }

    fn echo(delay_ms: u64, fail_with: Option<&str>) -> TaskParams {
        TaskParams::Echo(EchoParams {
            delay_ms,
            check_interval_ms: 5,
            fail_with: fail_with.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn test_run_once_empty_queue() {
        let (_store, worker) = setup().await;
        assert!(!worker.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_clean_exit_completes() {
        let (store, worker) = setup().await;
        let token = push_task(&store, &echo(10, None)).await;

        assert!(worker.run_once().await.unwrap());

        let info = store.tasks().get_info(token).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Completed);
        assert!(info.owning_server.is_none());
        assert_eq!(store.queue().depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_raised_error_fails_with_system_comment() {
        let (store, worker) = setup().await;
        let token = push_task(&store, &echo(5, Some("boom"))).await;

        worker.run_once().await.unwrap();

        let info = store.tasks().get_info(token).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Failed);
        assert_eq!(info.comments.len(), 1);
        assert_eq!(info.comments[0].actor, defaults::SYSTEM_ACTOR);
        assert!(info.comments[0].body.contains("unhandled: boom"));
    }

    #[tokio::test]
    async fn test_admin_cancel_concludes_cancelled() {
        let (store, worker) = setup().await;
        let token = push_task(&store, &echo(10_000, None)).await;
        store.tasks().request_cancel(token).await.unwrap();

        worker.run_once().await.unwrap();

        let info = store.tasks().get_info(token).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_drain_concludes_dropped() {
        let (store, worker) = setup().await;
        let token = push_task(&store, &echo(10_000, None)).await;

        // Drain before the first cancellation check: the sentinel is
        // raised without an administrative cancel.
        worker.drain.start_drain();
        worker.run_once().await.unwrap();

        let info = store.tasks().get_info(token).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Dropped);
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_with_comment() {
        let (store, worker) = setup().await;
        let token = TaskToken::new();
        store
            .tasks()
            .allocate(token, "mystery", "test", None, None)
            .await
            .unwrap();
        store.tasks().mark_enqueued(token, "srv-test").await.unwrap();
        let envelope = TaskEnvelope::new(token, "mystery", b"{}".to_vec()).unwrap();
        store
            .queue()
            .push(token, &envelope.pack().unwrap())
            .await
            .unwrap();

        worker.run_once().await.unwrap();

        let info = store.tasks().get_info(token).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Failed);
        assert!(info.comments[0].body.contains("unknown task kind"));
    }

    #[tokio::test]
    async fn test_not_enqueued_payload_discarded_without_transition() {
        let (store, worker) = setup().await;
        // Allocate but never mark ENQUEUED; stage a payload anyway.
        let token = TaskToken::new();
        store
            .tasks()
            .allocate(token, "echo", "test", None, None)
            .await
            .unwrap();
        let envelope = TaskEnvelope::new(
            token,
            "echo",
            TaskParams::Echo(EchoParams {
                delay_ms: 1,
                check_interval_ms: 1,
                fail_with: None,
            })
            .to_payload()
            .unwrap(),
        )
        .unwrap();
        store
            .queue()
            .push(token, &envelope.pack().unwrap())
            .await
            .unwrap();

        assert!(worker.run_once().await.unwrap());

        // No transition was written and the payload is gone.
        let info = store.tasks().get_info(token).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Allocated);
        assert_eq!(store.queue().depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_garbled_envelope_fails_task() {
        let (store, worker) = setup().await;
        let token = TaskToken::new();
        store
            .tasks()
            .allocate(token, "echo", "test", None, None)
            .await
            .unwrap();
        store.tasks().mark_enqueued(token, "srv-test").await.unwrap();
        store.queue().push(token, b"not an envelope").await.unwrap();

        worker.run_once().await.unwrap();

        let info = store.tasks().get_info(token).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Failed);
        assert!(info.comments[0].body.contains("unreadable task payload"));
    }
}
