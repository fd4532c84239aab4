//! Task manager: the server-side authority on task submission.
//!
//! Workers own the `ENQUEUED -> RUNNING -> terminal` half of the state
//! machine; everything up to and including the enqueue, plus the
//! query/admin operations, lives here.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::info;
use verdict_protocol::{
    defaults, ApiError, TaskEnvelope, TaskFilter, TaskInfo, TaskParams, TaskStatus, TaskToken,
};
use verdict_store::ConfigStore;

use crate::metrics::METRICS;

pub struct TaskManager {
    store: ConfigStore,
    server_id: String,
    scratch_root: PathBuf,
    queue_capacity: i64,
    /// Long-poll cadence; jitter is added per sleep.
    await_poll_interval: Duration,
    /// Flipped on server shutdown; releases long-poll waiters.
    shutdown: watch::Receiver<bool>,
}

impl TaskManager {
    pub fn new(
        store: ConfigStore,
        server_id: String,
        scratch_root: PathBuf,
        queue_capacity: i64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            server_id,
            scratch_root,
            queue_capacity,
            await_poll_interval: Duration::from_millis(defaults::AWAIT_POLL_INTERVAL_MS),
            shutdown,
        }
    }

    /// Override the long-poll cadence (tests and latency-sensitive
    /// deployments).
    pub fn with_await_poll_interval(mut self, interval: Duration) -> Self {
        self.await_poll_interval = interval;
        self
    }

    /// Write a new `ALLOCATED` record and hand back its token.
    pub async fn allocate(
        &self,
        params: &TaskParams,
        summary: &str,
        actor: Option<&str>,
        product: Option<&str>,
    ) -> Result<TaskToken, ApiError> {
        let token = TaskToken::new();
        self.store
            .tasks()
            .allocate(token, params.kind().as_str(), summary, actor, product)
            .await
            .map_err(ApiError::from)?;
        Ok(token)
    }

    /// Create (idempotently) the task-private scratch directory.
    pub async fn create_data_dir(&self, token: TaskToken) -> Result<PathBuf, ApiError> {
        let record = self
            .store
            .tasks()
            .get_row(token)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::not_found(format!("no such task: {token}")))?;
        let status = record.parsed_status().map_err(ApiError::from)?;
        if status.is_terminal() {
            return Err(ApiError::not_found(format!(
                "task {token} is already terminal"
            )));
        }

        if let Some(existing) = &record.data_dir {
            return Ok(PathBuf::from(existing));
        }

        let dir = self.scratch_root.join(token.to_string());
        create_private_dir(&dir)
            .map_err(|e| ApiError::fatal(format!("failed to create data directory: {e}")))?;
        self.store
            .tasks()
            .set_data_dir(token, &dir.display().to_string())
            .await
            .map_err(ApiError::from)?;
        info!("Created data directory for {}", token);
        Ok(dir)
    }

    /// Serialize, verify, and enqueue a payload.
    ///
    /// The payload is round-tripped through the envelope before it is
    /// staged, so anything that cannot be reconstructed on the worker
    /// side is rejected here, while the record is still `ALLOCATED`.
    /// When the queue is at capacity the call blocks up to the push
    /// deadline, then fails with `Backpressure` and leaves the record
    /// `ALLOCATED`.
    pub async fn push(&self, token: TaskToken, params: &TaskParams) -> Result<(), ApiError> {
        let payload = params
            .to_payload()
            .map_err(|e| ApiError::input_malformed(format!("unserializable payload: {e}")))?;
        let envelope = TaskEnvelope::new(token, params.kind().as_str(), payload)
            .map_err(|e| ApiError::input_malformed(e.to_string()))?;
        let packed = envelope
            .pack()
            .map_err(|e| ApiError::input_malformed(e.to_string()))?;

        // Round-trip check: the bytes must reconstruct to the same
        // parameter record a worker will see.
        let reparsed = TaskEnvelope::unpack(&packed)
            .map_err(|e| ApiError::input_malformed(format!("payload round-trip failed: {e}")))?;
        let decoded = TaskParams::from_payload(params.kind(), &reparsed.payload)
            .map_err(|e| ApiError::input_malformed(format!("payload round-trip failed: {e}")))?;
        if decoded != *params {
            return Err(ApiError::input_malformed(
                "payload round-trip produced a different parameter record",
            ));
        }

        // Bounded-blocking capacity gate.
        let deadline = Instant::now() + Duration::from_millis(defaults::PUSH_DEADLINE_MS);
        loop {
            let depth = self.store.queue().depth().await.map_err(ApiError::from)?;
            if depth < self.queue_capacity {
                break;
            }
            if Instant::now() >= deadline {
                return Err(ApiError::backpressure(format!(
                    "task queue is at capacity ({depth})"
                )));
            }
            tokio::time::sleep(Duration::from_millis(defaults::PUSH_RETRY_INTERVAL_MS)).await;
        }

        self.store
            .queue()
            .push_with_transition(token, &self.server_id, &packed)
            .await
            .map_err(ApiError::from)?;
        METRICS.inc_tasks_enqueued();
        Ok(())
    }

    pub async fn get(&self, token: TaskToken) -> Result<TaskInfo, ApiError> {
        self.store
            .tasks()
            .get_info(token)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::not_found(format!("no such task: {token}")))
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskInfo>, ApiError> {
        self.store.tasks().list(filter).await.map_err(ApiError::from)
    }

    /// Admin cancellation. True when the flag was newly set on a live
    /// record; terminal tasks are unaffected.
    pub async fn cancel(&self, token: TaskToken) -> Result<bool, ApiError> {
        self.store
            .tasks()
            .request_cancel(token)
            .await
            .map_err(ApiError::from)
    }

    pub async fn add_comment(
        &self,
        token: TaskToken,
        actor: &str,
        body: &str,
    ) -> Result<(), ApiError> {
        self.store
            .tasks()
            .add_comment(token, actor, body)
            .await
            .map_err(ApiError::from)
    }

    /// Long-poll until the record reaches a terminal status.
    ///
    /// Bounded polling with a jittered cadence; returns early the
    /// moment a terminal status is observed, or fails `Transient` when
    /// the server starts draining so the caller retries elsewhere.
    pub async fn await_terminal(
        &self,
        token: TaskToken,
        consume: bool,
    ) -> Result<TaskStatus, ApiError> {
        let mut shutdown = self.shutdown.clone();
        loop {
            let info = self.get(token).await?;
            if info.status.is_terminal() {
                if consume {
                    self.store
                        .tasks()
                        .set_consumed(token)
                        .await
                        .map_err(ApiError::from)?;
                }
                return Ok(info.status);
            }

            let sleep = self.await_poll_interval
                + Duration::from_millis(poll_jitter_ms(self.await_poll_interval));
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.changed() => {
                    return Err(ApiError::transient("server is shutting down"));
                }
            }
        }
    }
}

fn poll_jitter_ms(interval: Duration) -> u64 {
    let cap = defaults::AWAIT_POLL_JITTER_MS
        .min(interval.as_millis() as u64)
        .max(1);
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_millis() as u64 % cap)
        .unwrap_or(0)
}

/// Create a directory readable by this process only.
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::DirBuilder::new().mode(0o700).create(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use verdict_protocol::EchoParams;

    fn echo(delay_ms: u64) -> TaskParams {
        TaskParams::Echo(EchoParams {
            delay_ms,
            check_interval_ms: 10,
            fail_with: None,
        })
    }

    async fn setup(capacity: i64) -> (TempDir, ConfigStore, TaskManager, watch::Sender<bool>) {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open_in_memory().await.unwrap();
        store.init().await.unwrap();
        let (tx, rx) = watch::channel(false);
        let tm = TaskManager::new(
            store.clone(),
            "srv-test".to_string(),
            dir.path().join("tasks"),
            capacity,
            rx,
        );
        (dir, store, tm, tx)
    }

    #[tokio::test]
    async fn test_allocate_push_marks_enqueued() {
        let (_dir, store, tm, _tx) = setup(16).await;
        let params = echo(10);
        let token = tm
            .allocate(&params, "demo", Some("alice"), None)
            .await
            .unwrap();

        tm.push(token, &params).await.unwrap();

        let info = store.tasks().get_info(token).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Enqueued);
        assert_eq!(info.owning_server.as_deref(), Some("srv-test"));
        assert_eq!(store.queue().depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_push_backpressure_leaves_record_allocated() {
        let (_dir, store, tm, _tx) = setup(1).await;
        let params = echo(10);

        let first = tm.allocate(&params, "one", None, None).await.unwrap();
        tm.push(first, &params).await.unwrap();

        let second = tm.allocate(&params, "two", None, None).await.unwrap();
        let err = tm.push(second, &params).await.unwrap_err();
        assert_eq!(err.kind, verdict_protocol::ErrorKind::Backpressure);

        let info = store.tasks().get_info(second).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Allocated);
    }

    #[tokio::test]
    async fn test_double_push_conflicts() {
        let (_dir, _store, tm, _tx) = setup(16).await;
        let params = echo(10);
        let token = tm.allocate(&params, "demo", None, None).await.unwrap();
        tm.push(token, &params).await.unwrap();

        let err = tm.push(token, &params).await.unwrap_err();
        assert_eq!(err.kind, verdict_protocol::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_data_dir_idempotent_and_private() {
        let (_dir, _store, tm, _tx) = setup(16).await;
        let params = echo(10);
        let token = tm.allocate(&params, "demo", None, None).await.unwrap();

        let created = tm.create_data_dir(token).await.unwrap();
        assert!(created.exists());
        let again = tm.create_data_dir(token).await.unwrap();
        assert_eq!(created, again);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&created).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        let missing = tm.create_data_dir(TaskToken::new()).await.unwrap_err();
        assert_eq!(missing.kind, verdict_protocol::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_await_terminal_returns_on_shutdown() {
        let (_dir, _store, tm, tx) = setup(16).await;
        let params = echo(10);
        let token = tm.allocate(&params, "demo", None, None).await.unwrap();

        let wait = tokio::spawn(async move { tm.await_terminal(token, false).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let result = wait.await.unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.kind, verdict_protocol::ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_await_terminal_observes_completion() {
        let (_dir, store, tm, _tx) = setup(16).await;
        let params = echo(10);
        let token = tm.allocate(&params, "demo", None, None).await.unwrap();
        tm.push(token, &params).await.unwrap();

        // Conclude the task out-of-band before the first poll.
        store.tasks().claim_running(token, "srv-test").await.unwrap();
        store
            .tasks()
            .finish(token, TaskStatus::Completed)
            .await
            .unwrap();

        let status = tm.await_terminal(token, true).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);
        let info = store.tasks().get_info(token).await.unwrap().unwrap();
        assert!(info.consumed);
    }
}
