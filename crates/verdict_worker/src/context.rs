//! Execution context handed to a task implementation.

use std::path::PathBuf;
use thiserror::Error;
use verdict_protocol::defaults;
use verdict_protocol::TaskToken;
use verdict_store::ConfigStore;

use crate::cancel::DrainToken;

/// How a task implementation concludes.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The well-known cancellation sentinel. Raised by the task body in
    /// response to `should_cancel`; mapped to `CANCELLED` or `DROPPED`
    /// depending on whether an administrator asked for it.
    #[error("task cancelled")]
    Cancelled,

    /// Anything else escaping the implementation.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

pub type TaskResult = std::result::Result<(), TaskError>;

/// Capabilities a running task may use: liveness, cancellation checks,
/// comments, its scratch directory, and the configuration store for
/// resolving product connections.
pub struct TaskContext {
    store: ConfigStore,
    server_id: String,
    token: TaskToken,
    product: Option<String>,
    data_dir: Option<PathBuf>,
    drain: DrainToken,
}

impl TaskContext {
    pub fn new(
        store: ConfigStore,
        server_id: String,
        token: TaskToken,
        product: Option<String>,
        data_dir: Option<PathBuf>,
        drain: DrainToken,
    ) -> Self {
        Self {
            store,
            server_id,
            token,
            product,
            data_dir,
            drain,
        }
    }

    pub fn token(&self) -> TaskToken {
        self.token
    }

    /// Product endpoint this task was submitted against, if any.
    pub fn product(&self) -> Option<&str> {
        self.product.as_deref()
    }

    /// Scratch directory populated by the submitting client, if one was
    /// created.
    pub fn data_dir(&self) -> Option<&PathBuf> {
        self.data_dir.as_ref()
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.store
    }

    /// Record liveness. Accepted only while the record is RUNNING under
    /// this server; otherwise a no-op.
    pub async fn heartbeat(&self) -> anyhow::Result<()> {
        self.store
            .tasks()
            .heartbeat(self.token, &self.server_id)
            .await?;
        Ok(())
    }

    /// True when an administrator requested cancellation or the server
    /// is draining for shutdown. The task is expected to raise
    /// [`TaskError::Cancelled`] within a bounded time.
    pub async fn should_cancel(&self) -> anyhow::Result<bool> {
        if self.drain.is_draining() {
            return Ok(true);
        }
        Ok(self.store.tasks().cancel_requested(self.token).await?)
    }

    /// Append a comment attributed to the task's actor-visible system
    /// identity.
    pub async fn add_comment(&self, body: &str) -> anyhow::Result<()> {
        self.store
            .tasks()
            .add_comment(self.token, defaults::SYSTEM_ACTOR, body)
            .await?;
        Ok(())
    }
}
