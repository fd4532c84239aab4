//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;
use verdict_protocol::defaults;

/// Canonical server configuration assembled by the launcher.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// ROUTER bind address for the RPC surface.
    pub bind_addr: String,
    /// Stable name of this server process; stamped as the owning server
    /// id on every task it enqueues.
    pub server_id: String,
    /// Configuration store path (SQLite).
    pub config_store_path: PathBuf,
    /// Root for per-task data directories.
    pub scratch_root: PathBuf,
    /// Number of worker processes. 0 means the CPU count.
    pub worker_count: usize,
    /// Path to the worker binary; defaults to `verdict-worker` next to
    /// the server executable.
    pub worker_binary: Option<PathBuf>,
    /// Disable authentication: every caller gets a synthetic superuser
    /// identity.
    pub auth_disabled: bool,
    /// Spawn worker processes at boot. Disabled only by tests that
    /// drive the worker loop in-process.
    pub spawn_workers: bool,

    /// Queue capacity before `push` exerts backpressure.
    pub queue_capacity: i64,
    /// Heartbeat staleness bound for own-server RUNNING records.
    pub stale_secs: i64,
    /// Staleness bound for records owned by other servers.
    pub orphan_secs: i64,
    /// Age bound for never-pushed ALLOCATED records.
    pub allocated_timeout_secs: i64,
    /// Grace window between terminal transition and data-dir removal.
    pub data_dir_grace_secs: i64,
    /// Reaper sweep interval.
    pub reaper_interval: Duration,
    /// How long workers get to finish on shutdown before SIGKILL.
    pub graceful_shutdown: Duration,
    /// Optional wall-clock bound on task runtime; overdue tasks get
    /// `cancel_requested` set by the reaper.
    pub max_task_runtime_secs: Option<i64>,
}

impl ServerConfig {
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count > 0 {
            return self.worker_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: defaults::DEFAULT_RPC_BIND_ADDR.to_string(),
            server_id: "verdict-1".to_string(),
            config_store_path: verdict_protocol::paths::default_config_store_path(),
            scratch_root: verdict_protocol::paths::default_scratch_root(),
            worker_count: 0,
            worker_binary: None,
            auth_disabled: false,
            spawn_workers: true,
            queue_capacity: defaults::DEFAULT_QUEUE_CAPACITY,
            stale_secs: defaults::DEFAULT_STALE_SECS,
            orphan_secs: defaults::DEFAULT_ORPHAN_SECS,
            allocated_timeout_secs: defaults::DEFAULT_ALLOCATED_TIMEOUT_SECS,
            data_dir_grace_secs: defaults::DEFAULT_DATA_DIR_GRACE_SECS,
            reaper_interval: Duration::from_secs(defaults::DEFAULT_REAPER_INTERVAL_SECS),
            graceful_shutdown: Duration::from_secs(defaults::DEFAULT_GRACEFUL_SHUTDOWN_SECS),
            max_task_runtime_secs: None,
        }
    }
}
