//! Canonical default values shared by the server, workers, and clients.

/// RPC bind address for the server's ROUTER socket.
pub const DEFAULT_RPC_BIND_ADDR: &str = "tcp://127.0.0.1:8591";

/// A `RUNNING` record without a heartbeat for this long is demoted to
/// `DROPPED` by the reaper (own-server records).
pub const DEFAULT_STALE_SECS: i64 = 120;

/// Records owned by *other* server ids are only demoted after this long,
/// to accommodate clustered deployments.
pub const DEFAULT_ORPHAN_SECS: i64 = 1800;

/// `ALLOCATED` records whose owner never pushed are demoted after this long.
pub const DEFAULT_ALLOCATED_TIMEOUT_SECS: i64 = 1800;

/// Grace period between a terminal transition and data-directory removal.
pub const DEFAULT_DATA_DIR_GRACE_SECS: i64 = 3600;

/// Reaper sweep interval.
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 30;

/// How long workers get to finish their current task on shutdown.
pub const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;

/// Long-poll cadence for `awaitTaskTermination`.
pub const AWAIT_POLL_INTERVAL_MS: u64 = 2000;
/// Jitter cap added to the long-poll cadence.
pub const AWAIT_POLL_JITTER_MS: u64 = 500;

/// Bound on live queue rows before `push` starts blocking.
pub const DEFAULT_QUEUE_CAPACITY: i64 = 256;
/// How long `push` may block on a full queue before failing.
pub const PUSH_DEADLINE_MS: u64 = 5000;
/// Poll interval while `push` waits for queue capacity.
pub const PUSH_RETRY_INTERVAL_MS: u64 = 100;

/// Worker poll interval on an empty queue.
pub const WORKER_POLL_INTERVAL_MS: u64 = 200;

/// Bounded retries for the terminal status write before the worker
/// process gives up and exits.
pub const TERMINAL_WRITE_RETRIES: u32 = 5;
/// Base backoff in milliseconds for terminal write retries (doubles per
/// attempt).
pub const TERMINAL_WRITE_BACKOFF_MS: u64 = 250;

/// Session idle timeout.
pub const DEFAULT_SESSION_IDLE_SECS: i64 = 3600;
/// Session absolute timeout.
pub const DEFAULT_SESSION_MAX_SECS: i64 = 24 * 3600;

/// Actor name recorded on system-generated comments.
pub const SYSTEM_ACTOR: &str = "system";

/// Names that can never be used as product endpoints because they route
/// to server-wide services.
pub const RESERVED_ENDPOINTS: &[&str] =
    &["products", "tasks", "auth", "server", "cleanup_plans", "components"];
