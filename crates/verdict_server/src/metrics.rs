//! In-memory metrics for server observability.
//!
//! Lock-free atomic counters; single process-global instance read by
//! `serverInfo`.

use std::sync::atomic::{AtomicU64, Ordering};
use verdict_protocol::rpc::MetricsSnapshot;

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    pub tasks_enqueued: AtomicU64,
    pub tasks_dropped: AtomicU64,

    pub rpc_served: AtomicU64,
    pub rpc_errors: AtomicU64,
    pub db_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            tasks_enqueued: AtomicU64::new(0),
            tasks_dropped: AtomicU64::new(0),
            rpc_served: AtomicU64::new(0),
            rpc_errors: AtomicU64::new(0),
            db_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_tasks_enqueued(&self) {
        self.tasks_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tasks_dropped_by(&self, count: u64) {
        self.tasks_dropped.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rpc_served(&self) {
        self.rpc_served.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rpc_errors(&self) {
        self.rpc_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_db_errors(&self) {
        self.db_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_enqueued: self.tasks_enqueued.load(Ordering::Relaxed),
            tasks_dropped: self.tasks_dropped.load(Ordering::Relaxed),
            rpc_served: self.rpc_served.load(Ordering::Relaxed),
            rpc_errors: self.rpc_errors.load(Ordering::Relaxed),
            db_errors: self.db_errors.load(Ordering::Relaxed),
        }
    }
}
