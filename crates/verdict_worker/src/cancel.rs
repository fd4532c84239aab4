use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-local drain flag, flipped when the server asks this worker
/// to wind down (SIGTERM).
///
/// Tasks observe it through `TaskContext::should_cancel` and are never
/// preempted; the claim loop also consults it between payloads. Clones
/// share the flag.
#[derive(Debug, Clone, Default)]
pub struct DrainToken(Arc<AtomicBool>);

impl DrainToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_drain(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
