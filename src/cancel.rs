//! Shared cancellation flags.
//!
//! Two sticky-ish booleans cooperate: `reset` short-circuits in-flight
//! topology waits and multi-step expansions and is cleared when the device
//! settles back in `Idle`; `shutdown` is terminal. Long-running loops poll
//! [`CancelFlag::is_cancelled`] at every iteration.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// Cloneable cancellation state shared between the agent's tasks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    reset: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
    }

    pub fn clear_reset(&self) {
        self.reset.store(false, Ordering::SeqCst);
    }

    pub fn reset_requested(&self) -> bool {
        self.reset.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Whether waits should abort now.
    pub fn is_cancelled(&self) -> bool {
        self.reset_requested() || self.shutdown_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_is_clearable_shutdown_is_not() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        flag.request_reset();
        assert!(flag.is_cancelled());
        flag.clear_reset();
        assert!(!flag.is_cancelled());
        flag.request_shutdown();
        assert!(flag.is_cancelled());
        // clones observe the same state
        let clone = flag.clone();
        assert!(clone.shutdown_requested());
    }
}
