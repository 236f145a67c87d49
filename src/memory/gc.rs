//! Collector suspension notifications.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::thread::NativeThreadId;

/// Receives the runtime's garbage collector suspension notifications.
///
/// The host takes no action beyond recording them.
#[derive(Debug, Default)]
pub struct GcManager {
    blocking: AtomicU64,
    suspensions: AtomicU64,
    suspended: AtomicBool,
    last_generation: AtomicU32,
}

impl GcManager {
    /// Creates a manager with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A thread is about to block until a suspension completes.
    pub fn thread_is_blocking_for_suspension(&self) {
        self.blocking.fetch_add(1, Ordering::Relaxed);
        log::trace!("{} blocking for suspension", NativeThreadId::current());
    }

    /// The runtime is suspending managed threads.
    pub fn suspension_starting(&self) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
        self.suspended.store(true, Ordering::Release);
        log::debug!("runtime suspension starting");
    }

    /// The runtime resumed managed threads after collecting `generation`.
    pub fn suspension_ending(&self, generation: u32) {
        self.suspended.store(false, Ordering::Release);
        self.last_generation.store(generation, Ordering::Relaxed);
        log::debug!("runtime suspension ending (generation {})", generation);
    }

    /// Number of suspensions started so far.
    pub fn suspension_count(&self) -> u64 {
        self.suspensions.load(Ordering::Relaxed)
    }

    /// Number of blocking notifications received.
    pub fn blocking_count(&self) -> u64 {
        self.blocking.load(Ordering::Relaxed)
    }

    /// True between `suspension_starting` and `suspension_ending`.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Generation reported by the last `suspension_ending`.
    pub fn last_generation(&self) -> u32 {
        self.last_generation.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspension_cycle() {
        let gc = GcManager::new();
        assert!(!gc.is_suspended());

        gc.suspension_starting();
        gc.thread_is_blocking_for_suspension();
        gc.thread_is_blocking_for_suspension();
        assert!(gc.is_suspended());

        gc.suspension_ending(2);
        assert!(!gc.is_suspended());
        assert_eq!(gc.suspension_count(), 1);
        assert_eq!(gc.blocking_count(), 2);
        assert_eq!(gc.last_generation(), 2);
    }
}
