//! The synchronization manager.
//!
//! [`crate::sync::SyncManager`] creates every synchronization primitive the runtime asks for
//! and owns the shared [`crate::sync::DeadlockDetector`] and
//! [`crate::sync::LockTraceCollector`] that monitor events report to.

use std::sync::Arc;

use crate::{
    host::{DeadlockConfig, LockTraceConfig},
    sync::{
        AutoEvent, Cookie, Crst, DeadlockDetector, LockOwnerOracle, LockTraceCollector,
        ManualEvent, MonitorEvent, Semaphore,
    },
    Result,
};

/// Factory for host synchronization primitives.
///
/// All monitor events created here share one [`DeadlockDetector`], which stays inactive until
/// the embedding runtime installs its [`LockOwnerOracle`].
#[derive(Debug)]
pub struct SyncManager {
    detector: Arc<DeadlockDetector>,
}

impl SyncManager {
    /// Creates the manager and its detector.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if the lock trace file cannot be opened.
    pub fn new(deadlock: DeadlockConfig, trace: &LockTraceConfig) -> Result<Self> {
        let trace = Arc::new(LockTraceCollector::new(trace)?);
        Ok(Self {
            detector: Arc::new(DeadlockDetector::new(deadlock, trace)),
        })
    }

    /// Installs the runtime's lock owner oracle, enabling deadlock detection.
    pub fn set_lock_owner_oracle(&self, oracle: Arc<dyn LockOwnerOracle>) {
        log::info!("lock owner oracle installed, deadlock detection active");
        self.detector.set_oracle(oracle);
    }

    /// The shared deadlock detector.
    #[must_use]
    pub fn detector(&self) -> &Arc<DeadlockDetector> {
        &self.detector
    }

    /// The lock-order trace collector.
    #[must_use]
    pub fn lock_trace(&self) -> &Arc<LockTraceCollector> {
        self.detector.trace()
    }

    /// Creates a critical section that never spins.
    #[must_use]
    pub fn create_crst(&self) -> Crst {
        Crst::new()
    }

    /// Creates a critical section that spins `spin_count` times before blocking.
    #[must_use]
    pub fn create_crst_with_spin_count(&self, spin_count: u32) -> Crst {
        Crst::with_spin_count(spin_count)
    }

    /// Creates a non-signaled auto-reset event.
    #[must_use]
    pub fn create_auto_event(&self) -> AutoEvent {
        AutoEvent::new(false)
    }

    /// Creates a manual-reset event.
    #[must_use]
    pub fn create_manual_event(&self, initial: bool) -> ManualEvent {
        ManualEvent::new(initial)
    }

    /// Creates the event a managed monitor with identity `cookie` blocks on.
    #[must_use]
    pub fn create_monitor_event(&self, cookie: Cookie) -> MonitorEvent {
        MonitorEvent::new(cookie, Arc::clone(&self.detector))
    }

    /// Creates the event writers of a reader-writer lock block on.
    #[must_use]
    pub fn create_rw_writer_event(&self, cookie: Cookie) -> AutoEvent {
        log::trace!("writer event for lock {}", cookie);
        AutoEvent::new(false)
    }

    /// Creates the event readers of a reader-writer lock block on.
    ///
    /// Readers are released together, so this is a manual-reset event.
    #[must_use]
    pub fn create_rw_reader_event(&self, initial: bool, cookie: Cookie) -> ManualEvent {
        log::trace!("reader event for lock {}", cookie);
        ManualEvent::new(initial)
    }

    /// Creates a semaphore holding `initial` of `max` slots.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidArgument`] if `max` is zero or below `initial`.
    pub fn create_semaphore(&self, initial: u32, max: u32) -> Result<Semaphore> {
        Semaphore::new(initial, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sync::{WaitOptions, WaitOutcome},
        thread::NativeThreadId,
    };
    use std::{collections::HashMap, sync::Mutex, thread, time::Duration};

    struct FixedOracle(Mutex<HashMap<Cookie, NativeThreadId>>);

    impl LockOwnerOracle for FixedOracle {
        fn monitor_owner(&self, cookie: Cookie) -> Option<NativeThreadId> {
            self.0.lock().unwrap().get(&cookie).copied()
        }
    }

    fn manager() -> SyncManager {
        SyncManager::new(
            DeadlockConfig::default().with_initial_slice(Duration::from_millis(10)),
            &LockTraceConfig::memory(),
        )
        .unwrap()
    }

    #[test]
    fn test_monitor_wait_without_oracle() {
        let sync = manager();
        let monitor = sync.create_monitor_event(Cookie(1));
        assert!(monitor
            .wait(Some(Duration::from_millis(30)), WaitOptions::empty())
            .is_timed_out());
        assert_eq!(sync.detector().pending_waits(), 0);
    }

    #[test]
    fn test_monitor_handoff_traced() {
        let sync = manager();
        let monitor = Arc::new(sync.create_monitor_event(Cookie(0x44)));
        let waiter = Arc::clone(&monitor);
        let handle = thread::spawn(move || {
            let outcome = waiter.wait(Some(Duration::from_secs(10)), WaitOptions::empty());
            (outcome, NativeThreadId::current())
        });
        thread::sleep(Duration::from_millis(20));
        monitor.set();
        let (outcome, waiter_id) = handle.join().unwrap();
        assert!(outcome.is_signaled());
        assert_eq!(sync.lock_trace().held_locks(waiter_id), vec![Cookie(0x44)]);
    }

    #[test]
    fn test_monitor_detects_self_deadlock() {
        let sync = manager();
        let me = NativeThreadId::current();
        sync.set_lock_owner_oracle(Arc::new(FixedOracle(Mutex::new(HashMap::from([(
            Cookie(9),
            me,
        )])))));
        let monitor = sync.create_monitor_event(Cookie(9));

        let outcome = monitor.wait(None, WaitOptions::empty());
        assert!(matches!(outcome, WaitOutcome::Deadlock(_)));

        let bypass = monitor.wait(
            Some(Duration::from_millis(30)),
            WaitOptions::NOT_IN_DEADLOCK,
        );
        assert!(bypass.is_timed_out());
    }

    #[test]
    fn test_factories() {
        let sync = manager();
        assert_eq!(sync.create_crst_with_spin_count(10).spin_count(), 10);
        assert!(sync.create_manual_event(true).is_set());
        assert!(!sync.create_auto_event().is_set());
        assert!(!sync.create_rw_writer_event(Cookie(1)).is_set());
        assert!(sync.create_rw_reader_event(true, Cookie(1)).is_set());
        assert!(sync.create_semaphore(3, 2).is_err());
        assert_eq!(sync.create_semaphore(1, 2).unwrap().count(), 1);
    }
}
