//! The uniform wait interface shared by every primitive.
//!
//! All host primitives block through a [`WaitCell`]: a mutex-protected state word paired with a
//! condition variable. A wait polls the state under the lock, sleeps until notified or until its
//! deadline passes, and classifies the result into a [`WaitOutcome`].
//!
//! Alertable waits register their cell with the calling thread's
//! [`ThreadControl`](crate::thread::ThreadControl), so that
//! [`Task::alert`](crate::thread::Task::alert) can wake them early.

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use bitflags::bitflags;

use crate::{sync::DeadlockReport, thread::ThreadControl};

bitflags! {
    /// Policy options for a blocking wait.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct WaitOptions: u32 {
        /// The wait may be interrupted by [`Task::alert`](crate::thread::Task::alert).
        const ALERTABLE = 0x1;
        /// The wait should service a message queue.
        ///
        /// The host has no message queue of its own, so this behaves as a plain wait.
        const MSGPUMP = 0x2;
        /// Skip deadlock detection for this wait.
        const NOT_IN_DEADLOCK = 0x4;
    }
}

/// How a blocking wait ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The primitive was acquired or signaled.
    Signaled,
    /// The object was abandoned by its owner (a closed port, a cancelled task start).
    Abandoned,
    /// An alertable wait was woken by an alert.
    Interrupted,
    /// The timeout elapsed first.
    TimedOut,
    /// The wait participates in a lock cycle that can never resolve.
    Deadlock(DeadlockReport),
}

impl WaitOutcome {
    /// Returns `true` if the wait acquired or observed the signal.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        matches!(self, WaitOutcome::Signaled)
    }

    /// Returns `true` if the wait ran out of time.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, WaitOutcome::TimedOut)
    }

    /// Returns the deadlock detail if the wait was refused because of a cycle.
    #[must_use]
    pub fn deadlock(&self) -> Option<&DeadlockReport> {
        match self {
            WaitOutcome::Deadlock(report) => Some(report),
            _ => None,
        }
    }
}

/// Something an alert can wake.
pub(crate) trait Interrupt: Send + Sync {
    /// Wakes every thread blocked on this object so it re-checks its alert flag.
    fn interrupt(&self);
}

/// Converts a relative timeout into an absolute deadline.
///
/// `None` and timeouts too large to represent both mean "wait forever".
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

/// Mutex-protected state plus the condition variable its waiters sleep on.
pub(crate) struct WaitCell<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T: Send + 'static> WaitCell<T> {
    pub(crate) fn new(state: T) -> Arc<Self> {
        Arc::new(WaitCell {
            state: Mutex::new(state),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        lock!(self.state)
    }

    pub(crate) fn notify_one(&self) {
        self.cond.notify_one();
    }

    pub(crate) fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Blocks until `poll` reports an outcome, the timeout elapses, or an alert arrives.
    ///
    /// `poll` runs with the state locked, once before the first sleep and again after every
    /// wakeup. It is also consulted one last time once the deadline has passed, so a signal
    /// racing with the timeout is never lost.
    pub(crate) fn wait_until<F>(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        options: WaitOptions,
        mut poll: F,
    ) -> WaitOutcome
    where
        F: FnMut(&mut T) -> Option<WaitOutcome>,
    {
        let deadline = deadline_after(timeout);
        let alertable = options
            .contains(WaitOptions::ALERTABLE)
            .then(ThreadControl::current);

        if let Some(control) = &alertable {
            if control.consume_alert() {
                return WaitOutcome::Interrupted;
            }
            control.enter_alertable_wait(Arc::clone(self) as Arc<dyn Interrupt>);
        }

        let outcome = {
            let mut guard = lock!(self.state);
            loop {
                if let Some(outcome) = poll(&mut guard) {
                    break outcome;
                }
                if let Some(control) = &alertable {
                    if control.consume_alert() {
                        break WaitOutcome::Interrupted;
                    }
                }
                match deadline {
                    None => guard = wait!(self.cond, guard),
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break WaitOutcome::TimedOut;
                        }
                        guard = wait_timeout!(self.cond, guard, deadline - now).0;
                    }
                }
            }
        };

        if let Some(control) = &alertable {
            control.leave_alertable_wait();
        }
        outcome
    }
}

impl<T: Send> Interrupt for WaitCell<T> {
    fn interrupt(&self) {
        let _guard = lock!(self.state);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_immediate_poll_success() {
        let cell = WaitCell::new(true);
        let outcome = cell.wait_until(Some(Duration::ZERO), WaitOptions::empty(), |ready| {
            ready.then_some(WaitOutcome::Signaled)
        });
        assert_eq!(outcome, WaitOutcome::Signaled);
    }

    #[test]
    fn test_timeout_never_early() {
        let cell = WaitCell::new(());
        let start = Instant::now();
        let outcome = cell.wait_until(
            Some(Duration::from_millis(50)),
            WaitOptions::empty(),
            |_| None,
        );
        assert!(outcome.is_timed_out());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let cell = WaitCell::new(false);
        let signaler = Arc::clone(&cell);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            *signaler.lock() = true;
            signaler.notify_all();
        });
        let outcome = cell.wait_until(None, WaitOptions::empty(), |ready| {
            ready.then_some(WaitOutcome::Signaled)
        });
        handle.join().unwrap();
        assert!(outcome.is_signaled());
    }

    #[test]
    fn test_options_bits() {
        let options = WaitOptions::ALERTABLE | WaitOptions::NOT_IN_DEADLOCK;
        assert!(options.contains(WaitOptions::ALERTABLE));
        assert!(!options.contains(WaitOptions::MSGPUMP));
        assert_eq!(WaitOptions::default(), WaitOptions::empty());
    }

    #[test]
    fn test_infinite_deadline() {
        assert!(deadline_after(None).is_none());
        assert!(deadline_after(Some(Duration::MAX)).is_none());
        assert!(deadline_after(Some(Duration::from_secs(1))).is_some());
    }
}
