//! Per-thread control block.
//!
//! A [`ThreadControl`] is the host's view of one OS thread: its id, the start gate used to
//! create threads suspended, the exit signal used by joins, the alert slot that interrupts
//! alertable waits, and the logical priority. The block for the calling thread lives in a
//! thread-local and is shared with the [`Task`](crate::thread::Task) that wraps it.

use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    sync::{Interrupt, WaitCell, WaitOptions, WaitOutcome},
    thread::{NativeThreadId, TaskPriority},
};

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadControl>>> = const { RefCell::new(None) };
}

/// Start gate state of a thread created suspended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StartState {
    Suspended,
    Running,
    Cancelled,
}

#[derive(Default)]
struct AlertSlot {
    pending: bool,
    waiter: Option<Arc<dyn Interrupt>>,
}

/// Host bookkeeping for one native thread.
pub struct ThreadControl {
    id: NativeThreadId,
    start: Arc<WaitCell<StartState>>,
    exited: Arc<WaitCell<bool>>,
    sleeper: Arc<WaitCell<()>>,
    alert: Mutex<AlertSlot>,
    priority: AtomicI32,
}

impl ThreadControl {
    fn with_state(id: NativeThreadId, start: StartState) -> Arc<Self> {
        Arc::new(ThreadControl {
            id,
            start: WaitCell::new(start),
            exited: WaitCell::new(false),
            sleeper: WaitCell::new(()),
            alert: Mutex::new(AlertSlot::default()),
            priority: AtomicI32::new(TaskPriority::Normal.value()),
        })
    }

    /// Returns the control block of the calling thread, creating it on first use.
    #[must_use]
    pub fn current() -> Arc<ThreadControl> {
        CURRENT
            .try_with(|slot| {
                Arc::clone(slot.borrow_mut().get_or_insert_with(|| {
                    ThreadControl::with_state(NativeThreadId::allocate(), StartState::Running)
                }))
            })
            // Thread-local storage is already torn down; hand out a detached block.
            .unwrap_or_else(|_| {
                ThreadControl::with_state(NativeThreadId::allocate(), StartState::Running)
            })
    }

    /// Creates the control block for a thread that will be spawned suspended.
    pub(crate) fn suspended() -> Arc<ThreadControl> {
        ThreadControl::with_state(NativeThreadId::allocate(), StartState::Suspended)
    }

    /// Makes `control` the calling thread's block. Used first thing by spawned threads.
    pub(crate) fn install(control: &Arc<ThreadControl>) {
        let _ = CURRENT.try_with(|slot| *slot.borrow_mut() = Some(Arc::clone(control)));
    }

    /// The thread's id.
    #[must_use]
    pub fn id(&self) -> NativeThreadId {
        self.id
    }

    /// Opens the start gate. Returns `false` if the thread was already started or cancelled.
    pub(crate) fn resume(&self) -> bool {
        self.transition_start(StartState::Running)
    }

    /// Cancels a thread that has not been started. Returns `false` if it already runs.
    pub(crate) fn cancel(&self) -> bool {
        self.transition_start(StartState::Cancelled)
    }

    fn transition_start(&self, to: StartState) -> bool {
        let mut state = self.start.lock();
        if *state != StartState::Suspended {
            return false;
        }
        *state = to;
        drop(state);
        self.start.notify_all();
        true
    }

    /// Returns `true` once [`ThreadControl::resume`] has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        *self.start.lock() == StartState::Running
    }

    /// Blocks a freshly spawned thread at its start gate. Returns `true` if it should run.
    pub(crate) fn wait_for_start(&self) -> bool {
        let outcome = self
            .start
            .wait_until(None, WaitOptions::empty(), |state| match state {
                StartState::Suspended => None,
                StartState::Running => Some(WaitOutcome::Signaled),
                StartState::Cancelled => Some(WaitOutcome::Abandoned),
            });
        outcome.is_signaled()
    }

    /// Signals every joiner that this thread has finished.
    pub(crate) fn mark_exited(&self) {
        *self.exited.lock() = true;
        self.exited.notify_all();
    }

    /// Returns `true` once the thread has run to completion.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        *self.exited.lock()
    }

    /// Waits for the thread to exit.
    pub(crate) fn join(&self, timeout: Option<Duration>, options: WaitOptions) -> WaitOutcome {
        self.exited.wait_until(timeout, options, |exited| {
            exited.then_some(WaitOutcome::Signaled)
        })
    }

    /// Sleeps the calling thread. Only an alert can end the sleep early.
    pub(crate) fn sleep(&self, duration: Duration, options: WaitOptions) -> WaitOutcome {
        match self.sleeper.wait_until(Some(duration), options, |_| None) {
            WaitOutcome::TimedOut => WaitOutcome::Signaled,
            other => other,
        }
    }

    /// Queues an alert and wakes the thread if it sits in an alertable wait.
    pub fn alert(&self) {
        let waiter = {
            let mut slot = lock!(self.alert);
            slot.pending = true;
            slot.waiter.clone()
        };
        if let Some(waiter) = waiter {
            waiter.interrupt();
        }
    }

    /// Takes a pending alert, if there is one.
    pub(crate) fn consume_alert(&self) -> bool {
        std::mem::take(&mut lock!(self.alert).pending)
    }

    pub(crate) fn enter_alertable_wait(&self, waiter: Arc<dyn Interrupt>) {
        lock!(self.alert).waiter = Some(waiter);
    }

    pub(crate) fn leave_alertable_wait(&self) {
        lock!(self.alert).waiter = None;
    }

    /// The thread's current logical priority.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Release);
    }
}

impl std::fmt::Debug for ThreadControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadControl")
            .field("id", &self.id)
            .field("started", &self.is_started())
            .field("exited", &self.has_exited())
            .field("priority", &self.priority())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Instant};

    #[test]
    fn test_current_is_shared() {
        let a = ThreadControl::current();
        let b = ThreadControl::current();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_start_gate() {
        let control = ThreadControl::suspended();
        assert!(!control.is_started());
        let spawned = Arc::clone(&control);
        let handle = thread::spawn(move || {
            ThreadControl::install(&spawned);
            assert_eq!(NativeThreadId::current(), spawned.id());
            spawned.wait_for_start()
        });
        assert!(control.resume());
        assert!(!control.resume());
        assert!(handle.join().unwrap());
        assert!(control.is_started());
    }

    #[test]
    fn test_cancel_before_start() {
        let control = ThreadControl::suspended();
        assert!(control.cancel());
        assert!(!control.resume());
        assert!(!control.wait_for_start());
    }

    #[test]
    fn test_pending_alert_interrupts_next_alertable_wait() {
        let control = ThreadControl::current();
        control.alert();
        let outcome = control.sleep(Duration::from_secs(5), WaitOptions::ALERTABLE);
        assert_eq!(outcome, WaitOutcome::Interrupted);
        assert!(!control.consume_alert());
    }

    #[test]
    fn test_alert_wakes_sleeping_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let control = ThreadControl::current();
            tx.send(Arc::clone(&control)).unwrap();
            let start = Instant::now();
            let outcome = control.sleep(Duration::from_secs(30), WaitOptions::ALERTABLE);
            (outcome, start.elapsed())
        });
        let control = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        control.alert();
        let (outcome, elapsed) = handle.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Interrupted);
        assert!(elapsed < Duration::from_secs(30));
    }

    #[test]
    fn test_non_alertable_sleep_keeps_alert_pending() {
        let control = ThreadControl::current();
        control.alert();
        let outcome = control.sleep(Duration::from_millis(10), WaitOptions::empty());
        assert!(outcome.is_signaled());
        assert!(control.consume_alert());
    }

    #[test]
    fn test_join_after_exit() {
        let control = ThreadControl::suspended();
        assert!(control
            .join(Some(Duration::from_millis(10)), WaitOptions::empty())
            .is_timed_out());
        control.mark_exited();
        assert!(control.has_exited());
        assert!(control.join(None, WaitOptions::empty()).is_signaled());
    }
}
