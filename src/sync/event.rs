//! Host events: manual-reset, auto-reset and monitor events.
//!
//! Every event is a condition-variable wait cell over a `bool`. Setting the event flips the flag
//! and wakes waiters; what differs is who clears it again.
//!
//! # Key Components
//!
//! - [`crate::sync::ManualEvent`] - Stays signaled until [`crate::sync::ManualEvent::reset`];
//!   releases every waiter
//! - [`crate::sync::AutoEvent`] - Each signal releases exactly one waiter and is consumed by it
//! - [`crate::sync::MonitorEvent`] - An [`crate::sync::AutoEvent`] tied to a lock
//!   [`crate::sync::Cookie`], whose waits go through the [`crate::sync::DeadlockDetector`]
//!
//! # Monitor Waits
//!
//! A monitor wait only runs deadlock detection when a [`crate::sync::LockOwnerOracle`] is
//! installed and the caller did not pass [`crate::sync::WaitOptions::NOT_IN_DEADLOCK`]. A
//! successful wait and every [`crate::sync::MonitorEvent::set`] are reported to the lock
//! trace as acquire and release events.
//!
//! # Usage Examples
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use hostrt::sync::{Cookie, WaitOptions, WaitOutcome};
//!
//! let monitor = host.sync().create_monitor_event(Cookie(0x1000));
//! monitor.set();
//! let outcome = monitor.wait(Some(Duration::from_secs(1)), WaitOptions::empty());
//! assert_eq!(outcome, WaitOutcome::Signaled);
//! ```
//!
//! # Thread Safety
//!
//! All event types are `Send + Sync` and are normally shared behind an `Arc`.

use std::{sync::Arc, time::Duration};

use crate::{
    sync::{Cookie, DeadlockDetector, WaitCell, WaitOptions, WaitOutcome},
    thread::NativeThreadId,
};

/// An event that stays signaled until explicitly reset.
pub struct ManualEvent {
    cell: Arc<WaitCell<bool>>,
}

impl ManualEvent {
    /// Creates an event in the given state.
    #[must_use]
    pub fn new(initial: bool) -> Self {
        Self {
            cell: WaitCell::new(initial),
        }
    }

    /// Signals the event, releasing every waiter.
    pub fn set(&self) {
        *self.cell.lock() = true;
        self.cell.notify_all();
    }

    /// Returns the event to the non-signaled state.
    pub fn reset(&self) {
        *self.cell.lock() = false;
    }

    /// Returns `true` while the event is signaled.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.cell.lock()
    }

    /// Waits for the event to become signaled.
    pub fn wait(&self, timeout: Option<Duration>, options: WaitOptions) -> WaitOutcome {
        self.cell
            .wait_until(timeout, options, |set| set.then_some(WaitOutcome::Signaled))
    }
}

impl std::fmt::Debug for ManualEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualEvent")
            .field("set", &self.is_set())
            .finish()
    }
}

/// An event that releases a single waiter per signal, then resets itself.
pub struct AutoEvent {
    cell: Arc<WaitCell<bool>>,
}

impl AutoEvent {
    /// Creates an event in the given state.
    #[must_use]
    pub fn new(initial: bool) -> Self {
        Self {
            cell: WaitCell::new(initial),
        }
    }

    /// Signals the event. If threads are waiting, exactly one of them consumes the signal.
    pub fn set(&self) {
        *self.cell.lock() = true;
        self.cell.notify_one();
    }

    /// Clears a pending signal.
    pub fn reset(&self) {
        *self.cell.lock() = false;
    }

    /// Returns `true` while a signal is pending.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.cell.lock()
    }

    /// Waits for a signal and consumes it.
    pub fn wait(&self, timeout: Option<Duration>, options: WaitOptions) -> WaitOutcome {
        let outcome = self.cell.wait_until(timeout, options, |set| {
            std::mem::take(set).then_some(WaitOutcome::Signaled)
        });
        if !outcome.is_signaled() && self.is_set() {
            // A waiter that leaves without consuming may have swallowed the notify.
            self.cell.notify_one();
        }
        outcome
    }
}

impl std::fmt::Debug for AutoEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoEvent")
            .field("set", &self.is_set())
            .finish()
    }
}

/// The auto-reset event a managed monitor blocks on.
///
/// Waits go through the [`DeadlockDetector`] unless [`WaitOptions::NOT_IN_DEADLOCK`] is passed
/// or no lock owner oracle has been installed yet.
pub struct MonitorEvent {
    event: AutoEvent,
    cookie: Cookie,
    detector: Arc<DeadlockDetector>,
}

impl MonitorEvent {
    /// Creates a non-signaled monitor event for the lock `cookie`.
    #[must_use]
    pub fn new(cookie: Cookie, detector: Arc<DeadlockDetector>) -> Self {
        Self {
            event: AutoEvent::new(false),
            cookie,
            detector,
        }
    }

    /// The lock this event belongs to.
    #[must_use]
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    /// Signals the event. Called by the lock owner as it releases the monitor.
    pub fn set(&self) {
        self.event.set();
        self.detector
            .trace()
            .on_released(NativeThreadId::current(), self.cookie);
    }

    /// Clears a pending signal.
    pub fn reset(&self) {
        self.event.reset();
    }

    /// Waits for the monitor to be handed over.
    ///
    /// Returns [`WaitOutcome::Deadlock`] if the wait closes a cycle in the wait graph.
    pub fn wait(&self, timeout: Option<Duration>, options: WaitOptions) -> WaitOutcome {
        let outcome =
            if options.contains(WaitOptions::NOT_IN_DEADLOCK) || !self.detector.has_oracle() {
                self.event.wait(timeout, options)
            } else {
                self.detector
                    .wait(&self.event, self.cookie, timeout, options)
            };

        if outcome.is_signaled() {
            self.detector
                .trace()
                .on_acquired(NativeThreadId::current(), self.cookie);
        }
        outcome
    }
}

impl std::fmt::Debug for MonitorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorEvent")
            .field("cookie", &self.cookie)
            .field("set", &self.event.is_set())
            .finish()
    }
}
