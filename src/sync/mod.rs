//! Host synchronization primitives and deadlock detection.
//!
//! This module replaces the runtime's own locks with host-managed ones, so the host can see
//! every blocking wait. Every primitive blocks through the same wait core and reports a
//! [`WaitOutcome`].
//!
//! # Key Components
//!
//! - [`Crst`] - Reentrant critical section with optional spinning
//! - [`ManualEvent`] / [`AutoEvent`] - Manual and auto-reset events
//! - [`MonitorEvent`] - Auto-reset event backing a managed `lock`, identified by a [`Cookie`]
//! - [`Semaphore`] - Counting semaphore
//! - [`DeadlockDetector`] - Wait-graph cycle detection for monitor waits
//! - [`LockTraceCollector`] - Optional lock-order tracing
//! - [`SyncManager`] - Factory the embedding runtime creates primitives through
//!
//! # Deadlock Detection
//!
//! A monitor wait first blocks for a short slice. Only if that slice expires does the waiting
//! thread record "I wait on this cookie" and walk the wait graph, asking the injected
//! [`LockOwnerOracle`] who holds each lock along the way. A walk that returns to a thread
//! already on the path is a cycle, and the wait ends with [`WaitOutcome::Deadlock`] instead of
//! blocking forever. Otherwise the slice doubles and the wait resumes.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use hostrt::{HostConfig, HostControl};
//! use hostrt::sync::WaitOptions;
//!
//! let host = HostControl::new(HostConfig::default())?;
//! let sync = host.sync();
//!
//! let crst = sync.create_crst();
//! crst.enter();
//! assert!(crst.try_enter());
//! crst.leave()?;
//! crst.leave()?;
//!
//! let event = sync.create_manual_event(false);
//! event.set();
//! assert!(event.wait(Some(Duration::ZERO), WaitOptions::empty()).is_signaled());
//! # Ok::<(), hostrt::Error>(())
//! ```

mod crst;
mod deadlock;
mod event;
mod manager;
mod semaphore;
mod trace;
mod wait;

pub use crst::{Crst, CrstGuard};
pub use deadlock::{DeadlockDetector, DeadlockReport, LockOwnerOracle, WaitEdge};
pub use event::{AutoEvent, ManualEvent, MonitorEvent};
pub use manager::SyncManager;
pub use semaphore::Semaphore;
pub use trace::{LockTraceCollector, LockTraceEvent};
pub use wait::{WaitOptions, WaitOutcome};

pub(crate) use wait::{Interrupt, WaitCell};

/// Identity of a managed lock, chosen by the embedding runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cookie(pub usize);

impl serde::Serialize for Cookie {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl std::fmt::Display for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Errors from misusing a synchronization primitive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncError {
    /// Thread attempted to release a lock it does not own.
    NotOwner,

    /// Operation requires a lock that is not currently held.
    NotLocked,

    /// Semaphore release would cause the count to exceed the maximum.
    SemaphoreOverflow,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::NotOwner => write!(f, "thread does not own the lock"),
            SyncError::NotLocked => write!(f, "lock is not held"),
            SyncError::SemaphoreOverflow => write!(f, "semaphore count would overflow"),
        }
    }
}

impl std::error::Error for SyncError {}
