//! Native thread identity.
//!
//! Every OS thread that touches the host gets a [`NativeThreadId`] the first time it asks for
//! one. Threads spawned through [`crate::thread::TaskManager::create_task`] receive their id
//! before they run, so the registry entry and the domain binding can be installed while the
//! thread is still suspended.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a native thread known to the host.
///
/// Identifiers are never reused within a process, so a stale id can only ever miss in a
/// registry lookup; it cannot alias a newer thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct NativeThreadId(pub u64);

impl NativeThreadId {
    /// Creates a thread id with the given value.
    ///
    /// # Arguments
    ///
    /// * `id` - The numeric thread identifier
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw numeric ID value.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the id of the calling thread, assigning one on first use.
    #[must_use]
    pub fn current() -> Self {
        crate::thread::ThreadControl::current().id()
    }

    /// Hands out a fresh id for a thread that does not exist yet.
    pub(crate) fn allocate() -> Self {
        Self(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for NativeThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_is_stable() {
        let a = NativeThreadId::current();
        let b = NativeThreadId::current();
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_threads_distinct_ids() {
        let here = NativeThreadId::current();
        let there = std::thread::spawn(NativeThreadId::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_allocate_is_unique() {
        let a = NativeThreadId::allocate();
        let b = NativeThreadId::allocate();
        assert_ne!(a, b);
        assert_eq!(NativeThreadId::new(a.value()), a);
    }

    #[test]
    fn test_display() {
        assert_eq!(NativeThreadId::new(12).to_string(), "Thread(12)");
    }
}
