//! Reentrant critical sections.
//!
//! [`crate::sync::Crst`] is the host's internal lock: owner-tracked, recursive, and spinning
//! briefly before it blocks. [`crate::sync::Crst::lock`] returns a
//! [`crate::sync::CrstGuard`] that leaves on drop. Leaving from a thread that does not own the
//! section is an error, not a panic.

use std::{
    hint,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::{
    sync::{SyncError, WaitCell, WaitOptions, WaitOutcome},
    thread::NativeThreadId,
    Result,
};

/// Ownership of a reentrant lock.
#[derive(Clone, Copy, Debug, Default)]
struct OwnerState {
    owner: Option<NativeThreadId>,
    recursion_count: u32,
}

impl OwnerState {
    fn try_enter(&mut self, thread_id: NativeThreadId) -> bool {
        match self.owner {
            None => {
                self.owner = Some(thread_id);
                self.recursion_count = 1;
                true
            }
            Some(owner) if owner == thread_id => {
                self.recursion_count += 1;
                true
            }
            _ => false,
        }
    }

    /// Returns `Ok(true)` when the last recursion level was released.
    fn exit(&mut self, thread_id: NativeThreadId) -> std::result::Result<bool, SyncError> {
        match self.owner {
            Some(owner) if owner == thread_id => {
                self.recursion_count -= 1;
                if self.recursion_count == 0 {
                    self.owner = None;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Some(_) => Err(SyncError::NotOwner),
            None => Err(SyncError::NotLocked),
        }
    }
}

/// A reentrant critical section.
///
/// [`Crst::enter`] first spins up to the configured spin count, retrying the lock without
/// sleeping, and only then blocks.
pub struct Crst {
    cell: Arc<WaitCell<OwnerState>>,
    spin_count: AtomicU32,
}

impl Crst {
    /// Creates an unowned critical section that never spins.
    #[must_use]
    pub fn new() -> Self {
        Self::with_spin_count(0)
    }

    /// Creates an unowned critical section that spins `spin_count` times before blocking.
    #[must_use]
    pub fn with_spin_count(spin_count: u32) -> Self {
        Self {
            cell: WaitCell::new(OwnerState::default()),
            spin_count: AtomicU32::new(spin_count),
        }
    }

    /// Acquires the lock, blocking as long as another thread holds it.
    pub fn enter(&self) {
        let me = NativeThreadId::current();
        for _ in 0..self.spin_count.load(Ordering::Relaxed) {
            if self.cell.lock().try_enter(me) {
                return;
            }
            hint::spin_loop();
        }
        self.cell.wait_until(None, WaitOptions::empty(), |state| {
            state.try_enter(me).then_some(WaitOutcome::Signaled)
        });
    }

    /// Acquires the lock and returns a guard that leaves it on drop.
    pub fn lock(&self) -> CrstGuard<'_> {
        self.enter();
        CrstGuard { crst: self }
    }

    /// Acquires the lock if that is possible without blocking.
    pub fn try_enter(&self) -> bool {
        self.cell.lock().try_enter(NativeThreadId::current())
    }

    /// Releases one level of ownership.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotOwner`] or [`SyncError::NotLocked`] when the calling thread does
    /// not hold the lock.
    pub fn leave(&self) -> Result<()> {
        let released = self.cell.lock().exit(NativeThreadId::current())?;
        if released {
            self.cell.notify_one();
        }
        Ok(())
    }

    /// Changes the spin count and returns the previous one.
    pub fn set_spin_count(&self, spin_count: u32) -> u32 {
        self.spin_count.swap(spin_count, Ordering::Relaxed)
    }

    /// The current spin count.
    #[must_use]
    pub fn spin_count(&self) -> u32 {
        self.spin_count.load(Ordering::Relaxed)
    }

    /// The thread holding the lock.
    #[must_use]
    pub fn owner(&self) -> Option<NativeThreadId> {
        self.cell.lock().owner
    }

    /// Returns `true` if any thread holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }
}

impl Default for Crst {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Crst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = *self.cell.lock();
        f.debug_struct("Crst")
            .field("owner", &state.owner)
            .field("recursion_count", &state.recursion_count)
            .field("spin_count", &self.spin_count())
            .finish()
    }
}

/// Leaves a [`Crst`] when dropped.
pub struct CrstGuard<'a> {
    crst: &'a Crst,
}

impl Drop for CrstGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.crst.leave() {
            log::error!("critical section guard could not leave: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::{sync::atomic::AtomicUsize, thread, time::Duration};

    #[test]
    fn test_reentrant() {
        let crst = Crst::new();
        crst.enter();
        crst.enter();
        assert!(crst.try_enter());
        assert_eq!(crst.owner(), Some(NativeThreadId::current()));
        crst.leave().unwrap();
        crst.leave().unwrap();
        assert!(crst.is_locked());
        crst.leave().unwrap();
        assert!(!crst.is_locked());
    }

    #[test]
    fn test_leave_errors() {
        let crst = Arc::new(Crst::new());
        assert!(matches!(
            crst.leave(),
            Err(Error::Sync(SyncError::NotLocked))
        ));

        crst.enter();
        let other = Arc::clone(&crst);
        let result = thread::spawn(move || other.leave()).join().unwrap();
        assert!(matches!(result, Err(Error::Sync(SyncError::NotOwner))));
        crst.leave().unwrap();
    }

    #[test]
    fn test_try_enter_contended() {
        let crst = Arc::new(Crst::new());
        crst.enter();
        let other = Arc::clone(&crst);
        assert!(!thread::spawn(move || other.try_enter()).join().unwrap());
        crst.leave().unwrap();
    }

    #[test]
    fn test_mutual_exclusion() {
        let crst = Arc::new(Crst::with_spin_count(100));
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let crst = Arc::clone(&crst);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = crst.lock();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(Duration::from_micros(50));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!crst.is_locked());
    }

    #[test]
    fn test_spin_count() {
        let crst = Crst::new();
        assert_eq!(crst.set_spin_count(4000), 0);
        assert_eq!(crst.spin_count(), 4000);
    }
}
