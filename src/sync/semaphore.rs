//! Counting semaphores with a fixed maximum.

use std::{sync::Arc, time::Duration};

use crate::{
    sync::{SyncError, WaitCell, WaitOptions, WaitOutcome},
    Error, Result,
};

#[derive(Clone, Copy, Debug)]
struct SemaphoreState {
    count: u32,
    max_count: u32,
}

impl SemaphoreState {
    fn try_acquire(&mut self) -> bool {
        if self.count > 0 {
            self.count -= 1;
            true
        } else {
            false
        }
    }

    fn release(&mut self, count: u32) -> std::result::Result<u32, SyncError> {
        let previous = self.count;
        let new_count = previous
            .checked_add(count)
            .filter(|new_count| *new_count <= self.max_count)
            .ok_or(SyncError::SemaphoreOverflow)?;
        self.count = new_count;
        Ok(previous)
    }
}

/// A counting semaphore.
pub struct Semaphore {
    cell: Arc<WaitCell<SemaphoreState>>,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` of `max` slots.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `max` is zero or `initial` exceeds it.
    pub fn new(initial: u32, max: u32) -> Result<Self> {
        if max == 0 || initial > max {
            return Err(Error::InvalidArgument(format!(
                "semaphore initial count {} with maximum {}",
                initial, max
            )));
        }
        Ok(Self {
            cell: WaitCell::new(SemaphoreState {
                count: initial,
                max_count: max,
            }),
        })
    }

    /// Takes one slot, waiting for one to become free.
    pub fn wait(&self, timeout: Option<Duration>, options: WaitOptions) -> WaitOutcome {
        self.cell.wait_until(timeout, options, |state| {
            state.try_acquire().then_some(WaitOutcome::Signaled)
        })
    }

    /// Returns `count` slots and reports the count before the release.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SemaphoreOverflow`] if the count would pass the maximum; the count
    /// is left unchanged.
    pub fn release(&self, count: u32) -> Result<u32> {
        let previous = self.cell.lock().release(count)?;
        for _ in 0..count {
            self.cell.notify_one();
        }
        Ok(previous)
    }

    /// The number of free slots.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.cell.lock().count
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = *self.cell.lock();
        f.debug_struct("Semaphore")
            .field("count", &state.count)
            .field("max_count", &state.max_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_and_release() {
        let sem = Semaphore::new(2, 3).unwrap();
        assert!(sem.wait(Some(Duration::ZERO), WaitOptions::empty()).is_signaled());
        assert!(sem.wait(Some(Duration::ZERO), WaitOptions::empty()).is_signaled());
        assert!(sem
            .wait(Some(Duration::from_millis(5)), WaitOptions::empty())
            .is_timed_out());
        assert_eq!(sem.release(3).unwrap(), 0);
        assert_eq!(sem.count(), 3);
    }

    #[test]
    fn test_overflow_leaves_count() {
        let sem = Semaphore::new(1, 2).unwrap();
        assert!(matches!(
            sem.release(2),
            Err(Error::Sync(SyncError::SemaphoreOverflow))
        ));
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn test_invalid_construction() {
        assert!(Semaphore::new(0, 0).is_err());
        assert!(Semaphore::new(5, 2).is_err());
    }

    #[test]
    fn test_release_wakes_waiter() {
        let sem = Arc::new(Semaphore::new(0, 1).unwrap());
        let waiter = Arc::clone(&sem);
        let handle =
            thread::spawn(move || waiter.wait(Some(Duration::from_secs(10)), WaitOptions::empty()));
        thread::sleep(Duration::from_millis(20));
        sem.release(1).unwrap();
        assert!(handle.join().unwrap().is_signaled());
        assert_eq!(sem.count(), 0);
    }
}
