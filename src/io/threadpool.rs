//! Work-item thread pool.

use std::{
    io,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{host::WorkerPoolConfig, Error, Result};

/// Runs fire-and-forget work items for the runtime.
///
/// The pool is built on first use with [`WorkerPoolManager::max_threads`] workers. Changing the
/// size swaps in a new pool for later items; items already queued finish on the old one.
pub struct WorkerPoolManager {
    pool: RwLock<Option<Arc<ThreadPool>>>,
    max_threads: AtomicUsize,
    queued: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
}

impl WorkerPoolManager {
    /// Creates a manager. No threads are started until the first item is queued.
    #[must_use]
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            pool: RwLock::new(None),
            max_threads: AtomicUsize::new(config.max_threads),
            queued: Arc::new(AtomicU64::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queues `work` on the pool.
    ///
    /// A panicking item is logged and does not take the worker down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadCreation`] if the pool cannot be started.
    pub fn queue_user_work_item<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = self.pool()?;
        self.queued.fetch_add(1, Ordering::Relaxed);
        let completed = self.completed.clone();
        pool.spawn(move || {
            work();
            completed.fetch_add(1, Ordering::Relaxed);
        });
        Ok(())
    }

    fn pool(&self) -> Result<Arc<ThreadPool>> {
        if let Some(pool) = read_lock!(self.pool).as_ref() {
            return Ok(pool.clone());
        }

        let mut slot = write_lock!(self.pool);
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }
        let threads = self.max_threads();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("host-worker-{}", index))
            .panic_handler(|_| log::error!("work item panicked"))
            .build()
            .map_err(|error| Error::ThreadCreation(io::Error::other(error.to_string())))?;
        log::debug!("started work-item pool with {} threads", threads);

        let pool = Arc::new(pool);
        *slot = Some(pool.clone());
        Ok(pool)
    }

    /// Sets the pool size used for items queued from now on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for zero.
    pub fn set_max_threads(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(Error::InvalidArgument(
                "work-item pool needs at least one thread".to_string(),
            ));
        }
        if self.max_threads.swap(max, Ordering::AcqRel) != max {
            *write_lock!(self.pool) = None;
        }
        Ok(())
    }

    /// The pool size.
    pub fn max_threads(&self) -> usize {
        self.max_threads.load(Ordering::Acquire)
    }

    /// The pool has no floor of its own.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::NotSupported`].
    pub fn set_min_threads(&self, _min: usize) -> Result<()> {
        Err(Error::NotSupported("work-item pool minimum"))
    }

    /// The pool has no floor of its own.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::NotSupported`].
    pub fn min_threads(&self) -> Result<usize> {
        Err(Error::NotSupported("work-item pool minimum"))
    }

    /// Idle worker count is not tracked.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::NotSupported`].
    pub fn available_threads(&self) -> Result<usize> {
        Err(Error::NotSupported("work-item pool availability"))
    }

    /// Items queued so far.
    pub fn queued_count(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Items that ran to completion.
    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for WorkerPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolManager")
            .field("max_threads", &self.max_threads())
            .field("queued", &self.queued_count())
            .field("completed", &self.completed_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc, time::Duration};

    #[test]
    fn test_queue_runs_items() {
        let pool = WorkerPoolManager::new(WorkerPoolConfig { max_threads: 2 });
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.queue_user_work_item(move || {
                tx.send(i).unwrap();
            })
            .unwrap();
        }
        let mut got: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
        assert_eq!(pool.queued_count(), 10);
    }

    #[test]
    fn test_max_threads() {
        let pool = WorkerPoolManager::new(WorkerPoolConfig::default());
        assert_eq!(pool.max_threads(), 512);
        pool.set_max_threads(4).unwrap();
        assert_eq!(pool.max_threads(), 4);
        assert!(matches!(
            pool.set_max_threads(0),
            Err(Error::InvalidArgument(_))
        ));

        let (tx, rx) = mpsc::channel();
        pool.queue_user_work_item(move || {
            tx.send(rayon::current_num_threads()).unwrap();
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 4);
    }

    #[test]
    fn test_unsupported_accessors() {
        let pool = WorkerPoolManager::new(WorkerPoolConfig::default());
        assert!(matches!(pool.min_threads(), Err(Error::NotSupported(_))));
        assert!(matches!(pool.set_min_threads(1), Err(Error::NotSupported(_))));
        assert!(matches!(pool.available_threads(), Err(Error::NotSupported(_))));
    }
}
