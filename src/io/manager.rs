//! The completion port scheduler.
//!
//! [`crate::io::IoCompletionManager`] owns the open ports and one elastic worker pool shared by
//! all of them.
//!
//! # Pool Rules
//!
//! - A port gets its first worker when the first resource is bound to it
//! - A bind adds a worker when every worker is busy and the pool is below its maximum
//! - An idle worker retires only if its port keeps another worker and the pool stays at or
//!   above its minimum
//! - Closing a port ends all of its workers
//!
//! Completions are handed to the registered [`crate::io::CompletionCallback`]. A callback that
//! panics is logged and the worker keeps serving its port.

use std::{
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    host::IoConfig,
    io::port::{Completion, CompletionPort, CompletionSink, PortId, PortPoll, ResourceId},
    Error, Result,
};

/// Receives every completion dequeued by the worker pool.
pub trait CompletionCallback: Send + Sync {
    /// One I/O operation finished.
    fn on_complete(&self, error_code: u32, bytes_transferred: usize, context: u64);
}

/// Counters and settings shared between the manager and its workers.
struct PoolState {
    threads: AtomicUsize,
    busy: AtomicUsize,
    min_threads: AtomicUsize,
    max_threads: AtomicUsize,
    poll_interval: Duration,
    callback: RwLock<Option<Arc<dyn CompletionCallback>>>,
}

impl PoolState {
    /// Uncounts one worker unless the pool is already at its floor.
    fn try_retire(&self) -> bool {
        let min = self.min_threads.load(Ordering::Acquire);
        self.threads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |threads| {
                (threads > min).then(|| threads - 1)
            })
            .is_ok()
    }

    fn dispatch(&self, completion: Completion) {
        let callback = read_lock!(self.callback).clone();
        let Some(callback) = callback else {
            log::warn!(
                "dropping completion {:#x}: no completion callback registered",
                completion.context
            );
            return;
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            callback.on_complete(
                completion.error_code,
                completion.bytes_transferred,
                completion.context,
            );
        }));
        if result.is_err() {
            log::error!(
                "completion callback panicked on context {:#x}",
                completion.context
            );
        }
    }
}

/// Body of one completion worker.
///
/// The spawner has already counted this worker in `threads`, `busy` and the port's cell.
fn worker_loop(pool: Arc<PoolState>, port: Arc<CompletionPort>) {
    let cell = port.workers().clone();
    let mut retired = false;

    loop {
        pool.busy.fetch_sub(1, Ordering::AcqRel);
        let polled = port.dequeue(pool.poll_interval);
        pool.busy.fetch_add(1, Ordering::AcqRel);

        match polled {
            PortPoll::Abandoned => break,
            PortPoll::Completion(completion) => pool.dispatch(completion),
            PortPoll::TimedOut => {}
        }

        if port.pending() == 0 {
            // Never leave a live port without a worker, nor the pool below its floor.
            if cell.fetch_sub(1, Ordering::AcqRel) > 1 && pool.try_retire() {
                retired = true;
                break;
            }
            cell.fetch_add(1, Ordering::AcqRel);
        }
    }

    // A retired worker was already uncounted by `try_retire` and its port cell.
    if !retired {
        cell.fetch_sub(1, Ordering::AcqRel);
        pool.threads.fetch_sub(1, Ordering::AcqRel);
    }
    pool.busy.fetch_sub(1, Ordering::AcqRel);
    log::trace!(
        "completion worker for {} exiting ({})",
        port.id(),
        if retired { "retired" } else { "port closed" }
    );
}

/// Completion ports and their elastic worker pool.
///
/// Each bound port keeps at least one worker while it is open. Workers retire when their port
/// is idle and the pool is above its minimum; a new worker is added only when every worker is
/// busy dispatching and the pool is below its maximum.
pub struct IoCompletionManager {
    ports: Mutex<HashMap<PortId, Arc<CompletionPort>>>,
    default_port: RwLock<Option<PortId>>,
    next_port: AtomicU32,
    max_ports: usize,
    pool: Arc<PoolState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl IoCompletionManager {
    /// Creates a scheduler with no ports.
    #[must_use]
    pub fn new(config: IoConfig) -> Self {
        Self {
            ports: Mutex::new(HashMap::new()),
            default_port: RwLock::new(None),
            next_port: AtomicU32::new(1),
            max_ports: config.max_ports,
            pool: Arc::new(PoolState {
                threads: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                min_threads: AtomicUsize::new(config.min_threads),
                max_threads: AtomicUsize::new(config.max_threads),
                poll_interval: config.poll_interval,
                callback: RwLock::new(None),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Registers the callback completions are dispatched to, replacing any previous one.
    pub fn set_completion_callback(&self, callback: Arc<dyn CompletionCallback>) {
        *write_lock!(self.pool.callback) = Some(callback);
    }

    /// Opens a new port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortLimit`] when `max_ports` ports are already open.
    pub fn create_port(&self) -> Result<PortId> {
        let mut ports = lock!(self.ports);
        if ports.len() >= self.max_ports {
            log::warn!("completion port table full ({} ports)", self.max_ports);
            return Err(Error::PortLimit(self.max_ports));
        }
        let id = PortId(self.next_port.fetch_add(1, Ordering::Relaxed));
        ports.insert(id, CompletionPort::new(id));
        log::debug!("created {}", id);
        Ok(id)
    }

    /// Closes a port. Its workers see the port abandoned and exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown or already closed port.
    pub fn close_port(&self, id: PortId) -> Result<()> {
        let port = lock!(self.ports)
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("{} is not open", id)))?;
        {
            let mut default = write_lock!(self.default_port);
            if *default == Some(id) {
                *default = None;
            }
        }
        let dropped = port.close();
        log::debug!("closed {} ({} queued completions dropped)", id, dropped);
        Ok(())
    }

    /// The default port, created on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortLimit`] if the port table is full.
    pub fn default_port(&self) -> Result<PortId> {
        if let Some(id) = *read_lock!(self.default_port) {
            return Ok(id);
        }

        let mut default = write_lock!(self.default_port);
        if let Some(id) = *default {
            return Ok(id);
        }
        let id = self.create_port()?;
        *default = Some(id);
        Ok(id)
    }

    /// Associates `resource` with `port` (the default port when `None`) and makes sure the
    /// port has workers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown port, or [`Error::PortLimit`] if the default
    /// port had to be created and the table is full.
    pub fn bind(&self, port: Option<PortId>, resource: ResourceId) -> Result<CompletionSink> {
        let id = match port {
            Some(id) => id,
            None => self.default_port()?,
        };
        let port = self.port(id)?;

        if port.worker_count() == 0 {
            self.spawn_worker(&port);
        } else {
            self.grow_if_saturated(&port);
        }

        port.bind(resource)?;
        log::trace!("bound resource {} to {}", resource.0, id);
        Ok(CompletionSink::new(port, resource))
    }

    fn port(&self, id: PortId) -> Result<Arc<CompletionPort>> {
        lock!(self.ports)
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{} is not open", id)))
    }

    fn grow_if_saturated(&self, port: &Arc<CompletionPort>) {
        let threads = self.pool.threads.load(Ordering::Acquire);
        let busy = self.pool.busy.load(Ordering::Acquire);
        if busy == threads && threads < self.pool.max_threads.load(Ordering::Acquire) {
            self.spawn_worker(port);
        }
    }

    fn spawn_worker(&self, port: &Arc<CompletionPort>) {
        self.pool.threads.fetch_add(1, Ordering::AcqRel);
        self.pool.busy.fetch_add(1, Ordering::AcqRel);
        port.workers().fetch_add(1, Ordering::AcqRel);

        let pool = self.pool.clone();
        let worker_port = port.clone();
        let spawned = thread::Builder::new()
            .name(format!("host-io-{}", port.id().0))
            .spawn(move || worker_loop(pool, worker_port));

        match spawned {
            Ok(handle) => {
                let mut handles = lock!(self.handles);
                handles.retain(|handle| !handle.is_finished());
                handles.push(handle);
            }
            Err(error) => {
                log::error!("failed to start completion worker for {}: {}", port.id(), error);
                port.workers().fetch_sub(1, Ordering::AcqRel);
                self.pool.busy.fetch_sub(1, Ordering::AcqRel);
                self.pool.threads.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Sets the pool floor.
    pub fn set_min_threads(&self, min: usize) {
        self.pool.min_threads.store(min, Ordering::Release);
    }

    /// The pool floor.
    pub fn min_threads(&self) -> usize {
        self.pool.min_threads.load(Ordering::Acquire)
    }

    /// Sets the pool cap.
    pub fn set_max_threads(&self, max: usize) {
        self.pool.max_threads.store(max, Ordering::Release);
    }

    /// The pool cap.
    pub fn max_threads(&self) -> usize {
        self.pool.max_threads.load(Ordering::Acquire)
    }

    /// How many more workers the pool may start.
    pub fn available_threads(&self) -> usize {
        self.max_threads().saturating_sub(self.thread_count())
    }

    /// Live workers across all ports.
    pub fn thread_count(&self) -> usize {
        self.pool.threads.load(Ordering::Acquire)
    }

    /// Workers currently dispatching a completion.
    pub fn busy_count(&self) -> usize {
        self.pool.busy.load(Ordering::Acquire)
    }

    /// Workers attached to `id`, or `None` if the port is not open.
    pub fn port_worker_count(&self, id: PortId) -> Option<usize> {
        lock!(self.ports).get(&id).map(|port| port.worker_count())
    }

    /// Number of open ports.
    pub fn port_count(&self) -> usize {
        lock!(self.ports).len()
    }

    /// Per-operation bytes the host appends to overlapped structures. The host appends none.
    pub fn host_overlapped_size(&self) -> usize {
        0
    }

    /// Closes every port and waits up to `timeout` for the workers to exit. Returns `true` if
    /// they all did.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let ports: Vec<_> = lock!(self.ports).drain().map(|(_, port)| port).collect();
        *write_lock!(self.default_port) = None;
        for port in &ports {
            port.close();
        }

        let deadline = std::time::Instant::now() + timeout;
        let handles: Vec<_> = lock!(self.handles).drain(..).collect();
        let mut clean = true;
        for handle in handles {
            while !handle.is_finished() && std::time::Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    log::error!("completion worker panicked");
                }
            } else {
                clean = false;
            }
        }
        clean
    }
}

impl Drop for IoCompletionManager {
    fn drop(&mut self) {
        for port in lock!(self.ports).values() {
            port.close();
        }
    }
}

impl fmt::Debug for IoCompletionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoCompletionManager")
            .field("ports", &self.port_count())
            .field("threads", &self.thread_count())
            .field("busy", &self.busy_count())
            .field("min_threads", &self.min_threads())
            .field("max_threads", &self.max_threads())
            .finish()
    }
}
