//! Completion ports.
//!
//! A port is a queue of [`crate::io::Completion`] packets that worker threads drain. Resources
//! bound to a port post their completions through a [`crate::io::CompletionSink`]. Closing a
//! port wakes every worker blocked on it with [`crate::sync::WaitOutcome::Abandoned`] and drops
//! whatever was still queued.
//!
//! # Key Components
//!
//! - [`crate::io::PortId`] / [`crate::io::ResourceId`] - Handles for a port and a bound resource
//! - [`crate::io::Completion`] - One finished operation: error code, byte count, caller context
//! - [`crate::io::CompletionSink`] - Posting side handed out by
//!   [`crate::io::IoCompletionManager::bind`]
//!
//! The port also carries the count of workers attached to it, shared with those workers so
//! the last one can see that it must stay.
//!
//! # Usage Examples
//!
//! ```rust,ignore
//! use hostrt::io::ResourceId;
//!
//! let sink = host.io().bind(None, ResourceId(7))?;
//! // Called by whoever finished the I/O on resource 7.
//! sink.post(0, 4096, 0xfeed)?;
//! ```

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    sync::{WaitCell, WaitOptions, WaitOutcome},
    Error, Result,
};

/// Handle of an open completion port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub u32);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port({})", self.0)
    }
}

/// Opaque handle of a resource (a file, a socket) bound to a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u64);

/// One finished I/O operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    /// OS error code of the operation, `0` on success.
    pub error_code: u32,
    /// Bytes moved by the operation.
    pub bytes_transferred: usize,
    /// Caller context identifying the operation.
    pub context: u64,
}

#[derive(Default)]
struct PortState {
    queue: VecDeque<Completion>,
    resources: HashSet<ResourceId>,
    closed: bool,
}

/// What a worker got from [`CompletionPort::dequeue`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PortPoll {
    Completion(Completion),
    TimedOut,
    Abandoned,
}

pub(crate) struct CompletionPort {
    id: PortId,
    cell: Arc<WaitCell<PortState>>,
    workers: Arc<AtomicUsize>,
}

impl CompletionPort {
    pub(crate) fn new(id: PortId) -> Arc<Self> {
        Arc::new(Self {
            id,
            cell: WaitCell::new(PortState::default()),
            workers: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub(crate) fn id(&self) -> PortId {
        self.id
    }

    /// Per-port worker count, shared with the workers themselves.
    pub(crate) fn workers(&self) -> &Arc<AtomicUsize> {
        &self.workers
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.load(Ordering::Acquire)
    }

    pub(crate) fn bind(&self, resource: ResourceId) -> Result<()> {
        let mut state = self.cell.lock();
        if state.closed {
            return Err(Error::NotFound(format!("{} is closed", self.id)));
        }
        state.resources.insert(resource);
        Ok(())
    }

    pub(crate) fn post(&self, completion: Completion) -> Result<()> {
        {
            let mut state = self.cell.lock();
            if state.closed {
                return Err(Error::NotFound(format!("{} is closed", self.id)));
            }
            state.queue.push_back(completion);
        }
        self.cell.notify_one();
        Ok(())
    }

    /// Takes the oldest completion, waiting up to `timeout` for one.
    pub(crate) fn dequeue(&self, timeout: Duration) -> PortPoll {
        let mut taken = None;
        let outcome = self
            .cell
            .wait_until(Some(timeout), WaitOptions::empty(), |state| {
                if state.closed {
                    return Some(WaitOutcome::Abandoned);
                }
                taken = state.queue.pop_front();
                taken.map(|_| WaitOutcome::Signaled)
            });
        match (outcome, taken) {
            (WaitOutcome::Abandoned, _) => PortPoll::Abandoned,
            (_, Some(completion)) => PortPoll::Completion(completion),
            _ => PortPoll::TimedOut,
        }
    }

    /// Marks the port closed, drops queued completions and wakes every worker.
    pub(crate) fn close(&self) -> usize {
        let dropped = {
            let mut state = self.cell.lock();
            state.closed = true;
            state.resources.clear();
            std::mem::take(&mut state.queue).len()
        };
        self.cell.notify_all();
        dropped
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cell.lock().closed
    }

    pub(crate) fn pending(&self) -> usize {
        self.cell.lock().queue.len()
    }

    pub(crate) fn resource_count(&self) -> usize {
        self.cell.lock().resources.len()
    }
}

/// Posting side of a bound resource.
///
/// Returned by [`IoCompletionManager::bind`](crate::io::IoCompletionManager::bind); whoever
/// performs I/O on the resource reports each finished operation here.
#[derive(Clone)]
pub struct CompletionSink {
    port: Arc<CompletionPort>,
    resource: ResourceId,
}

impl CompletionSink {
    pub(crate) fn new(port: Arc<CompletionPort>, resource: ResourceId) -> Self {
        Self { port, resource }
    }

    /// Queues a completion on the bound port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] once the port has been closed.
    pub fn post(&self, error_code: u32, bytes_transferred: usize, context: u64) -> Result<()> {
        self.port.post(Completion {
            error_code,
            bytes_transferred,
            context,
        })
    }

    /// The port completions go to.
    pub fn port(&self) -> PortId {
        self.port.id()
    }

    /// The bound resource.
    pub fn resource(&self) -> ResourceId {
        self.resource
    }
}

impl fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSink")
            .field("port", &self.port.id())
            .field("resource", &self.resource)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn completion(context: u64) -> Completion {
        Completion {
            error_code: 0,
            bytes_transferred: 16,
            context,
        }
    }

    #[test]
    fn test_fifo_dequeue() {
        let port = CompletionPort::new(PortId(1));
        port.post(completion(1)).unwrap();
        port.post(completion(2)).unwrap();
        assert_eq!(port.pending(), 2);
        assert_eq!(
            port.dequeue(Duration::ZERO),
            PortPoll::Completion(completion(1))
        );
        assert_eq!(
            port.dequeue(Duration::ZERO),
            PortPoll::Completion(completion(2))
        );
        assert_eq!(port.dequeue(Duration::from_millis(10)), PortPoll::TimedOut);
    }

    #[test]
    fn test_close_abandons_waiters() {
        let port = CompletionPort::new(PortId(1));
        let waiter = {
            let port = port.clone();
            thread::spawn(move || port.dequeue(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        port.post(completion(1)).unwrap();
        port.post(completion(2)).unwrap();
        let first = waiter.join().unwrap();
        assert_eq!(first, PortPoll::Completion(completion(1)));

        assert_eq!(port.close(), 1);
        assert!(port.is_closed());
        assert_eq!(port.dequeue(Duration::from_secs(1)), PortPoll::Abandoned);
        assert!(port.post(completion(3)).is_err());
        assert!(port.bind(ResourceId(1)).is_err());
    }

    #[test]
    fn test_sink_posts_to_port() {
        let port = CompletionPort::new(PortId(7));
        port.bind(ResourceId(42)).unwrap();
        let sink = CompletionSink::new(port.clone(), ResourceId(42));
        sink.post(5, 100, 9).unwrap();
        assert_eq!(sink.port(), PortId(7));
        assert_eq!(port.resource_count(), 1);
        assert_eq!(
            port.dequeue(Duration::ZERO),
            PortPoll::Completion(Completion {
                error_code: 5,
                bytes_transferred: 100,
                context: 9
            })
        );
    }
}
