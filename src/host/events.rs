//! The host event channel.
//!
//! Admission denials and domain lifecycle changes are reported to the embedding side through a
//! small queue. Events of the same kind for the same domain collapse into one entry while
//! queued, so a domain hammering its thread cap produces a single notification per drain.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use strum::Display;

use crate::{
    domain::DomainId,
    sync::{WaitCell, WaitOptions, WaitOutcome},
    thread::NativeThreadId,
};

/// Kind of a [`HostEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum HostEventKind {
    /// A domain was refused a new thread.
    OutOfTasks,
    /// A domain was refused memory.
    OutOfMemory,
    /// A domain was unloaded.
    DomainUnloaded,
    /// The host asked for a domain to be unloaded.
    UnloadRequested,
}

/// A notification for the embedding side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostEvent {
    /// What happened.
    pub kind: HostEventKind,
    /// The domain concerned.
    pub domain: DomainId,
    /// The thread that triggered it, if one did.
    pub thread: Option<NativeThreadId>,
}

impl HostEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(kind: HostEventKind, domain: DomainId, thread: Option<NativeThreadId>) -> Self {
        Self {
            kind,
            domain,
            thread,
        }
    }
}

/// Deduplicating queue of [`HostEvent`]s, drained with [`HostEventQueue::poll`].
pub struct HostEventQueue {
    queue: Arc<WaitCell<VecDeque<HostEvent>>>,
}

impl HostEventQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: WaitCell::new(VecDeque::new()),
        }
    }

    /// Queues `event` unless one with the same kind and domain is already waiting.
    ///
    /// Returns `true` if the event was queued.
    pub fn post(&self, event: HostEvent) -> bool {
        let mut queue = self.queue.lock();
        if queue
            .iter()
            .any(|queued| queued.kind == event.kind && queued.domain == event.domain)
        {
            return false;
        }
        log::debug!("host event {} for domain {}", event.kind, event.domain);
        queue.push_back(event);
        drop(queue);
        self.queue.notify_one();
        true
    }

    /// Takes the oldest event, waiting up to `timeout` for one to arrive.
    ///
    /// `None` waits indefinitely.
    pub fn poll(&self, timeout: Option<Duration>) -> Option<HostEvent> {
        let mut event = None;
        let outcome = self
            .queue
            .wait_until(timeout, WaitOptions::empty(), |queue| {
                event = queue.pop_front();
                event.map(|_| WaitOutcome::Signaled)
            });
        outcome.is_signaled().then_some(event).flatten()
    }

    /// Drops every queued event concerning `domain`. Returns how many were dropped.
    pub fn purge_domain(&self, domain: DomainId) -> usize {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|event| event.domain != domain);
        before - queue.len()
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HostEventQueue {
    fn default() -> Self {
        Self::new()
    }
}
