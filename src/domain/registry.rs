//! The domain registry.
//!
//! Everything here sits behind a single mutex. Each operation is short and never blocks while
//! holding it; notifications to a [`DomainManager`] and posts to the host event channel happen
//! after the guard has been dropped.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    domain::{DomainId, DomainManager},
    host::{DomainLimits, HostEvent, HostEventKind, HostEventQueue},
    thread::NativeThreadId,
    Error, Result,
};

/// Live state of one domain.
struct DomainRecord {
    main_thread: NativeThreadId,
    threads: usize,
    bytes: u64,
    manager: Arc<dyn DomainManager>,
}

/// Bytes charged for one allocation, keyed by its address in the ledger.
#[derive(Clone, Copy, Debug)]
struct Charge {
    domain: Option<DomainId>,
    thread: NativeThreadId,
    bytes: u64,
}

#[derive(Default)]
struct RegistryState {
    domains: HashMap<DomainId, DomainRecord>,
    bindings: HashMap<NativeThreadId, DomainId>,
    default_domain: Option<DomainId>,
    default_manager: Option<Arc<dyn DomainManager>>,
    ledger: HashMap<u64, Charge>,
    thread_bytes: HashMap<NativeThreadId, u64>,
}

impl RegistryState {
    /// Removes a domain record together with every binding to it. Outstanding charges stay in
    /// the ledger but no longer count against any domain, so a reused id starts from zero.
    fn remove_domain(&mut self, id: DomainId) -> Option<DomainRecord> {
        let record = self.domains.remove(&id)?;
        self.bindings.retain(|_, bound| *bound != id);
        for charge in self
            .ledger
            .values_mut()
            .filter(|charge| charge.domain == Some(id))
        {
            charge.domain = None;
        }
        Some(record)
    }

    /// Binds `thread` to the live domain `domain`, moving it out of any previous domain.
    fn bind(&mut self, domain: DomainId, thread: NativeThreadId) -> Result<()> {
        if !self.domains.contains_key(&domain) {
            return Err(Error::DomainNotFound(domain));
        }
        if let Some(previous) = self.bindings.insert(thread, domain) {
            if let Some(old) = self.domains.get_mut(&previous) {
                old.threads = old.threads.saturating_sub(1);
            }
        }
        if let Some(record) = self.domains.get_mut(&domain) {
            record.threads += 1;
        }
        Ok(())
    }

    fn credit(&mut self, charge: Charge, bytes: u64) {
        if let Some(record) = charge.domain.and_then(|id| self.domains.get_mut(&id)) {
            record.bytes = record.bytes.saturating_sub(bytes);
        }
        if let Some(total) = self.thread_bytes.get_mut(&charge.thread) {
            *total = total.saturating_sub(bytes);
            if *total == 0 {
                self.thread_bytes.remove(&charge.thread);
            }
        }
    }
}

/// Authoritative map of domains, thread bindings and per-domain accounting.
///
/// # Invariants
///
/// - A thread is bound to at most one domain at any time
/// - A domain's thread count equals the number of threads bound to it
/// - The default domain is the first domain ever created and never changes
/// - Byte counters never go below zero: releasing an address that was never charged is a no-op
pub struct DomainRegistry {
    state: Mutex<RegistryState>,
    zombies: AtomicU64,
    limits: DomainLimits,
    events: Arc<HostEventQueue>,
}

impl DomainRegistry {
    /// Creates an empty registry.
    ///
    /// # Arguments
    ///
    /// * `limits` - Per-domain admission caps
    /// * `events` - Channel that receives admission denials and unload notifications
    #[must_use]
    pub fn new(limits: DomainLimits, events: Arc<HostEventQueue>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            zombies: AtomicU64::new(0),
            limits,
            events,
        }
    }

    /// Registers a new domain whose main thread is `creating_thread`.
    ///
    /// If the creating thread is currently bound to another domain it migrates: the old
    /// domain's thread count drops by one and the thread is bound to the new domain only.
    /// The first domain ever created becomes the default domain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DomainExists`] if a live domain already has this id. The existing
    /// record is left untouched.
    pub fn create_domain(
        &self,
        id: DomainId,
        creating_thread: NativeThreadId,
        manager: Arc<dyn DomainManager>,
    ) -> Result<()> {
        let mut state = lock!(self.state);
        if state.domains.contains_key(&id) {
            log::warn!("domain {} registered twice, keeping the existing record", id);
            return Err(Error::DomainExists(id));
        }

        if let Some(previous) = state.bindings.insert(creating_thread, id) {
            if let Some(old) = state.domains.get_mut(&previous) {
                old.threads = old.threads.saturating_sub(1);
            }
            log::debug!(
                "{} migrates from domain {} to domain {}",
                creating_thread,
                previous,
                id
            );
        }

        if state.default_domain.is_none() {
            state.default_domain = Some(id);
            state.default_manager = Some(Arc::clone(&manager));
        }

        state.domains.insert(
            id,
            DomainRecord {
                main_thread: creating_thread,
                threads: 1,
                bytes: 0,
                manager,
            },
        );
        log::info!("domain {} created on {}", id, creating_thread);
        Ok(())
    }

    /// Admission check before `parent` creates a thread.
    ///
    /// Denials are posted to the host event channel as [`HostEventKind::OutOfTasks`]. A parent
    /// without a domain binding is always admitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadLimit`] if the parent's domain is at its cap.
    pub fn admit_thread(&self, parent: NativeThreadId) -> Result<()> {
        let limit = self.limits.max_threads_per_domain;
        let denied = {
            let state = lock!(self.state);
            state.bindings.get(&parent).and_then(|domain| {
                let record = state.domains.get(domain)?;
                (limit != 0 && record.threads >= limit).then_some(*domain)
            })
        };

        match denied {
            Some(domain) => {
                log::debug!("domain {} denied a thread to {}", domain, parent);
                self.events.post(HostEvent::new(
                    HostEventKind::OutOfTasks,
                    domain,
                    Some(parent),
                ));
                Err(Error::ThreadLimit { domain, limit })
            }
            None => Ok(()),
        }
    }

    /// Returns `true` if `parent` may create another thread. See [`DomainRegistry::admit_thread`].
    pub fn thread_acquiring(&self, parent: NativeThreadId) -> bool {
        self.admit_thread(parent).is_ok()
    }

    /// Binds `child` to the domain of `parent` and counts it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadNotBound`] if the parent has no domain.
    pub fn thread_acquire(&self, parent: NativeThreadId, child: NativeThreadId) -> Result<()> {
        let mut state = lock!(self.state);
        let Some(domain) = state.bindings.get(&parent).copied() else {
            log::warn!("{} acquired {} without a domain", parent, child);
            return Err(Error::ThreadNotBound(parent));
        };
        state.bind(domain, child)?;
        log::trace!("{} joins domain {}", child, domain);
        Ok(())
    }

    /// Admits a thread for `parent` and binds `child` to the parent's domain under one lock.
    ///
    /// Returns the domain the child joined, or `None` if the parent has no domain; an unbound
    /// parent is always admitted. Concurrent callers from one domain can never overshoot its
    /// thread cap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadLimit`] if the parent's domain is at its cap. The denial is
    /// posted as [`HostEventKind::OutOfTasks`].
    pub fn reserve_thread(
        &self,
        parent: NativeThreadId,
        child: NativeThreadId,
    ) -> Result<Option<DomainId>> {
        let limit = self.limits.max_threads_per_domain;
        let denied = {
            let mut state = lock!(self.state);
            let Some(domain) = state.bindings.get(&parent).copied() else {
                return Ok(None);
            };
            let full = state
                .domains
                .get(&domain)
                .is_some_and(|record| limit != 0 && record.threads >= limit);
            if !full {
                state.bind(domain, child)?;
                log::trace!("{} joins domain {}", child, domain);
                return Ok(Some(domain));
            }
            domain
        };

        log::debug!("domain {} denied a thread to {}", denied, parent);
        self.events.post(HostEvent::new(
            HostEventKind::OutOfTasks,
            denied,
            Some(parent),
        ));
        Err(Error::ThreadLimit {
            domain: denied,
            limit,
        })
    }

    /// Unbinds `thread` and uncounts it.
    ///
    /// When `thread` is its domain's main thread, the domain record is removed and its manager
    /// is told the main thread exited.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadNotBound`] if the thread has no binding.
    pub fn thread_release(&self, thread: NativeThreadId) -> Result<()> {
        let notify = {
            let mut state = lock!(self.state);
            let Some(domain) = state.bindings.remove(&thread) else {
                log::warn!("release of unbound {}", thread);
                return Err(Error::ThreadNotBound(thread));
            };

            let main_exit = match state.domains.get_mut(&domain) {
                Some(record) => {
                    record.threads = record.threads.saturating_sub(1);
                    record.main_thread == thread
                }
                None => false,
            };

            if main_exit {
                state
                    .remove_domain(domain)
                    .map(|record| (domain, record.threads == 0, record.manager))
            } else {
                None
            }
        };

        if let Some((domain, is_empty, manager)) = notify {
            log::info!("main thread of domain {} exited (empty: {})", domain, is_empty);
            manager.on_main_thread_exit(domain, is_empty);
        }
        Ok(())
    }

    /// Removes the domain record and drops its pending host events.
    ///
    /// An unknown domain is logged and otherwise ignored.
    pub fn on_domain_unload(&self, domain: DomainId) {
        let removed = lock!(self.state).remove_domain(domain);
        if removed.is_none() {
            log::warn!("unload of unknown domain {}", domain);
            return;
        }

        let purged = self.events.purge_domain(domain);
        log::info!(
            "domain {} unloaded, {} pending events dropped",
            domain,
            purged
        );
        self.events
            .post(HostEvent::new(HostEventKind::DomainUnloaded, domain, None));
    }

    /// Records a forced unload.
    ///
    /// The forced path does not know which domain went away, so only the zombie counter moves.
    pub fn on_domain_rude_unload(&self) {
        let zombies = self.zombies.fetch_add(1, Ordering::AcqRel) + 1;
        log::warn!("rude domain unload, {} zombie domains", zombies);
    }

    /// Returns `true` if `thread` runs in a domain other than the default one.
    pub fn is_snippet_thread(&self, thread: NativeThreadId) -> bool {
        let state = lock!(self.state);
        match (state.bindings.get(&thread), state.default_domain) {
            (Some(domain), Some(default)) => *domain != default,
            _ => false,
        }
    }

    /// The manager of the first domain ever created.
    pub fn default_domain_manager(&self) -> Option<Arc<dyn DomainManager>> {
        lock!(self.state).default_manager.clone()
    }

    /// The id of the first domain ever created.
    pub fn default_domain(&self) -> Option<DomainId> {
        lock!(self.state).default_domain
    }

    /// The domain `thread` is bound to.
    pub fn domain_of(&self, thread: NativeThreadId) -> Option<DomainId> {
        lock!(self.state).bindings.get(&thread).copied()
    }

    /// The main thread of `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DomainNotFound`] for an unknown domain.
    pub fn main_thread(&self, domain: DomainId) -> Result<NativeThreadId> {
        self.with_domain(domain, |record| record.main_thread)
    }

    /// Number of live threads bound to `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DomainNotFound`] for an unknown domain.
    pub fn thread_count(&self, domain: DomainId) -> Result<usize> {
        self.with_domain(domain, |record| record.threads)
    }

    /// Live bytes charged to `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DomainNotFound`] for an unknown domain.
    pub fn memory_usage(&self, domain: DomainId) -> Result<u64> {
        self.with_domain(domain, |record| record.bytes)
    }

    /// Live bytes charged to allocations made by `thread`.
    pub fn thread_memory(&self, thread: NativeThreadId) -> u64 {
        lock!(self.state)
            .thread_bytes
            .get(&thread)
            .copied()
            .unwrap_or(0)
    }

    /// Zeroes the byte counter of `domain` and forgets its outstanding charges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DomainNotFound`] for an unknown domain.
    pub fn reset_counters(&self, domain: DomainId) -> Result<()> {
        let mut state = lock!(self.state);
        let Some(record) = state.domains.get_mut(&domain) else {
            log::warn!("counter reset for unknown domain {}", domain);
            return Err(Error::DomainNotFound(domain));
        };
        record.bytes = 0;

        let forgotten: Vec<(u64, Charge)> = state
            .ledger
            .iter()
            .filter(|(_, charge)| charge.domain == Some(domain))
            .map(|(address, charge)| (*address, *charge))
            .collect();
        for (address, charge) in forgotten {
            state.ledger.remove(&address);
            let bytes = charge.bytes;
            state.credit(Charge { domain: None, ..charge }, bytes);
        }
        Ok(())
    }

    /// Number of forced unloads so far.
    pub fn zombie_count(&self) -> u64 {
        self.zombies.load(Ordering::Acquire)
    }

    /// Number of live domains.
    pub fn domain_count(&self) -> usize {
        lock!(self.state).domains.len()
    }

    /// Ids of all live domains, in ascending order.
    pub fn domains(&self) -> Vec<DomainId> {
        let mut ids: Vec<DomainId> = lock!(self.state).domains.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Memory admission check for `bytes` more on behalf of `thread`.
    ///
    /// Threads without a domain are always admitted. Denials are posted as
    /// [`HostEventKind::OutOfMemory`].
    pub fn on_memory_acquiring(&self, thread: NativeThreadId, bytes: u64) -> bool {
        let limit = self.limits.max_bytes_per_domain;
        if limit == 0 {
            return true;
        }

        let denied = {
            let state = lock!(self.state);
            state.bindings.get(&thread).and_then(|domain| {
                let record = state.domains.get(domain)?;
                (record.bytes.saturating_add(bytes) > limit).then_some(*domain)
            })
        };

        match denied {
            Some(domain) => {
                log::debug!(
                    "domain {} denied {} bytes to {} (limit {})",
                    domain,
                    bytes,
                    thread,
                    limit
                );
                self.events.post(HostEvent::new(
                    HostEventKind::OutOfMemory,
                    domain,
                    Some(thread),
                ));
                false
            }
            None => true,
        }
    }

    /// Charges `bytes` at `address` to `thread` and its domain.
    ///
    /// Charging an address that already has an entry grows that entry; the bytes go to the
    /// domain the entry was first charged to.
    pub fn on_memory_acquire(&self, thread: NativeThreadId, bytes: u64, address: u64) {
        let mut state = lock!(self.state);
        let domain = state.bindings.get(&thread).copied();
        let charge = state.ledger.entry(address).or_insert(Charge {
            domain,
            thread,
            bytes: 0,
        });
        charge.bytes += bytes;
        let charge = *charge;

        if let Some(record) = charge.domain.and_then(|id| state.domains.get_mut(&id)) {
            record.bytes += bytes;
        }
        *state.thread_bytes.entry(charge.thread).or_insert(0) += bytes;
    }

    /// Releases everything charged at `address`. Returns the bytes released.
    ///
    /// Unknown addresses release nothing.
    pub fn on_memory_release(&self, address: u64) -> u64 {
        let mut state = lock!(self.state);
        match state.ledger.remove(&address) {
            Some(charge) => {
                state.credit(charge, charge.bytes);
                charge.bytes
            }
            None => 0,
        }
    }

    /// Releases up to `bytes` of the charge at `address`. Returns the bytes released.
    pub fn on_memory_release_partial(&self, address: u64, bytes: u64) -> u64 {
        let mut state = lock!(self.state);
        let Some(charge) = state.ledger.get_mut(&address) else {
            return 0;
        };
        let released = bytes.min(charge.bytes);
        charge.bytes -= released;
        let snapshot = *charge;
        if snapshot.bytes == 0 {
            state.ledger.remove(&address);
        }
        state.credit(snapshot, released);
        released
    }

    fn with_domain<T>(&self, domain: DomainId, f: impl FnOnce(&DomainRecord) -> T) -> Result<T> {
        match lock!(self.state).domains.get(&domain) {
            Some(record) => Ok(f(record)),
            None => {
                log::warn!("lookup of unknown domain {}", domain);
                Err(Error::DomainNotFound(domain))
            }
        }
    }
}

impl fmt::Debug for DomainRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock!(self.state);
        f.debug_struct("DomainRegistry")
            .field("domains", &state.domains.len())
            .field("bindings", &state.bindings.len())
            .field("default_domain", &state.default_domain)
            .field("zombies", &self.zombie_count())
            .finish()
    }
}
