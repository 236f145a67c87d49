//! The host context.
//!
//! [`HostControl`] builds every manager once, wires them together by shared [`Arc`], and hands
//! them to the embedding runtime on request. The runtime asks for a manager by
//! [`ManagerKind`]; kinds left out of [`HostConfig::managers`] are refused, and the runtime
//! falls back to its own implementation of that concern.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use hostrt::{HostConfig, HostControl};
//! use hostrt::domain::{DomainId, DomainManager};
//! use hostrt::host::{ManagerKind, ManagerSet};
//!
//! struct Quiet;
//!
//! impl DomainManager for Quiet {
//!     fn on_main_thread_exit(&self, _domain: DomainId, _is_empty: bool) {}
//! }
//!
//! let config = HostConfig::default().with_managers(ManagerSet::TASK | ManagerSet::SYNC);
//! let host = HostControl::new(config)?;
//! assert!(host.host_manager(ManagerKind::Task).is_some());
//! assert!(host.host_manager(ManagerKind::Memory).is_none());
//!
//! host.set_domain_manager(DomainId(1), Arc::new(Quiet))?;
//! assert_eq!(host.thread_count(DomainId(1))?, 1);
//! # Ok::<(), hostrt::Error>(())
//! ```

mod config;
mod events;
mod policy;
mod runtime;

pub use config::{
    DeadlockConfig, DomainLimits, HostConfig, IoConfig, LockTraceConfig, ManagerSet,
    WorkerPoolConfig,
};
pub use events::{HostEvent, HostEventKind, HostEventQueue};
pub use policy::{
    ClrFailure, ClrOperation, EscalationPolicy, OperationTimeout, PolicyAction, PolicyManager,
    RuntimePolicy, UnhandledExceptionPolicy, APPDOMAIN_UNLOAD_TIMEOUT, THREAD_ABORT_TIMEOUT,
};
pub use runtime::{RuntimeEvent, RuntimeEventManager};

use std::{fmt, sync::Arc, time::Duration};

use strum::{Display, EnumIter};

use crate::{
    assembly::AssemblyManager,
    domain::{DomainId, DomainManager, DomainRegistry},
    io::{IoCompletionManager, WorkerPoolManager},
    memory::{GcManager, MemoryManager},
    sync::SyncManager,
    thread::{NativeThreadId, TaskManager},
    Result,
};

/// The managers the runtime can ask the host for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum ManagerKind {
    /// [`TaskManager`]
    Task,
    /// [`SyncManager`]
    Sync,
    /// [`MemoryManager`]
    Memory,
    /// [`GcManager`]
    Gc,
    /// [`IoCompletionManager`]
    IoCompletion,
    /// [`WorkerPoolManager`]
    Threadpool,
    /// [`AssemblyManager`]
    Assembly,
    /// [`PolicyManager`]
    Policy,
    /// [`RuntimeEventManager`]
    Events,
}

impl ManagerKind {
    /// The [`ManagerSet`] bit enabling this kind.
    #[must_use]
    pub fn flag(self) -> ManagerSet {
        match self {
            ManagerKind::Task => ManagerSet::TASK,
            ManagerKind::Sync => ManagerSet::SYNC,
            ManagerKind::Memory => ManagerSet::MEMORY,
            ManagerKind::Gc => ManagerSet::GC,
            ManagerKind::IoCompletion => ManagerSet::IO_COMPLETION,
            ManagerKind::Threadpool => ManagerSet::THREADPOOL,
            ManagerKind::Assembly => ManagerSet::ASSEMBLY,
            ManagerKind::Policy => ManagerSet::POLICY,
            ManagerKind::Events => ManagerSet::EVENTS,
        }
    }
}

/// A manager handed out by [`HostControl::host_manager`].
#[derive(Clone)]
pub enum HostManager {
    /// Tasks and threads.
    Task(Arc<TaskManager>),
    /// Synchronization primitives.
    Sync(Arc<SyncManager>),
    /// Memory accounting.
    Memory(Arc<MemoryManager>),
    /// Collector notifications.
    Gc(Arc<GcManager>),
    /// Completion ports.
    IoCompletion(Arc<IoCompletionManager>),
    /// Work items.
    Threadpool(Arc<WorkerPoolManager>),
    /// Assembly store.
    Assembly(Arc<AssemblyManager>),
    /// Escalation notifications.
    Policy(Arc<PolicyManager>),
    /// Lifecycle events.
    Events(Arc<RuntimeEventManager>),
}

impl HostManager {
    /// Which kind this is.
    pub fn kind(&self) -> ManagerKind {
        match self {
            HostManager::Task(_) => ManagerKind::Task,
            HostManager::Sync(_) => ManagerKind::Sync,
            HostManager::Memory(_) => ManagerKind::Memory,
            HostManager::Gc(_) => ManagerKind::Gc,
            HostManager::IoCompletion(_) => ManagerKind::IoCompletion,
            HostManager::Threadpool(_) => ManagerKind::Threadpool,
            HostManager::Assembly(_) => ManagerKind::Assembly,
            HostManager::Policy(_) => ManagerKind::Policy,
            HostManager::Events(_) => ManagerKind::Events,
        }
    }
}

impl fmt::Debug for HostManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostManager({})", self.kind())
    }
}

/// Root of the host.
///
/// All managers share one [`DomainRegistry`] and one [`HostEventQueue`].
pub struct HostControl {
    config: HostConfig,
    events: Arc<HostEventQueue>,
    domains: Arc<DomainRegistry>,
    tasks: Arc<TaskManager>,
    sync: Arc<SyncManager>,
    memory: Arc<MemoryManager>,
    gc: Arc<GcManager>,
    io: Arc<IoCompletionManager>,
    worker_pool: Arc<WorkerPoolManager>,
    assemblies: Arc<AssemblyManager>,
    policy: Arc<PolicyManager>,
    runtime_events: Arc<RuntimeEventManager>,
}

impl HostControl {
    /// Builds a host from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if a lock trace file is configured and cannot be created.
    pub fn new(config: HostConfig) -> Result<Self> {
        let events = Arc::new(HostEventQueue::new());
        let domains = Arc::new(DomainRegistry::new(config.limits, events.clone()));
        let host = Self {
            tasks: TaskManager::new(domains.clone()),
            sync: Arc::new(SyncManager::new(config.deadlock, &config.lock_trace)?),
            memory: MemoryManager::new(domains.clone()),
            gc: Arc::new(GcManager::new()),
            io: Arc::new(IoCompletionManager::new(config.io)),
            worker_pool: Arc::new(WorkerPoolManager::new(config.worker_pool)),
            assemblies: Arc::new(AssemblyManager::new(config.assemblies.clone())),
            policy: Arc::new(PolicyManager::new(domains.clone())),
            runtime_events: Arc::new(RuntimeEventManager::new(domains.clone())),
            domains,
            events,
            config,
        };
        log::info!(
            "host started (managers {:?}, limits {:?})",
            host.config.managers,
            host.config.limits
        );
        Ok(host)
    }

    /// Returns the manager of `kind`, or `None` if that kind is not enabled.
    pub fn host_manager(&self, kind: ManagerKind) -> Option<HostManager> {
        if !self.config.managers.contains(kind.flag()) {
            log::debug!("manager {} not provided", kind);
            return None;
        }
        Some(match kind {
            ManagerKind::Task => HostManager::Task(self.tasks.clone()),
            ManagerKind::Sync => HostManager::Sync(self.sync.clone()),
            ManagerKind::Memory => HostManager::Memory(self.memory.clone()),
            ManagerKind::Gc => HostManager::Gc(self.gc.clone()),
            ManagerKind::IoCompletion => HostManager::IoCompletion(self.io.clone()),
            ManagerKind::Threadpool => HostManager::Threadpool(self.worker_pool.clone()),
            ManagerKind::Assembly => HostManager::Assembly(self.assemblies.clone()),
            ManagerKind::Policy => HostManager::Policy(self.policy.clone()),
            ManagerKind::Events => HostManager::Events(self.runtime_events.clone()),
        })
    }

    /// Hands the configured escalation table to the runtime.
    ///
    /// # Errors
    ///
    /// See [`EscalationPolicy::apply`].
    pub fn apply_escalation_policy(&self, runtime: &dyn RuntimePolicy) -> Result<()> {
        self.config.policy.apply(runtime)
    }

    /// Creates domain `domain` with the calling thread as its main thread.
    ///
    /// # Errors
    ///
    /// See [`DomainRegistry::create_domain`].
    pub fn set_domain_manager(
        &self,
        domain: DomainId,
        manager: Arc<dyn DomainManager>,
    ) -> Result<()> {
        self.domains
            .create_domain(domain, NativeThreadId::current(), manager)
    }

    /// Live threads of `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DomainNotFound`] for an unknown domain.
    pub fn thread_count(&self, domain: DomainId) -> Result<usize> {
        self.domains.thread_count(domain)
    }

    /// Live bytes charged to `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DomainNotFound`] for an unknown domain.
    pub fn memory_usage(&self, domain: DomainId) -> Result<u64> {
        self.domains.memory_usage(domain)
    }

    /// Domains unloaded rudely so far.
    pub fn zombie_count(&self) -> u64 {
        self.domains.zombie_count()
    }

    /// Zeroes the byte counter of `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DomainNotFound`] for an unknown domain.
    pub fn reset_counters(&self, domain: DomainId) -> Result<()> {
        self.domains.reset_counters(domain)
    }

    /// Asks the embedding side to unload `domain`. Returns `false` if an identical request is
    /// already queued.
    pub fn unload_domain(&self, domain: DomainId) -> bool {
        log::info!("unload requested for domain {}", domain);
        self.events
            .post(HostEvent::new(HostEventKind::UnloadRequested, domain, None))
    }

    /// Takes the next host event, waiting up to `timeout` (forever when `None`).
    pub fn poll_event(&self, timeout: Option<Duration>) -> Option<HostEvent> {
        self.events.poll(timeout)
    }

    /// Closes every completion port, waits up to `timeout` for their workers, and flushes the
    /// lock trace. Returns `true` if every worker exited in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let clean = self.io.shutdown(timeout);
        self.sync.lock_trace().flush();
        log::info!("host shut down{}", if clean { "" } else { " (workers still running)" });
        clean
    }

    /// The configuration the host was built with.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The host event channel.
    pub fn events(&self) -> &Arc<HostEventQueue> {
        &self.events
    }

    /// The domain registry.
    pub fn domains(&self) -> &Arc<DomainRegistry> {
        &self.domains
    }

    /// The task registry.
    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// The synchronization factory.
    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    /// The memory manager.
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// The collector notification sink.
    pub fn gc(&self) -> &Arc<GcManager> {
        &self.gc
    }

    /// The completion port scheduler.
    pub fn io(&self) -> &Arc<IoCompletionManager> {
        &self.io
    }

    /// The work-item pool.
    pub fn worker_pool(&self) -> &Arc<WorkerPoolManager> {
        &self.worker_pool
    }

    /// The assembly manager.
    pub fn assemblies(&self) -> &Arc<AssemblyManager> {
        &self.assemblies
    }

    /// The escalation notification sink.
    pub fn policy(&self) -> &Arc<PolicyManager> {
        &self.policy
    }

    /// The runtime event sink.
    pub fn runtime_events(&self) -> &Arc<RuntimeEventManager> {
        &self.runtime_events
    }
}

impl fmt::Debug for HostControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostControl")
            .field("managers", &self.config.managers)
            .field("domains", &self.domains.domain_count())
            .field("tasks", &self.tasks.task_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    use crate::{test::NoopManager, Error};

    #[test]
    fn test_every_manager_by_default() {
        let host = HostControl::new(HostConfig::default()).unwrap();
        for kind in ManagerKind::iter() {
            let manager = host.host_manager(kind).unwrap();
            assert_eq!(manager.kind(), kind);
        }
    }

    #[test]
    fn test_disabled_managers_refused() {
        let host =
            HostControl::new(HostConfig::default().with_managers(ManagerSet::MEMORY)).unwrap();
        assert!(host.host_manager(ManagerKind::Memory).is_some());
        assert!(host.host_manager(ManagerKind::Task).is_none());
        assert!(host.host_manager(ManagerKind::IoCompletion).is_none());
    }

    #[test]
    fn test_domain_introspection() {
        let host = HostControl::new(HostConfig::default()).unwrap();
        host.set_domain_manager(DomainId(1), Arc::new(NoopManager)).unwrap();
        assert_eq!(host.thread_count(DomainId(1)).unwrap(), 1);
        assert_eq!(host.memory_usage(DomainId(1)).unwrap(), 0);
        assert!(matches!(
            host.set_domain_manager(DomainId(1), Arc::new(NoopManager)),
            Err(Error::DomainExists(DomainId(1)))
        ));
        assert!(matches!(
            host.thread_count(DomainId(9)),
            Err(Error::DomainNotFound(DomainId(9)))
        ));
    }

    #[test]
    fn test_unload_request_deduplicated() {
        let host = HostControl::new(HostConfig::default()).unwrap();
        assert!(host.unload_domain(DomainId(2)));
        assert!(!host.unload_domain(DomainId(2)));

        let event = host.poll_event(Some(Duration::ZERO)).unwrap();
        assert_eq!(event.kind, HostEventKind::UnloadRequested);
        assert_eq!(event.domain, DomainId(2));
        assert!(host.poll_event(Some(Duration::from_millis(10))).is_none());
    }

    #[test]
    fn test_policy_rude_unload_reaches_registry() {
        let host = HostControl::new(HostConfig::default()).unwrap();
        host.policy()
            .on_failure(ClrFailure::StackOverflow, PolicyAction::RudeUnloadAppDomain);
        assert_eq!(host.zombie_count(), 1);
    }

    #[test]
    fn test_shutdown_without_ports() {
        let host = HostControl::new(HostConfig::default()).unwrap();
        assert!(host.shutdown(Duration::from_secs(1)));
    }
}
