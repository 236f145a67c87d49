//! Failure escalation.
//!
//! The embedding runtime decides what to do when a resource fails, an operation overruns, or a
//! thread is rudely aborted, based on a table the host hands it at startup. [`EscalationPolicy`]
//! is that table and [`RuntimePolicy`] is the runtime's side of the handoff. When the runtime
//! later acts on the table it reports back through [`PolicyManager`].

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use strum::{Display, EnumCount, EnumIter};

use crate::{domain::DomainRegistry, Result};

/// Failure kinds the runtime can escalate.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter, EnumCount,
)]
pub enum ClrFailure {
    /// A resource outside a critical region could not be allocated.
    NonCriticalResource,
    /// A resource inside a critical region could not be allocated.
    CriticalResource,
    /// The runtime itself failed.
    FatalRuntime,
    /// A thread exited while holding a lock.
    OrphanedLock,
    /// A thread overflowed its stack.
    StackOverflow,
    /// An access violation in managed code.
    AccessViolation,
    /// A code contract was violated.
    CodeContract,
}

/// Operations whose duration or outcome the policy governs.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter, EnumCount,
)]
pub enum ClrOperation {
    /// Aborting a thread.
    ThreadAbort,
    /// Rudely aborting a thread outside a critical region.
    ThreadRudeAbortInNonCriticalRegion,
    /// Rudely aborting a thread inside a critical region.
    ThreadRudeAbortInCriticalRegion,
    /// Unloading a domain.
    AppDomainUnload,
    /// Rudely unloading a domain.
    AppDomainRudeUnload,
    /// Process shutdown.
    ProcessExit,
    /// Running finalizers.
    FinalizerRun,
}

/// What the runtime does when a policy entry fires.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter, EnumCount,
)]
pub enum PolicyAction {
    /// Nothing.
    NoAction,
    /// Raise an exception on the failing thread.
    ThrowException,
    /// Abort the thread, running its cleanup.
    AbortThread,
    /// Abort the thread without cleanup.
    RudeAbortThread,
    /// Unload the domain, running its cleanup.
    UnloadAppDomain,
    /// Unload the domain without cleanup.
    RudeUnloadAppDomain,
    /// Exit the process, running cleanup.
    ExitProcess,
    /// Exit the process, skipping finalizers.
    FastExitProcess,
    /// Exit the process without any cleanup.
    RudeExitProcess,
    /// Disable the runtime.
    DisableRuntime,
}

/// Who decides what an unhandled exception does.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum UnhandledExceptionPolicy {
    /// The runtime's own behavior: the process goes down.
    RuntimeDetermined,
    /// The host contains it at domain level.
    #[default]
    HostDetermined,
}

/// A timeout entry, optionally with the action taken when it expires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationTimeout {
    /// How long the operation may take.
    pub timeout: Duration,
    /// Escalation once it has taken longer, if any.
    pub action: Option<PolicyAction>,
}

/// How long a thread abort may take before it is escalated.
pub const THREAD_ABORT_TIMEOUT: Duration = Duration::from_secs(20);

/// How long a domain unload may take before it is escalated.
pub const APPDOMAIN_UNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// The runtime's policy configuration surface.
///
/// Implemented by the embedding side; [`EscalationPolicy::apply`] drives it.
pub trait RuntimePolicy {
    /// Map a failure kind to an action.
    fn set_action_on_failure(&self, failure: ClrFailure, action: PolicyAction) -> Result<()>;
    /// Set an operation timeout.
    fn set_timeout(&self, operation: ClrOperation, timeout: Duration) -> Result<()>;
    /// Set an operation timeout and the action taken when it expires.
    fn set_timeout_and_action(
        &self,
        operation: ClrOperation,
        timeout: Duration,
        action: PolicyAction,
    ) -> Result<()>;
    /// Set the action taken for an operation regardless of timing.
    fn set_default_action(&self, operation: ClrOperation, action: PolicyAction) -> Result<()>;
    /// Set who handles unhandled exceptions.
    fn set_unhandled_exception_policy(&self, policy: UnhandledExceptionPolicy) -> Result<()>;
}

/// The escalation table.
///
/// The default table contains failures to the domain wherever the runtime allows it:
///
/// | Entry | Action |
/// |-------|--------|
/// | `NonCriticalResource` failure | `ThrowException` |
/// | `CriticalResource` failure | `UnloadAppDomain` |
/// | `OrphanedLock` failure | `UnloadAppDomain` |
/// | `FatalRuntime` failure | `RudeExitProcess` |
/// | `StackOverflow` failure | `RudeUnloadAppDomain` |
/// | `ThreadAbort` after [`THREAD_ABORT_TIMEOUT`] | `RudeAbortThread` |
/// | `FinalizerRun` | half of [`THREAD_ABORT_TIMEOUT`] |
/// | `AppDomainUnload` after [`APPDOMAIN_UNLOAD_TIMEOUT`] | `RudeUnloadAppDomain` |
/// | `ThreadRudeAbortInCriticalRegion` | `RudeUnloadAppDomain` |
/// | Unhandled exceptions | `HostDetermined` |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalationPolicy {
    failures: BTreeMap<ClrFailure, PolicyAction>,
    timeouts: BTreeMap<ClrOperation, OperationTimeout>,
    default_actions: BTreeMap<ClrOperation, PolicyAction>,
    unhandled_exception: Option<UnhandledExceptionPolicy>,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::empty()
            .with_failure_action(ClrFailure::NonCriticalResource, PolicyAction::ThrowException)
            .with_failure_action(ClrFailure::CriticalResource, PolicyAction::UnloadAppDomain)
            .with_failure_action(ClrFailure::OrphanedLock, PolicyAction::UnloadAppDomain)
            .with_failure_action(ClrFailure::FatalRuntime, PolicyAction::RudeExitProcess)
            .with_failure_action(ClrFailure::StackOverflow, PolicyAction::RudeUnloadAppDomain)
            .with_timeout(
                ClrOperation::ThreadAbort,
                THREAD_ABORT_TIMEOUT,
                Some(PolicyAction::RudeAbortThread),
            )
            .with_timeout(ClrOperation::FinalizerRun, THREAD_ABORT_TIMEOUT / 2, None)
            .with_timeout(
                ClrOperation::AppDomainUnload,
                APPDOMAIN_UNLOAD_TIMEOUT,
                Some(PolicyAction::RudeUnloadAppDomain),
            )
            .with_default_action(
                ClrOperation::ThreadRudeAbortInCriticalRegion,
                PolicyAction::RudeUnloadAppDomain,
            )
            .with_unhandled_exception_policy(UnhandledExceptionPolicy::HostDetermined)
    }
}

impl EscalationPolicy {
    /// A table with no entries; the runtime keeps its own defaults for everything.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            failures: BTreeMap::new(),
            timeouts: BTreeMap::new(),
            default_actions: BTreeMap::new(),
            unhandled_exception: None,
        }
    }

    /// Sets the action for a failure kind.
    #[must_use]
    pub fn with_failure_action(mut self, failure: ClrFailure, action: PolicyAction) -> Self {
        self.failures.insert(failure, action);
        self
    }

    /// Sets an operation timeout with an optional expiry action.
    #[must_use]
    pub fn with_timeout(
        mut self,
        operation: ClrOperation,
        timeout: Duration,
        action: Option<PolicyAction>,
    ) -> Self {
        self.timeouts
            .insert(operation, OperationTimeout { timeout, action });
        self
    }

    /// Sets the default action for an operation.
    #[must_use]
    pub fn with_default_action(mut self, operation: ClrOperation, action: PolicyAction) -> Self {
        self.default_actions.insert(operation, action);
        self
    }

    /// Sets the unhandled exception policy.
    #[must_use]
    pub fn with_unhandled_exception_policy(mut self, policy: UnhandledExceptionPolicy) -> Self {
        self.unhandled_exception = Some(policy);
        self
    }

    /// Action configured for `failure`.
    pub fn action_on_failure(&self, failure: ClrFailure) -> Option<PolicyAction> {
        self.failures.get(&failure).copied()
    }

    /// Timeout configured for `operation`.
    pub fn timeout(&self, operation: ClrOperation) -> Option<OperationTimeout> {
        self.timeouts.get(&operation).copied()
    }

    /// Default action configured for `operation`.
    pub fn default_action(&self, operation: ClrOperation) -> Option<PolicyAction> {
        self.default_actions.get(&operation).copied()
    }

    /// Configured unhandled exception policy.
    pub fn unhandled_exception_policy(&self) -> Option<UnhandledExceptionPolicy> {
        self.unhandled_exception
    }

    /// Number of entries in the table.
    pub fn len(&self) -> usize {
        self.failures.len()
            + self.timeouts.len()
            + self.default_actions.len()
            + usize::from(self.unhandled_exception.is_some())
    }

    /// True if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands every entry to `runtime`.
    ///
    /// A rejected entry is logged and the rest are still applied.
    ///
    /// # Errors
    ///
    /// Returns the first rejection once every entry has been tried.
    pub fn apply(&self, runtime: &dyn RuntimePolicy) -> Result<()> {
        let mut first_error = None;
        let mut record = |what: String, result: Result<()>| {
            if let Err(error) = result {
                log::error!("escalation policy rejected {}: {}", what, error);
                first_error.get_or_insert(error);
            }
        };

        for (&failure, &action) in &self.failures {
            record(
                format!("failure {} -> {}", failure, action),
                runtime.set_action_on_failure(failure, action),
            );
        }
        for (&operation, entry) in &self.timeouts {
            let result = match entry.action {
                Some(action) => runtime.set_timeout_and_action(operation, entry.timeout, action),
                None => runtime.set_timeout(operation, entry.timeout),
            };
            record(format!("timeout for {}", operation), result);
        }
        for (&operation, &action) in &self.default_actions {
            record(
                format!("default action {} -> {}", operation, action),
                runtime.set_default_action(operation, action),
            );
        }
        if let Some(policy) = self.unhandled_exception {
            record(
                format!("unhandled exception policy {}", policy),
                runtime.set_unhandled_exception_policy(policy),
            );
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Receives the runtime's reports of escalations it carried out.
///
/// Only a rude domain unload has a host side effect: the domain registry counts a zombie.
pub struct PolicyManager {
    domains: Arc<DomainRegistry>,
    notifications: AtomicU64,
}

impl PolicyManager {
    /// Creates a manager reporting into `domains`.
    #[must_use]
    pub fn new(domains: Arc<DomainRegistry>) -> Self {
        Self {
            domains,
            notifications: AtomicU64::new(0),
        }
    }

    /// The runtime took the default action for `operation`.
    pub fn on_default_action(&self, operation: ClrOperation, action: PolicyAction) {
        log::debug!("policy default action: {} -> {}", operation, action);
        self.escalated(action);
    }

    /// `operation` timed out and the runtime took `action`.
    pub fn on_timeout(&self, operation: ClrOperation, action: PolicyAction) {
        log::debug!("policy timeout: {} -> {}", operation, action);
        self.escalated(action);
    }

    /// `failure` occurred and the runtime took `action`.
    pub fn on_failure(&self, failure: ClrFailure, action: PolicyAction) {
        log::debug!("policy failure: {} -> {}", failure, action);
        self.escalated(action);
    }

    /// Notifications received so far.
    pub fn notification_count(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }

    fn escalated(&self, action: PolicyAction) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
        if action == PolicyAction::RudeUnloadAppDomain {
            self.domains.on_domain_rude_unload();
        }
    }
}
