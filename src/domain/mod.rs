//! Logical execution domains.
//!
//! A domain is an isolated execution context inside the host process: a set of native threads,
//! one of which is the domain's main thread, plus the memory those threads allocated. The
//! [`DomainRegistry`] is the authority on which thread belongs to which domain and on each
//! domain's live thread and byte counts.
//!
//! # Key Components
//!
//! - [`DomainId`] - Identifier assigned by the embedding runtime
//! - [`DomainManager`] - Per-domain capability notified when the main thread exits
//! - [`DomainRegistry`] - Domain records, thread bindings and the allocation ledger
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use hostrt::domain::{DomainId, DomainManager, DomainRegistry};
//! use hostrt::host::HostEventQueue;
//! use hostrt::thread::NativeThreadId;
//! use hostrt::DomainLimits;
//!
//! struct Quiet;
//! impl DomainManager for Quiet {
//!     fn on_main_thread_exit(&self, _domain: DomainId, _is_empty: bool) {}
//! }
//!
//! let registry = DomainRegistry::new(DomainLimits::default(), Arc::new(HostEventQueue::new()));
//! let main = NativeThreadId::current();
//! registry.create_domain(DomainId(1), main, Arc::new(Quiet))?;
//! assert_eq!(registry.thread_count(DomainId(1))?, 1);
//! assert!(!registry.is_snippet_thread(main));
//! # Ok::<(), hostrt::Error>(())
//! ```

mod registry;

pub use registry::DomainRegistry;

/// Identifier of a logical execution domain, unique among live domains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u32);

impl DomainId {
    /// Returns the raw numeric ID value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The embedding runtime's per-domain manager.
///
/// The registry holds one shared reference per domain and drops it when the domain record is
/// removed.
pub trait DomainManager: Send + Sync {
    /// Called after the domain's main thread was released.
    ///
    /// `is_empty` is `true` when no other thread of the domain is still bound. Invoked without
    /// any registry lock held, so the manager may call back into the host.
    fn on_main_thread_exit(&self, domain: DomainId, is_empty: bool);
}
