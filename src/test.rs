use std::sync::Arc;

use crate::{
    domain::{DomainId, DomainManager, DomainRegistry},
    host::{DomainLimits, HostEventQueue},
    thread::NativeThreadId,
};

/// Domain manager that ignores every notification.
pub struct NoopManager;

impl DomainManager for NoopManager {
    fn on_main_thread_exit(&self, _domain: DomainId, _is_empty: bool) {}
}

/// A registry whose domain 1 has the calling thread as its main thread.
pub fn registry_with_domain(limits: DomainLimits) -> (Arc<DomainRegistry>, Arc<HostEventQueue>) {
    let events = Arc::new(HostEventQueue::new());
    let domains = Arc::new(DomainRegistry::new(limits, events.clone()));
    domains
        .create_domain(DomainId(1), NativeThreadId::current(), Arc::new(NoopManager))
        .unwrap();
    (domains, events)
}
