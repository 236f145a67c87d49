//! Runtime lifecycle events.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use strum::Display;

use crate::domain::{DomainId, DomainRegistry};

/// An event the runtime reports to the host.
#[derive(Clone, Debug, PartialEq, Eq, Display)]
pub enum RuntimeEvent {
    /// A domain finished unloading.
    DomainUnload(DomainId),
    /// The runtime disabled itself after a fatal error.
    ClrDisabled,
    /// A managed debugging assistant fired.
    MdaFired {
        /// Short description.
        caption: String,
        /// Full message.
        message: String,
        /// Managed stack at the point it fired.
        stack_trace: String,
    },
    /// A thread overflowed its stack. Escalation is left to the policy table.
    StackOverflow,
}

/// Receives [`RuntimeEvent`]s.
///
/// Domain unloads are forwarded to the domain registry; everything else is logged.
pub struct RuntimeEventManager {
    domains: Arc<DomainRegistry>,
    events: AtomicU64,
    disabled: AtomicU64,
}

impl RuntimeEventManager {
    /// Creates a manager forwarding unloads to `domains`.
    #[must_use]
    pub fn new(domains: Arc<DomainRegistry>) -> Self {
        Self {
            domains,
            events: AtomicU64::new(0),
            disabled: AtomicU64::new(0),
        }
    }

    /// Handles one runtime event.
    pub fn on_event(&self, event: RuntimeEvent) {
        self.events.fetch_add(1, Ordering::Relaxed);
        match event {
            RuntimeEvent::DomainUnload(domain) => {
                log::debug!("runtime event: domain {} unloaded", domain);
                self.domains.on_domain_unload(domain);
            }
            RuntimeEvent::ClrDisabled => {
                self.disabled.fetch_add(1, Ordering::Relaxed);
                log::error!("runtime event: runtime disabled");
            }
            RuntimeEvent::MdaFired {
                caption,
                message,
                stack_trace,
            } => {
                log::debug!("runtime event: MDA fired: {}, {}", caption, message);
                log::info!("stack trace: {}", stack_trace);
            }
            RuntimeEvent::StackOverflow => {
                log::warn!("runtime event: stack overflow");
            }
        }
    }

    /// Events handled so far.
    pub fn event_count(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// True once the runtime reported itself disabled.
    pub fn runtime_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::{
        host::{DomainLimits, HostEventKind, HostEventQueue},
        test::NoopManager,
        thread::NativeThreadId,
    };

    #[test]
    fn test_domain_unload_forwarded() {
        let events = Arc::new(HostEventQueue::new());
        let domains = Arc::new(DomainRegistry::new(DomainLimits::default(), events.clone()));
        domains
            .create_domain(DomainId(4), NativeThreadId::current(), Arc::new(NoopManager))
            .unwrap();

        let manager = RuntimeEventManager::new(domains.clone());
        manager.on_event(RuntimeEvent::DomainUnload(DomainId(4)));
        assert_eq!(domains.domain_count(), 0);

        let event = events.poll(Some(Duration::ZERO)).unwrap();
        assert_eq!(event.kind, HostEventKind::DomainUnloaded);
        assert_eq!(event.domain, DomainId(4));
    }

    #[test]
    fn test_other_events_logged() {
        let domains = Arc::new(DomainRegistry::new(
            DomainLimits::default(),
            Arc::new(HostEventQueue::new()),
        ));
        let manager = RuntimeEventManager::new(domains);
        manager.on_event(RuntimeEvent::MdaFired {
            caption: "caption".into(),
            message: "message".into(),
            stack_trace: "at Main()".into(),
        });
        assert!(!manager.runtime_disabled());
        manager.on_event(RuntimeEvent::ClrDisabled);
        assert!(manager.runtime_disabled());
        assert_eq!(manager.event_count(), 2);
    }
}
