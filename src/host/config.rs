//! Host configuration types.
//!
//! # Overview
//!
//! Configuration is organized into several small structures, aggregated by [`HostConfig`]:
//!
//! - [`DomainLimits`] - Per-domain thread and memory caps
//! - [`DeadlockConfig`] - Backoff schedule of the deadlock-aware monitor wait
//! - [`IoConfig`] - Completion port table size and worker pool bounds
//! - [`WorkerPoolConfig`] - Size of the work-item thread pool
//! - [`LockTraceConfig`] - Lock-order tracing sink
//!
//! Caps use `0` to mean "unlimited".
//!
//! # Configuration Presets
//!
//! - [`HostConfig::sandboxed()`] - Tight caps for running untrusted code
//! - [`HostConfig::unrestricted()`] - No caps, only accounting
//!
//! # Example
//!
//! ```rust
//! use hostrt::{DomainLimits, HostConfig};
//!
//! let config = HostConfig {
//!     limits: DomainLimits::new()
//!         .with_max_threads_per_domain(8)
//!         .with_max_bytes_per_domain(64 * 1024 * 1024),
//!     ..Default::default()
//! };
//! assert_eq!(config.limits.max_threads_per_domain, 8);
//! ```

use std::{path::PathBuf, time::Duration};

use bitflags::bitflags;

use crate::{assembly::AssemblyInfo, host::EscalationPolicy};

bitflags! {
    /// The set of host managers the embedding runtime may look up.
    ///
    /// Lookups for a manager whose bit is cleared fail, and the runtime falls back to its own
    /// implementation of that concern.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ManagerSet: u32 {
        /// Task and thread management.
        const TASK = 0x001;
        /// Locks, events and semaphores.
        const SYNC = 0x002;
        /// Heap and virtual memory accounting.
        const MEMORY = 0x004;
        /// GC suspension notifications.
        const GC = 0x008;
        /// I/O completion ports.
        const IO_COMPLETION = 0x010;
        /// Work-item thread pool.
        const THREADPOOL = 0x020;
        /// Assembly store.
        const ASSEMBLY = 0x040;
        /// Escalation policy notifications.
        const POLICY = 0x080;
        /// Runtime lifecycle events.
        const EVENTS = 0x100;
    }
}

impl Default for ManagerSet {
    fn default() -> Self {
        ManagerSet::all()
    }
}

/// Top-level host configuration.
#[derive(Clone, Debug, Default)]
pub struct HostConfig {
    /// Per-domain resource caps.
    pub limits: DomainLimits,
    /// Monitor wait backoff schedule.
    pub deadlock: DeadlockConfig,
    /// Completion port scheduler settings.
    pub io: IoConfig,
    /// Work-item pool settings.
    pub worker_pool: WorkerPoolConfig,
    /// Lock-order tracing.
    pub lock_trace: LockTraceConfig,
    /// Escalation policy handed to the runtime at startup.
    pub policy: EscalationPolicy,
    /// Managers exposed through [`crate::HostControl::host_manager`].
    pub managers: ManagerSet,
    /// Assemblies served by the host assembly store.
    pub assemblies: Vec<AssemblyInfo>,
}

impl HostConfig {
    /// Creates a configuration with tight caps for untrusted code.
    ///
    /// - 16 threads per domain
    /// - 64 MB per domain
    /// - Lock tracing enabled in memory
    #[must_use]
    pub fn sandboxed() -> Self {
        Self {
            limits: DomainLimits::new()
                .with_max_threads_per_domain(16)
                .with_max_bytes_per_domain(64 * 1024 * 1024),
            lock_trace: LockTraceConfig::memory(),
            ..Default::default()
        }
    }

    /// Creates a configuration without any caps. Accounting still happens.
    #[must_use]
    pub fn unrestricted() -> Self {
        Self {
            limits: DomainLimits::unlimited(),
            ..Default::default()
        }
    }

    /// Sets the managers exposed to the runtime.
    #[must_use]
    pub fn with_managers(mut self, managers: ManagerSet) -> Self {
        self.managers = managers;
        self
    }

    /// Adds an assembly to the host store.
    #[must_use]
    pub fn with_assembly(mut self, assembly: AssemblyInfo) -> Self {
        self.assemblies.push(assembly);
        self
    }
}

/// Per-domain admission caps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainLimits {
    /// Maximum live threads per domain, main thread included. `0` is unlimited.
    pub max_threads_per_domain: usize,
    /// Maximum live bytes per domain. `0` is unlimited.
    pub max_bytes_per_domain: u64,
}

impl DomainLimits {
    /// Creates the default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates limits that never deny anything.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            max_threads_per_domain: 0,
            max_bytes_per_domain: 0,
        }
    }

    /// Sets the thread cap.
    #[must_use]
    pub fn with_max_threads_per_domain(mut self, max: usize) -> Self {
        self.max_threads_per_domain = max;
        self
    }

    /// Sets the memory cap in bytes.
    #[must_use]
    pub fn with_max_bytes_per_domain(mut self, max: u64) -> Self {
        self.max_bytes_per_domain = max;
        self
    }
}

impl Default for DomainLimits {
    fn default() -> Self {
        Self {
            max_threads_per_domain: 64,
            max_bytes_per_domain: 256 * 1024 * 1024,
        }
    }
}

/// Backoff schedule for the deadlock-aware monitor wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeadlockConfig {
    /// Length of the first wait slice before the wait graph is inspected.
    pub initial_slice: Duration,
    /// Upper bound for a single slice of an infinite wait.
    pub max_slice: Duration,
}

impl DeadlockConfig {
    /// Sets the first slice length.
    #[must_use]
    pub fn with_initial_slice(mut self, slice: Duration) -> Self {
        self.initial_slice = slice;
        self
    }

    /// Sets the slice cap used by infinite waits.
    #[must_use]
    pub fn with_max_slice(mut self, slice: Duration) -> Self {
        self.max_slice = slice;
        self
    }
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            initial_slice: Duration::from_millis(100),
            max_slice: Duration::from_secs(10),
        }
    }
}

/// Completion port scheduler configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoConfig {
    /// Maximum number of concurrently open ports.
    pub max_ports: usize,
    /// Pool size below which idle workers never retire.
    pub min_threads: usize,
    /// Total worker cap across all ports.
    pub max_threads: usize,
    /// How long a worker blocks on its port before reassessing retirement.
    pub poll_interval: Duration,
}

impl IoConfig {
    /// Sets the port table size.
    #[must_use]
    pub fn with_max_ports(mut self, max: usize) -> Self {
        self.max_ports = max;
        self
    }

    /// Sets the worker floor.
    #[must_use]
    pub fn with_min_threads(mut self, min: usize) -> Self {
        self.min_threads = min;
        self
    }

    /// Sets the worker cap.
    #[must_use]
    pub fn with_max_threads(mut self, max: usize) -> Self {
        self.max_threads = max;
        self
    }

    /// Sets the worker poll tick.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            max_ports: 16,
            min_threads: cpus,
            max_threads: cpus * 10,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Work-item thread pool configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of worker threads the pool is built with.
    pub max_threads: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { max_threads: 512 }
    }
}

/// Lock-order tracing configuration.
///
/// Tracing can be switched on and off at runtime through
/// [`LockTraceCollector::set_enabled`](crate::sync::LockTraceCollector::set_enabled); this only
/// sets the initial state and the output sink.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockTraceConfig {
    /// Whether tracing starts enabled.
    pub enabled: bool,
    /// NDJSON output file. Events are buffered in memory when unset.
    pub output_path: Option<PathBuf>,
    /// Cap on buffered events. `0` is unlimited.
    pub max_events: usize,
}

impl LockTraceConfig {
    /// Tracing into an in-memory buffer of up to 100,000 events.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            enabled: true,
            output_path: None,
            max_events: 100_000,
        }
    }

    /// Tracing into an NDJSON file.
    #[must_use]
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            enabled: true,
            output_path: Some(path.into()),
            max_events: 0,
        }
    }
}
