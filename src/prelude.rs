//! # hostrt Prelude
//!
//! The types an embedder touches first: the host context and its configuration, the identity
//! types shared by every registry, and the wait vocabulary.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all hostrt operations
pub use crate::Error;

/// The result type used throughout hostrt
pub use crate::Result;

// ================================================================================================
// Host Context and Configuration
// ================================================================================================

/// Root of the host
pub use crate::host::{HostControl, HostManager, ManagerKind};

/// Configuration
pub use crate::host::{
    DeadlockConfig, DomainLimits, HostConfig, IoConfig, LockTraceConfig, ManagerSet,
    WorkerPoolConfig,
};

/// Host event channel
pub use crate::host::{HostEvent, HostEventKind};

// ================================================================================================
// Domains and Tasks
// ================================================================================================

/// Domain identity and callbacks
pub use crate::domain::{DomainId, DomainManager, DomainRegistry};

/// Task registry
pub use crate::thread::{LogicalTask, NativeThreadId, Task, TaskManager, TaskPriority, TaskState};

// ================================================================================================
// Synchronization
// ================================================================================================

/// Wait vocabulary
pub use crate::sync::{Cookie, DeadlockReport, LockOwnerOracle, WaitOptions, WaitOutcome};

/// Primitives
pub use crate::sync::{AutoEvent, Crst, ManualEvent, MonitorEvent, Semaphore, SyncManager};

// ================================================================================================
// Memory and I/O
// ================================================================================================

/// Memory accounting
pub use crate::memory::{Allocator, HeapBlock, MallocFlags, MemoryCriticalLevel, MemoryManager};

/// Completion ports
pub use crate::io::{CompletionCallback, CompletionSink, IoCompletionManager, ResourceId};
