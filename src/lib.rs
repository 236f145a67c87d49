// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
// - 'assembly/stream.rs' uses mmap to map assembly images into memory

//! # hostrt
//!
//! A runtime host: the layer a managed-code execution engine calls instead of the operating
//! system for threads, locks, memory, I/O completion and assembly loading. Routing those
//! requests through the host lets it enforce per-domain resource caps, account every thread
//! and byte to the domain that owns it, and refuse waits that can never finish.
//!
//! ## Features
//!
//! - **Domain isolation** - Threads and bytes are charged to logical execution domains, with
//!   admission caps enforced before a resource is handed out
//! - **Host-managed tasks** - Threads are created suspended, bound to their domain, and tracked
//!   in a registry until they exit
//! - **Deadlock detection** - Monitor waits walk the wait graph on contention and fail with the
//!   offending cycle instead of hanging
//! - **Memory accounting** - Heap and virtual allocations are admitted against domain budgets,
//!   with a critical-level escape hatch for the runtime's own allocations
//! - **Elastic I/O workers** - Completion ports drained by a pool that grows on saturation and
//!   shrinks when idle, never below one worker per live port
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use hostrt::{DomainLimits, HostConfig, HostControl};
//! use hostrt::domain::{DomainId, DomainManager};
//!
//! struct Logging;
//!
//! impl DomainManager for Logging {
//!     fn on_main_thread_exit(&self, domain: DomainId, is_empty: bool) {
//!         println!("domain {domain} main thread exited (empty: {is_empty})");
//!     }
//! }
//!
//! let host = HostControl::new(HostConfig {
//!     limits: DomainLimits::new().with_max_threads_per_domain(4),
//!     ..Default::default()
//! })?;
//! host.set_domain_manager(DomainId(1), Arc::new(Logging))?;
//!
//! let task = host.tasks().create_task(0, || println!("hello from the domain"))?;
//! task.start()?;
//! task.join(None, Default::default())?;
//! # Ok::<(), hostrt::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`domain`] - The domain registry: bindings, caps and per-domain accounting
//! - [`thread`] - The task registry and per-thread control blocks
//! - [`sync`] - Critical sections, events, semaphores and the deadlock detector
//! - [`memory`] - Heaps, virtual memory and collector notifications
//! - [`io`] - Completion ports and the work-item pool
//! - [`assembly`] - The host assembly store
//! - [`host`] - Configuration, events, escalation policy and [`HostControl`]
//!
//! No registry holds its own lock while calling into another registry or into the embedding
//! runtime.
//!
//! ## Logging
//!
//! All diagnostics go through the [`log`] facade. Admission denials are logged at `debug`,
//! lookups of unknown objects at `warn`, deadlocks and OS failures at `error`.

#[macro_use]
pub(crate) mod macros;

pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use hostrt::prelude::*;
///
/// let host = HostControl::new(HostConfig::default())?;
/// let event = host.sync().create_manual_event(true);
/// assert_eq!(event.wait(None, WaitOptions::empty()), WaitOutcome::Signaled);
/// # Ok::<(), hostrt::Error>(())
/// ```
pub mod prelude;

/// Assembly images served by the host.
pub mod assembly;

/// Logical execution domains.
pub mod domain;

/// Host context, configuration, events and escalation policy.
pub mod host;

/// Completion ports and the work-item pool.
pub mod io;

/// Memory accounting.
pub mod memory;

/// Host-managed locks, events and deadlock detection.
pub mod sync;

/// Tasks and native threads.
pub mod thread;

/// `hostrt` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `hostrt` Error type
///
/// Every fallible host operation returns this. Deadlocks and timeouts are not errors; they are
/// reported as [`sync::WaitOutcome`] values.
///
/// # Examples
///
/// ```rust
/// use hostrt::{Error, HostConfig, HostControl};
/// use hostrt::domain::DomainId;
///
/// let host = HostControl::new(HostConfig::default())?;
/// match host.thread_count(DomainId(7)) {
///     Ok(count) => println!("{count} threads"),
///     Err(Error::DomainNotFound(id)) => println!("no domain {id}"),
///     Err(e) => println!("Error: {}", e),
/// }
/// # Ok::<(), hostrt::Error>(())
/// ```
pub use error::Error;

/// Main entry point.
///
/// See [`host::HostControl`].
pub use host::HostControl;

/// Host configuration types.
pub use host::{DeadlockConfig, DomainLimits, HostConfig, IoConfig, LockTraceConfig};
