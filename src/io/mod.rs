//! I/O completion scheduling and the work-item pool.
//!
//! [`IoCompletionManager`] owns a table of completion ports, each drained by an elastic set of
//! worker threads that hand every [`Completion`] to a single [`CompletionCallback`].
//! [`WorkerPoolManager`] runs the runtime's fire-and-forget work items on a `rayon` pool.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hostrt::io::{CompletionCallback, IoCompletionManager, ResourceId};
//! use hostrt::host::IoConfig;
//!
//! struct Print;
//!
//! impl CompletionCallback for Print {
//!     fn on_complete(&self, error_code: u32, bytes: usize, context: u64) {
//!         println!("{context:#x}: {bytes} bytes, error {error_code}");
//!     }
//! }
//!
//! let io = IoCompletionManager::new(IoConfig::default());
//! io.set_completion_callback(Arc::new(Print));
//! let sink = io.bind(None, ResourceId(1))?;
//! sink.post(0, 4096, 0x10)?;
//! # Ok::<(), hostrt::Error>(())
//! ```

mod manager;
mod port;
mod threadpool;

pub use manager::{CompletionCallback, IoCompletionManager};
pub use port::{Completion, CompletionSink, PortId, ResourceId};
pub use threadpool::WorkerPoolManager;
