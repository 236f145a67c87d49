//! Lock-order tracing.
//!
//! When enabled, the collector remembers which monitor cookies each thread holds, in
//! acquisition order, and derives lock-order edges from them: acquiring `B` while holding `A`
//! records `A -> B`. Two locks seen in both orders are a latent deadlock even if no cycle has
//! formed yet; [`LockTraceCollector::inversions`] lists them.
//!
//! Events can additionally be streamed as NDJSON to a file, or buffered in memory.
//!
//! # Example
//!
//! ```rust
//! use hostrt::sync::{Cookie, LockTraceCollector};
//! use hostrt::thread::NativeThreadId;
//! use hostrt::LockTraceConfig;
//!
//! let trace = LockTraceCollector::new(&LockTraceConfig::memory())?;
//! let me = NativeThreadId::current();
//! trace.on_acquired(me, Cookie(1));
//! trace.on_acquired(me, Cookie(2));
//! assert_eq!(trace.lock_order(), vec![(Cookie(1), Cookie(2))]);
//! # Ok::<(), hostrt::Error>(())
//! ```

use std::{
    collections::{BTreeSet, VecDeque},
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    mem,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
};

use dashmap::DashMap;
use serde::Serialize;

use crate::{
    host::LockTraceConfig,
    sync::{Cookie, DeadlockReport},
    thread::NativeThreadId,
    Result,
};

/// A recorded lock event.
///
/// File output writes one event per line, tagged by `type`:
///
/// ```text
/// {"type":"acquired","thread":7,"cookie":"0x10","depth":1}
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockTraceEvent {
    /// A monitor wait succeeded.
    Acquired {
        /// The acquiring thread
        thread: NativeThreadId,
        /// The acquired lock
        cookie: Cookie,
        /// Number of locks the thread holds afterwards
        depth: usize,
    },
    /// A lock owner signaled its monitor.
    Released {
        /// The releasing thread
        thread: NativeThreadId,
        /// The released lock
        cookie: Cookie,
    },
    /// A deadlock was reported.
    Deadlock {
        /// Threads in wait order
        threads: Vec<NativeThreadId>,
        /// Locks in wait order
        cookies: Vec<Cookie>,
    },
}

/// Runtime-toggleable lock-order trace sink.
pub struct LockTraceCollector {
    enabled: AtomicBool,
    /// Locks each thread holds, oldest first.
    held: DashMap<NativeThreadId, Vec<Cookie>>,
    /// `A -> {B}`: `B` was acquired while `A` was held.
    order: DashMap<Cookie, BTreeSet<Cookie>>,
    file: Option<Mutex<BufWriter<File>>>,
    /// Set after the first failed write; file output stops there.
    file_failed: AtomicBool,
    buffer: Mutex<VecDeque<LockTraceEvent>>,
    max_events: usize,
    event_count: AtomicU64,
}

impl LockTraceCollector {
    /// Creates a collector from its configuration.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if the output file cannot be opened.
    pub fn new(config: &LockTraceConfig) -> Result<Self> {
        let file = match &config.output_path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(BufWriter::new(file)))
            }
            None => None,
        };
        Ok(Self {
            enabled: AtomicBool::new(config.enabled),
            held: DashMap::new(),
            order: DashMap::new(),
            file,
            file_failed: AtomicBool::new(false),
            buffer: Mutex::new(VecDeque::new()),
            max_events: config.max_events,
            event_count: AtomicU64::new(0),
        })
    }

    /// Turns tracing on or off. Turning it off forgets the held-lock state.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.held.clear();
        }
    }

    /// Returns `true` while tracing.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Records that `thread` acquired `cookie`.
    pub fn on_acquired(&self, thread: NativeThreadId, cookie: Cookie) {
        if !self.is_enabled() {
            return;
        }
        let depth = {
            let mut held = self.held.entry(thread).or_default();
            for earlier in held.iter().filter(|earlier| **earlier != cookie) {
                self.order.entry(*earlier).or_default().insert(cookie);
            }
            held.push(cookie);
            held.len()
        };
        self.record(LockTraceEvent::Acquired {
            thread,
            cookie,
            depth,
        });
    }

    /// Records that `thread` released `cookie`.
    pub fn on_released(&self, thread: NativeThreadId, cookie: Cookie) {
        if !self.is_enabled() {
            return;
        }
        let removed = self
            .held
            .get_mut(&thread)
            .and_then(|mut held| {
                let index = held.iter().rposition(|held| *held == cookie)?;
                held.remove(index);
                Some(held.is_empty())
            });
        if removed == Some(true) {
            self.held.remove_if(&thread, |_, held| held.is_empty());
        }
        self.record(LockTraceEvent::Released { thread, cookie });
    }

    /// Records a deadlock report.
    pub fn on_deadlock(&self, report: &DeadlockReport) {
        if !self.is_enabled() {
            return;
        }
        self.record(LockTraceEvent::Deadlock {
            threads: report.participants(),
            cookies: report.cookies(),
        });
    }

    /// Locks `thread` currently holds, oldest first.
    #[must_use]
    pub fn held_locks(&self, thread: NativeThreadId) -> Vec<Cookie> {
        self.held
            .get(&thread)
            .map(|held| held.clone())
            .unwrap_or_default()
    }

    /// Every observed `(held, then acquired)` pair, sorted.
    #[must_use]
    pub fn lock_order(&self) -> Vec<(Cookie, Cookie)> {
        let mut edges: Vec<(Cookie, Cookie)> = self
            .order
            .iter()
            .flat_map(|entry| {
                let first = *entry.key();
                entry
                    .value()
                    .iter()
                    .map(move |then| (first, *then))
                    .collect::<Vec<_>>()
            })
            .collect();
        edges.sort_unstable();
        edges
    }

    /// Lock pairs acquired in both orders, each reported once with the smaller cookie first.
    #[must_use]
    pub fn inversions(&self) -> Vec<(Cookie, Cookie)> {
        self.lock_order()
            .into_iter()
            .filter(|(first, then)| {
                first < then
                    && self
                        .order
                        .get(then)
                        .is_some_and(|after| after.contains(first))
            })
            .collect()
    }

    fn record(&self, event: LockTraceEvent) {
        self.event_count.fetch_add(1, Ordering::Relaxed);

        if let Some(file) = &self.file {
            if self.file_failed.load(Ordering::Acquire) {
                return;
            }
            let written = {
                let mut writer = lock!(file);
                write_line(&mut *writer, &event)
            };
            if let Err(error) = written {
                self.file_failed_with(&error);
            }
        } else {
            let mut buffer = lock!(self.buffer);
            if self.max_events > 0 && buffer.len() >= self.max_events {
                buffer.pop_front();
            }
            buffer.push_back(event);
        }
    }

    /// Flushes buffered file output.
    pub fn flush(&self) {
        if let Some(file) = &self.file {
            if self.file_failed.load(Ordering::Acquire) {
                return;
            }
            let flushed = lock!(file).flush();
            if let Err(error) = flushed {
                self.file_failed_with(&error);
            }
        }
    }

    /// Returns `true` once file output has stopped after a write error.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.file_failed.load(Ordering::Acquire)
    }

    fn file_failed_with(&self, error: &io::Error) {
        if !self.file_failed.swap(true, Ordering::AcqRel) {
            log::warn!("lock trace file output stopped: {}", error);
        }
    }

    /// Number of events recorded.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    /// Takes the in-memory buffer, leaving it empty.
    ///
    /// Returns `None` if this collector writes to a file.
    pub fn take_buffer(&self) -> Option<Vec<LockTraceEvent>> {
        if self.file.is_some() {
            return None;
        }
        Some(mem::take(&mut *lock!(self.buffer)).into())
    }
}

fn write_line<W: Write>(writer: &mut W, event: &LockTraceEvent) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, event)?;
    writer.write_all(b"\n")
}

impl std::fmt::Debug for LockTraceCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTraceCollector")
            .field("enabled", &self.is_enabled())
            .field("is_file_based", &self.file.is_some())
            .field("file_failed", &self.has_failed())
            .field("max_events", &self.max_events)
            .field("event_count", &self.event_count())
            .finish_non_exhaustive()
    }
}
