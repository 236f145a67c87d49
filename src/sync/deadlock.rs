//! Wait-graph deadlock detection for monitor waits.
//!
//! The detector keeps one edge per blocked thread: "thread T waits on lock C". Ownership of
//! locks is not tracked here; the embedding runtime answers "who owns C" through the injected
//! [`LockOwnerOracle`]. A cycle walk alternates between the two:
//!
//! ```text
//! T0 --waits on--> C0 --owned by--> T1 --waits on--> C1 --owned by--> T2 ... --> T0
//! ```
//!
//! The walk stops without a verdict as soon as a lock has no owner or an owner is not waiting,
//! so an owner that releases its lock mid-walk simply yields "no deadlock".
//!
//! # Backoff
//!
//! [`DeadlockDetector::wait`] blocks in slices. The first slice is
//! [`DeadlockConfig::initial_slice`]; each expired slice registers the thread's edge (once) and
//! runs a walk. Slices then double until half the requested timeout is spent, after which the
//! wait takes exactly the remainder. Infinite waits double up to
//! [`DeadlockConfig::max_slice`]. The edge stays registered for the whole wait, so other
//! participants of a cycle can see it, and is removed before the wait returns.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use crate::{
    host::DeadlockConfig,
    sync::{AutoEvent, Cookie, LockTraceCollector, WaitOptions, WaitOutcome},
    thread::NativeThreadId,
};

/// Answers which thread owns a managed lock.
///
/// Implementations must not block and must not call back into the detector.
pub trait LockOwnerOracle: Send + Sync {
    /// The thread currently holding the lock `cookie`, if any.
    fn monitor_owner(&self, cookie: Cookie) -> Option<NativeThreadId>;
}

/// One edge of a deadlock cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitEdge {
    /// The blocked thread.
    pub thread: NativeThreadId,
    /// The lock it waits on.
    pub cookie: Cookie,
    /// The thread holding that lock, which is the next edge's thread.
    pub owner: NativeThreadId,
}

/// A detected cycle, in wait order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadlockReport {
    /// The cycle's edges. The owner of the last edge is the thread of the first.
    pub cycle: Vec<WaitEdge>,
}

impl DeadlockReport {
    fn from_chain(chain: &[(NativeThreadId, Cookie)]) -> Self {
        let cycle = chain
            .iter()
            .enumerate()
            .map(|(index, (thread, cookie))| WaitEdge {
                thread: *thread,
                cookie: *cookie,
                owner: chain[(index + 1) % chain.len()].0,
            })
            .collect();
        Self { cycle }
    }

    /// The deadlocked threads, in wait order.
    #[must_use]
    pub fn participants(&self) -> Vec<NativeThreadId> {
        self.cycle.iter().map(|edge| edge.thread).collect()
    }

    /// The locks involved, in wait order.
    #[must_use]
    pub fn cookies(&self) -> Vec<Cookie> {
        self.cycle.iter().map(|edge| edge.cookie).collect()
    }
}

impl fmt::Display for DeadlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deadlock among {} threads:", self.cycle.len())?;
        for edge in &self.cycle {
            write!(
                f,
                " [{} waits on lock {} held by {}]",
                edge.thread, edge.cookie, edge.owner
            )?;
        }
        Ok(())
    }
}

/// Detects cycles among threads blocked on monitor events.
pub struct DeadlockDetector {
    waits: Mutex<HashMap<NativeThreadId, Cookie>>,
    oracle: RwLock<Option<Arc<dyn LockOwnerOracle>>>,
    config: DeadlockConfig,
    trace: Arc<LockTraceCollector>,
    detections: AtomicU64,
}

impl DeadlockDetector {
    /// Creates a detector without an oracle. Until one is installed monitor waits are plain
    /// waits.
    #[must_use]
    pub fn new(config: DeadlockConfig, trace: Arc<LockTraceCollector>) -> Self {
        Self {
            waits: Mutex::new(HashMap::new()),
            oracle: RwLock::new(None),
            config,
            trace,
            detections: AtomicU64::new(0),
        }
    }

    /// Installs the runtime's lock owner oracle.
    pub fn set_oracle(&self, oracle: Arc<dyn LockOwnerOracle>) {
        *write_lock!(self.oracle) = Some(oracle);
    }

    /// Returns `true` once an oracle is installed.
    #[must_use]
    pub fn has_oracle(&self) -> bool {
        read_lock!(self.oracle).is_some()
    }

    /// The lock-order trace collector fed by monitor events.
    #[must_use]
    pub fn trace(&self) -> &Arc<LockTraceCollector> {
        &self.trace
    }

    /// Number of deadlocks reported so far.
    #[must_use]
    pub fn detection_count(&self) -> u64 {
        self.detections.load(Ordering::Relaxed)
    }

    /// Number of threads with a registered wait edge.
    #[must_use]
    pub fn pending_waits(&self) -> usize {
        lock!(self.waits).len()
    }

    /// Records that `thread` waits on `cookie` and checks for a cycle through it.
    ///
    /// A thread that already has an edge keeps its original edge.
    pub fn try_enter(&self, thread: NativeThreadId, cookie: Cookie) -> Option<DeadlockReport> {
        lock!(self.waits).entry(thread).or_insert(cookie);
        self.detect(thread, cookie)
    }

    /// Removes the wait edge of `thread`.
    pub fn end_enter(&self, thread: NativeThreadId) {
        lock!(self.waits).remove(&thread);
    }

    /// Walks the wait graph starting at `thread`, which is blocked on `cookie`.
    ///
    /// The oracle is called without any detector lock held.
    pub fn detect(&self, thread: NativeThreadId, cookie: Cookie) -> Option<DeadlockReport> {
        let oracle = read_lock!(self.oracle).clone()?;

        let mut chain = vec![thread];
        let mut blocked_on = cookie;
        loop {
            let owner = oracle.monitor_owner(blocked_on)?;

            if let Some(start) = chain.iter().position(|visited| *visited == owner) {
                let waits = lock!(self.waits);
                let cycle: Option<Vec<(NativeThreadId, Cookie)>> = chain[start..]
                    .iter()
                    .map(|member| waits.get(member).map(|cookie| (*member, *cookie)))
                    .collect();
                // A member without an edge stopped waiting during the walk.
                return cycle.map(|cycle| DeadlockReport::from_chain(&cycle));
            }

            chain.push(owner);
            blocked_on = lock!(self.waits).get(&owner).copied()?;
        }
    }

    /// Waits on the monitor's event with backoff and cycle detection.
    ///
    /// The wait edge is always removed before this returns.
    pub fn wait(
        &self,
        event: &AutoEvent,
        cookie: Cookie,
        timeout: Option<Duration>,
        options: WaitOptions,
    ) -> WaitOutcome {
        let me = NativeThreadId::current();
        let mut slice = self.config.initial_slice;
        let mut waited = Duration::ZERO;

        let outcome = loop {
            let this_slice = match timeout {
                Some(total) => slice.min(total.saturating_sub(waited)),
                None => slice,
            };

            match event.wait(Some(this_slice), options) {
                WaitOutcome::TimedOut => {}
                other => break other,
            }

            waited += this_slice;
            if let Some(report) = self.try_enter(me, cookie) {
                self.detections.fetch_add(1, Ordering::Relaxed);
                log::error!("{}", report);
                self.trace.on_deadlock(&report);
                break WaitOutcome::Deadlock(report);
            }

            match timeout {
                Some(total) if waited >= total => break WaitOutcome::TimedOut,
                Some(total) if waited >= total / 2 => slice = total - waited,
                Some(_) => slice = slice.saturating_mul(2),
                None => slice = slice.saturating_mul(2).min(self.config.max_slice),
            }
        };

        self.end_enter(me);
        outcome
    }
}

impl fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlockDetector")
            .field("pending_waits", &self.pending_waits())
            .field("has_oracle", &self.has_oracle())
            .field("detections", &self.detection_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LockTraceConfig;
    use std::time::Instant;

    /// Owner table set up by the test.
    #[derive(Default)]
    struct TableOracle {
        owners: Mutex<HashMap<Cookie, NativeThreadId>>,
    }

    impl TableOracle {
        fn own(&self, cookie: Cookie, thread: NativeThreadId) {
            self.owners.lock().unwrap().insert(cookie, thread);
        }
    }

    impl LockOwnerOracle for TableOracle {
        fn monitor_owner(&self, cookie: Cookie) -> Option<NativeThreadId> {
            self.owners.lock().unwrap().get(&cookie).copied()
        }
    }

    fn detector(oracle: Arc<TableOracle>) -> DeadlockDetector {
        let trace = Arc::new(LockTraceCollector::new(&LockTraceConfig::default()).unwrap());
        let detector = DeadlockDetector::new(
            DeadlockConfig::default().with_initial_slice(Duration::from_millis(10)),
            trace,
        );
        detector.set_oracle(oracle);
        detector
    }

    fn t(n: u64) -> NativeThreadId {
        NativeThreadId::new(2_000_000 + n)
    }

    #[test]
    fn test_three_way_cycle() {
        let oracle = Arc::new(TableOracle::default());
        oracle.own(Cookie(0xa), t(2));
        oracle.own(Cookie(0xb), t(3));
        oracle.own(Cookie(0xc), t(1));
        let detector = detector(oracle);

        assert!(detector.try_enter(t(2), Cookie(0xb)).is_none());
        assert!(detector.try_enter(t(3), Cookie(0xc)).is_none());
        let report = detector.try_enter(t(1), Cookie(0xa)).unwrap();

        assert_eq!(report.participants(), vec![t(1), t(2), t(3)]);
        assert_eq!(report.cookies(), vec![Cookie(0xa), Cookie(0xb), Cookie(0xc)]);
        assert_eq!(report.cycle[2].owner, t(1));
        assert!(report.to_string().contains("held by"));
    }

    #[test]
    fn test_chain_without_back_edge() {
        let oracle = Arc::new(TableOracle::default());
        oracle.own(Cookie(0xa), t(2));
        oracle.own(Cookie(0xb), t(3));
        oracle.own(Cookie(0xc), t(4));
        let detector = detector(oracle);

        detector.try_enter(t(2), Cookie(0xb));
        detector.try_enter(t(3), Cookie(0xc));
        assert!(detector.try_enter(t(1), Cookie(0xa)).is_none());
    }

    #[test]
    fn test_unowned_lock_is_no_deadlock() {
        let detector = detector(Arc::new(TableOracle::default()));
        assert!(detector.try_enter(t(1), Cookie(1)).is_none());
        assert_eq!(detector.pending_waits(), 1);
        detector.end_enter(t(1));
        assert_eq!(detector.pending_waits(), 0);
    }

    #[test]
    fn test_cycle_not_through_start() {
        // t1 waits on a lock held by t2, which is deadlocked with t3.
        let oracle = Arc::new(TableOracle::default());
        oracle.own(Cookie(0xa), t(2));
        oracle.own(Cookie(0xb), t(3));
        oracle.own(Cookie(0xc), t(2));
        let detector = detector(oracle);

        detector.try_enter(t(2), Cookie(0xb));
        detector.try_enter(t(3), Cookie(0xc));
        let report = detector.try_enter(t(1), Cookie(0xa)).unwrap();
        assert_eq!(report.participants(), vec![t(2), t(3)]);
    }

    #[test]
    fn test_first_edge_is_kept() {
        let detector = detector(Arc::new(TableOracle::default()));
        detector.try_enter(t(1), Cookie(1));
        detector.try_enter(t(1), Cookie(2));
        assert_eq!(lock!(detector.waits).get(&t(1)), Some(&Cookie(1)));
    }

    #[test]
    fn test_no_oracle_no_detection() {
        let trace = Arc::new(LockTraceCollector::new(&LockTraceConfig::default()).unwrap());
        let detector = DeadlockDetector::new(DeadlockConfig::default(), trace);
        assert!(!detector.has_oracle());
        assert!(detector.detect(t(1), Cookie(1)).is_none());
    }

    #[test]
    fn test_wait_times_out_on_budget() {
        let oracle = Arc::new(TableOracle::default());
        oracle.own(Cookie(7), t(9));
        let detector = detector(oracle);
        let event = AutoEvent::new(false);

        let start = Instant::now();
        let outcome = detector.wait(
            &event,
            Cookie(7),
            Some(Duration::from_millis(120)),
            WaitOptions::empty(),
        );
        let elapsed = start.elapsed();
        assert!(outcome.is_timed_out());
        assert!(elapsed >= Duration::from_millis(120));
        assert!(elapsed < Duration::from_secs(5));
        assert_eq!(detector.pending_waits(), 0);
    }

    #[test]
    fn test_wait_reports_self_cycle() {
        let oracle = Arc::new(TableOracle::default());
        let me = NativeThreadId::current();
        oracle.own(Cookie(3), me);
        let detector = detector(oracle);
        let event = AutoEvent::new(false);

        let outcome = detector.wait(&event, Cookie(3), None, WaitOptions::empty());
        let report = outcome.deadlock().unwrap();
        assert_eq!(report.participants(), vec![me]);
        assert_eq!(detector.detection_count(), 1);
        assert_eq!(detector.pending_waits(), 0);
    }

    #[test]
    fn test_wait_signaled_before_first_slice() {
        let detector = detector(Arc::new(TableOracle::default()));
        let event = AutoEvent::new(true);
        let outcome = detector.wait(&event, Cookie(1), None, WaitOptions::empty());
        assert!(outcome.is_signaled());
        assert_eq!(detector.pending_waits(), 0);
    }
}
