//! Host task handles.
//!
//! A [`crate::thread::Task`] is what the runtime holds for each native thread the host knows
//! about. Threads created through [`crate::thread::TaskManager::create_task`] start suspended in
//! the [`crate::thread::TaskState::Created`] state; [`crate::thread::Task::start`] releases
//! them. Threads that entered the host on their own get a task the first time they call
//! [`crate::thread::TaskManager::current_task`].
//!
//! # Key Components
//!
//! - [`crate::thread::Task`] - Start, alert, join and priority control for one thread
//! - [`crate::thread::TaskState`] - Created, running or removed from the registry
//!
//! # Usage Examples
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use hostrt::sync::WaitOptions;
//!
//! let task = host.tasks().create_task(0, || println!("worker"))?;
//! task.start()?;
//! task.join(Some(Duration::from_secs(5)), WaitOptions::empty())?;
//! ```
//!
//! The runtime may attach its own per-thread object with
//! [`crate::thread::Task::set_clr_task`]; the task keeps it alive until the thread is removed.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use crate::{
    sync::{WaitOptions, WaitOutcome},
    thread::{LogicalTask, NativeThreadId, TaskManager, TaskPriority, ThreadControl},
    Error, Result,
};

/// Lifecycle state of a [`Task`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Created suspended, waiting for [`Task::start`].
    Created,
    /// The thread runs (or has run) its routine.
    Running,
    /// Removed from the registry.
    Removed,
}

/// Host handle for one native thread.
///
/// A task shares its thread's [`ThreadControl`] and holds an optional reference to the
/// runtime's [`LogicalTask`] for that thread.
pub struct Task {
    control: Arc<ThreadControl>,
    logical: Mutex<Option<Arc<dyn LogicalTask>>>,
    removed: AtomicBool,
    manager: Weak<TaskManager>,
}

impl Task {
    pub(crate) fn new(control: Arc<ThreadControl>, manager: Weak<TaskManager>) -> Self {
        Self {
            control,
            logical: Mutex::new(None),
            removed: AtomicBool::new(false),
            manager,
        }
    }

    /// The native thread this task wraps.
    #[must_use]
    pub fn id(&self) -> NativeThreadId {
        self.control.id()
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        if self.removed.load(Ordering::Acquire) {
            TaskState::Removed
        } else if self.control.is_started() {
            TaskState::Running
        } else {
            TaskState::Created
        }
    }

    /// Returns `true` once the thread's start routine has returned.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.control.has_exited()
    }

    /// Resumes a task created suspended. Starting a running task does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] if the task was removed before it was started.
    pub fn start(&self) -> Result<()> {
        if self.control.resume() {
            log::trace!("{} started", self.id());
            return Ok(());
        }
        match self.state() {
            TaskState::Running => Ok(()),
            _ => Err(Error::TaskNotFound(self.id())),
        }
    }

    /// Queues an alert. An alertable wait on the thread returns
    /// [`WaitOutcome::Interrupted`]; the next one does if none is in progress.
    pub fn alert(&self) {
        log::trace!("{} alerted", self.id());
        self.control.alert();
    }

    /// Waits for the thread to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WaitFailed`] when a thread tries to join itself.
    pub fn join(&self, timeout: Option<Duration>, options: WaitOptions) -> Result<WaitOutcome> {
        if NativeThreadId::current() == self.id() {
            return Err(Error::WaitFailed(format!("{} cannot join itself", self.id())));
        }
        Ok(self.control.join(timeout, options))
    }

    /// The thread's numeric priority.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.control.priority()
    }

    /// Changes the thread's priority.
    ///
    /// A caller running outside the default domain may lower priorities but not raise them.
    /// A raise from such a caller is ignored and still reports success.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `priority` is not a known level.
    pub fn set_priority(&self, priority: i32) -> Result<()> {
        if TaskPriority::from_value(priority).is_none() {
            return Err(Error::InvalidArgument(format!(
                "unknown thread priority {}",
                priority
            )));
        }

        if priority > self.priority() {
            let caller = NativeThreadId::current();
            let restricted = self
                .manager
                .upgrade()
                .is_some_and(|manager| manager.domains().is_snippet_thread(caller));
            if restricted {
                log::debug!(
                    "{} may not raise the priority of {} to {}",
                    caller,
                    self.id(),
                    priority
                );
                return Ok(());
            }
        }

        self.control.set_priority(priority);
        Ok(())
    }

    /// Attaches the runtime's logical task and records it in the task registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] if the task was already removed or its registry is gone.
    pub fn set_clr_task(self: &Arc<Self>, logical: Arc<dyn LogicalTask>) -> Result<()> {
        if self.state() == TaskState::Removed {
            return Err(Error::TaskNotFound(self.id()));
        }
        let manager = self
            .manager
            .upgrade()
            .ok_or(Error::TaskNotFound(self.id()))?;
        *lock!(self.logical) = Some(Arc::clone(&logical));
        manager.add_managed_task(self, logical, self.id());
        Ok(())
    }

    /// The attached logical task, if any.
    #[must_use]
    pub fn logical_task(&self) -> Option<Arc<dyn LogicalTask>> {
        lock!(self.logical).clone()
    }

    /// Marks the task removed, cancelling it if it never started.
    pub(crate) fn retire(&self) {
        self.removed.store(true, Ordering::Release);
        if self.control.cancel() {
            log::debug!("{} removed before it was started", self.id());
        }
        lock!(self.logical).take();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("priority", &self.priority())
            .field(
                "logical",
                &self.logical_task().map(|logical| logical.managed_id()),
            )
            .finish()
    }
}
