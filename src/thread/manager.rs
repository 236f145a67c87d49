//! The task registry.
//!
//! [`TaskManager`] maps native thread ids to [`Task`] handles. Lookups for unseen threads
//! create the task on the spot, and [`TaskManager::create_task`] spawns new threads suspended
//! so their registry entry and domain binding exist before they run any code.

use std::{
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use crate::{
    domain::DomainRegistry,
    sync::{WaitOptions, WaitOutcome},
    thread::{LogicalTask, NativeThreadId, Task, ThreadControl},
    Error, Result,
};

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<NativeThreadId, Arc<Task>>,
    managed: HashMap<NativeThreadId, Arc<dyn LogicalTask>>,
}

/// Registry of [`Task`]s keyed by native thread id.
pub struct TaskManager {
    me: Weak<TaskManager>,
    table: Mutex<TaskTable>,
    domains: Arc<DomainRegistry>,
}

impl TaskManager {
    /// Creates an empty registry that consults `domains` for thread admission.
    #[must_use]
    pub fn new(domains: Arc<DomainRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|me| TaskManager {
            me: me.clone(),
            table: Mutex::new(TaskTable::default()),
            domains,
        })
    }

    /// The domain registry this manager reports thread creation and exit to.
    #[must_use]
    pub fn domains(&self) -> &Arc<DomainRegistry> {
        &self.domains
    }

    /// The task of the calling thread, created on first request.
    ///
    /// Concurrent calls from the same thread always return the same task.
    pub fn current_task(&self) -> Arc<Task> {
        let control = ThreadControl::current();
        let mut table = lock!(self.table);
        Arc::clone(
            table
                .tasks
                .entry(control.id())
                .or_insert_with(|| Arc::new(Task::new(control, self.me.clone()))),
        )
    }

    /// The task registered for `thread`, without creating one.
    pub fn lookup(&self, thread: NativeThreadId) -> Option<Arc<Task>> {
        lock!(self.table).tasks.get(&thread).cloned()
    }

    /// Spawns a suspended thread that will run `start` once its task is started.
    ///
    /// The calling thread is the new thread's parent: the parent's domain must admit another
    /// thread, and the child is bound to that domain in the same registry step (see
    /// [`DomainRegistry::reserve_thread`]) before this returns. When `start`
    /// returns the child releases its binding and removes its own task.
    ///
    /// # Arguments
    ///
    /// * `stack_size` - Stack size in bytes, `0` for the platform default
    /// * `start` - The thread's start routine
    ///
    /// # Errors
    ///
    /// - [`Error::ThreadLimit`] if the parent's domain is at its thread cap
    /// - [`Error::ThreadCreation`] if the OS refused the thread
    pub fn create_task<F>(&self, stack_size: usize, start: F) -> Result<Arc<Task>>
    where
        F: FnOnce() + Send + 'static,
    {
        let parent = NativeThreadId::current();
        let control = ThreadControl::suspended();
        let child = control.id();
        let bound = self.domains.reserve_thread(parent, child)?.is_some();

        let task = Arc::new(Task::new(Arc::clone(&control), self.me.clone()));
        lock!(self.table).tasks.insert(child, Arc::clone(&task));

        let mut builder = std::thread::Builder::new().name(format!("host-task-{}", child.value()));
        if stack_size > 0 {
            builder = builder.stack_size(stack_size);
        }

        let domains = Arc::clone(&self.domains);
        let manager = self.me.clone();
        let spawned = builder.spawn(move || {
            ThreadControl::install(&control);
            if control.wait_for_start() {
                if catch_unwind(AssertUnwindSafe(start)).is_err() {
                    log::error!("start routine of {} panicked", child);
                }
            }
            if domains.domain_of(child).is_some() {
                let _ = domains.thread_release(child);
            }
            if let Some(manager) = manager.upgrade() {
                manager.remove_task(child);
            }
            control.mark_exited();
        });

        match spawned {
            Ok(_) => {
                log::debug!("{} created {} (suspended)", parent, child);
                Ok(task)
            }
            Err(e) => {
                log::error!("failed to create thread for {}: {}", parent, e);
                self.remove_task(child);
                if bound {
                    let _ = self.domains.thread_release(child);
                }
                Err(Error::ThreadCreation(e))
            }
        }
    }

    /// Erases the task of `thread` and drops its logical task reference.
    ///
    /// Returns `true` if an entry was removed; removing twice is harmless.
    pub fn remove_task(&self, thread: NativeThreadId) -> bool {
        let (task, logical) = {
            let mut table = lock!(self.table);
            (table.tasks.remove(&thread), table.managed.remove(&thread))
        };
        drop(logical);
        match task {
            Some(task) => {
                task.retire();
                log::trace!("{} removed", thread);
                true
            }
            None => false,
        }
    }

    /// Records that `logical` runs on the native task `task` of `thread`.
    pub fn add_managed_task(
        &self,
        task: &Arc<Task>,
        logical: Arc<dyn LogicalTask>,
        thread: NativeThreadId,
    ) {
        let mut table = lock!(self.table);
        debug_assert!(
            table
                .tasks
                .get(&thread)
                .is_some_and(|registered| Arc::ptr_eq(registered, task)),
            "logical task registered for a thread without a matching native task"
        );
        if !table.tasks.contains_key(&thread) {
            log::warn!("logical task {} bound to unknown {}", logical.managed_id(), thread);
        }
        table.managed.insert(thread, logical);
    }

    /// The logical task bound to `thread`.
    pub fn logical_task(&self, thread: NativeThreadId) -> Option<Arc<dyn LogicalTask>> {
        lock!(self.table).managed.get(&thread).cloned()
    }

    /// Number of registered tasks.
    pub fn task_count(&self) -> usize {
        lock!(self.table).tasks.len()
    }

    /// The calling thread's id.
    #[must_use]
    pub fn current_native_thread_id(&self) -> NativeThreadId {
        NativeThreadId::current()
    }

    /// Suspends the calling thread for `duration`.
    ///
    /// Returns [`WaitOutcome::Signaled`] after a full sleep, or [`WaitOutcome::Interrupted`]
    /// if an alert cut an alertable sleep short.
    pub fn sleep(&self, duration: Duration, options: WaitOptions) -> WaitOutcome {
        ThreadControl::current().sleep(duration, options)
    }

    /// Yields the rest of the calling thread's time slice.
    pub fn switch_to_task(&self) {
        std::thread::yield_now();
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = lock!(self.table);
        f.debug_struct("TaskManager")
            .field("tasks", &table.tasks.len())
            .field("managed", &table.managed.len())
            .finish()
    }
}
