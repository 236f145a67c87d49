//! Native threads and the tasks that wrap them.
//!
//! The embedding runtime never touches OS threads directly. It asks the [`TaskManager`] for the
//! [`Task`] of the calling thread, or for a new task running a start routine, and drives it
//! through start, alert, join and priority changes.
//!
//! # Key Components
//!
//! - [`NativeThreadId`] - Host-assigned identity of an OS thread
//! - [`ThreadControl`] - Per-thread start gate, exit signal and alert slot
//! - [`Task`] - Handle pairing a native thread with an optional [`LogicalTask`]
//! - [`TaskManager`] - Registry of tasks keyed by native thread id
//!
//! # Task Lifecycle
//!
//! ```text
//! Created (suspended) --start()--> Running --remove_task()--> Removed
//!         \___________________remove_task()_________________/
//! ```
//!
//! Tasks discovered through [`TaskManager::current_task`] begin in `Running`. A task removed
//! before it was started never runs its start routine.

mod control;
mod id;
mod manager;
mod task;

pub use control::ThreadControl;
pub use id::NativeThreadId;
pub use manager::TaskManager;
pub use task::{Task, TaskState};

/// The managed execution unit the embedding runtime pairs with a native thread.
///
/// The host only holds references to it; its lifetime belongs to the runtime.
pub trait LogicalTask: Send + Sync {
    /// The runtime's own identifier for this unit.
    fn managed_id(&self) -> u32;
}

/// Logical thread priorities.
///
/// The numeric values follow the conventional OS scale, with `Normal` at zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TaskPriority {
    /// Runs only when nothing else is runnable.
    Idle,
    /// Lowest scheduling priority.
    Lowest,
    /// Below normal scheduling priority.
    BelowNormal,
    /// Normal (default) scheduling priority.
    #[default]
    Normal,
    /// Above normal scheduling priority.
    AboveNormal,
    /// Highest scheduling priority.
    Highest,
    /// Preempts everything else.
    TimeCritical,
}

impl TaskPriority {
    /// The numeric priority.
    #[must_use]
    pub fn value(self) -> i32 {
        match self {
            TaskPriority::Idle => -15,
            TaskPriority::Lowest => -2,
            TaskPriority::BelowNormal => -1,
            TaskPriority::Normal => 0,
            TaskPriority::AboveNormal => 1,
            TaskPriority::Highest => 2,
            TaskPriority::TimeCritical => 15,
        }
    }

    /// Maps a numeric priority back to its level, if it names one.
    #[must_use]
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            -15 => Some(TaskPriority::Idle),
            -2 => Some(TaskPriority::Lowest),
            -1 => Some(TaskPriority::BelowNormal),
            0 => Some(TaskPriority::Normal),
            1 => Some(TaskPriority::AboveNormal),
            2 => Some(TaskPriority::Highest),
            15 => Some(TaskPriority::TimeCritical),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_values() {
        assert_eq!(TaskPriority::default().value(), 0);
        assert!(TaskPriority::Highest.value() > TaskPriority::Normal.value());
        assert_eq!(TaskPriority::from_value(-2), Some(TaskPriority::Lowest));
        assert_eq!(TaskPriority::from_value(7), None);
    }
}
