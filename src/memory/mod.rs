//! Memory accounting.
//!
//! Every heap and virtual allocation made through this module is gated by the domain registry's
//! memory admission check and charged to the requesting thread's domain. A denial surfaces as
//! [`crate::Error::OutOfMemory`]; it is an expected outcome and never a panic.
//!
//! # Key Components
//!
//! - [`MemoryManager`] - Allocator factory, virtual memory and address-space notifications
//! - [`Allocator`] / [`HeapBlock`] - Private heaps whose blocks release their charge on drop
//! - [`MemoryProtection`] / [`RegionInfo`] - Virtual page protection and query results
//! - [`GcManager`] - Collector suspension notifications
//!
//! # Examples
//!
//! ```rust,no_run
//! use hostrt::{HostConfig, HostControl};
//! use hostrt::memory::{MallocFlags, MemoryCriticalLevel};
//!
//! let host = HostControl::new(HostConfig::default())?;
//! let heap = host.memory().create_allocator(MallocFlags::THREAD_SAFE);
//! let block = heap.alloc(128, MemoryCriticalLevel::TaskCritical)?;
//! assert_eq!(block.len(), 128);
//! # Ok::<(), hostrt::Error>(())
//! ```

mod gc;
mod load;
mod malloc;
mod manager;
mod region;

pub use gc::GcManager;
pub use load::MemoryLoad;
pub use malloc::{Allocator, HeapBlock, MallocFlags};
pub use manager::{MemoryManager, MemoryNotificationCallback};
pub use region::{
    page_ceil, page_floor, AllocationType, FreeType, MemoryProtection, RegionInfo, RegionState,
    ALLOCATION_GRANULARITY, PAGE_SIZE,
};

use strum::{Display, EnumIter};

/// How badly the caller needs an allocation to succeed.
///
/// Anything above [`MemoryCriticalLevel::TaskCritical`] is allowed past a domain's budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
pub enum MemoryCriticalLevel {
    /// Failure only hurts the requesting task.
    TaskCritical,
    /// Failure would leave the domain inconsistent.
    AppDomainCritical,
    /// Failure would take down the process.
    ProcessCritical,
}

impl MemoryCriticalLevel {
    /// True when this level ignores the domain budget.
    #[must_use]
    pub fn bypasses_budget(self) -> bool {
        self > MemoryCriticalLevel::TaskCritical
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_critical_level_ordering() {
        let levels: Vec<_> = MemoryCriticalLevel::iter().collect();
        assert_eq!(levels.len(), 3);
        assert!(levels.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(!MemoryCriticalLevel::TaskCritical.bypasses_budget());
        assert!(MemoryCriticalLevel::AppDomainCritical.bypasses_budget());
        assert!(MemoryCriticalLevel::ProcessCritical.bypasses_budget());
    }
}
