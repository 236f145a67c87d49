//! Private heaps.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use bitflags::bitflags;

use crate::{
    memory::{MemoryCriticalLevel, MemoryManager},
    thread::NativeThreadId,
    Error, Result,
};

bitflags! {
    /// Options for [`MemoryManager::create_allocator`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MallocFlags: u32 {
        /// Blocks are intended to hold generated code.
        const EXECUTABLE = 0x1;
        /// Blocks may be allocated and freed from any thread.
        const THREAD_SAFE = 0x2;
    }
}

struct HeapShared {
    flags: MallocFlags,
    manager: Arc<MemoryManager>,
    live_bytes: AtomicU64,
    live_blocks: AtomicUsize,
}

/// A private heap.
///
/// Each allocation is admitted against the calling thread's domain budget and charged to it.
/// Dropping a [`HeapBlock`] returns its bytes.
#[derive(Clone)]
pub struct Allocator {
    shared: Arc<HeapShared>,
}

impl Allocator {
    pub(crate) fn new(flags: MallocFlags, manager: Arc<MemoryManager>) -> Self {
        Self {
            shared: Arc::new(HeapShared {
                flags,
                manager,
                live_bytes: AtomicU64::new(0),
                live_blocks: AtomicUsize::new(0),
            }),
        }
    }

    /// Allocates `size` zeroed bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the domain budget denies the request and `level` does
    /// not bypass it, or if the system cannot supply the memory.
    pub fn alloc(&self, size: usize, level: MemoryCriticalLevel) -> Result<HeapBlock> {
        let thread = NativeThreadId::current();
        self.shared.manager.admit(thread, size, level)?;

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(size.max(1))
            .map_err(|_| Error::OutOfMemory { requested: size })?;
        storage.resize(size.max(1), 0);
        let data = storage.into_boxed_slice();
        let address = data.as_ptr() as u64;

        self.shared
            .manager
            .domains()
            .on_memory_acquire(thread, size as u64, address);
        self.shared
            .live_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
        self.shared.live_blocks.fetch_add(1, Ordering::Relaxed);

        Ok(HeapBlock {
            data,
            len: size,
            heap: self.shared.clone(),
        })
    }

    /// Returns a block to the heap. Same as dropping it.
    pub fn free(&self, block: HeapBlock) {
        drop(block);
    }

    /// Flags this heap was created with.
    pub fn flags(&self) -> MallocFlags {
        self.shared.flags
    }

    /// Bytes currently held by live blocks.
    pub fn live_bytes(&self) -> u64 {
        self.shared.live_bytes.load(Ordering::Relaxed)
    }

    /// Number of live blocks.
    pub fn live_blocks(&self) -> usize {
        self.shared.live_blocks.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("flags", &self.shared.flags)
            .field("live_bytes", &self.live_bytes())
            .field("live_blocks", &self.live_blocks())
            .finish()
    }
}

/// One allocation from an [`Allocator`].
pub struct HeapBlock {
    data: Box<[u8]>,
    len: usize,
    heap: Arc<HeapShared>,
}

impl HeapBlock {
    /// Address the block is charged under.
    pub fn address(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    /// Requested size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for zero-sized requests.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for HeapBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl DerefMut for HeapBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl fmt::Debug for HeapBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBlock")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for HeapBlock {
    fn drop(&mut self) {
        self.heap
            .manager
            .domains()
            .on_memory_release(self.address());
        self.heap
            .live_bytes
            .fetch_sub(self.len as u64, Ordering::Relaxed);
        self.heap.live_blocks.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{DomainId, DomainRegistry},
        host::{DomainLimits, HostEventKind, HostEventQueue},
        test::registry_with_domain,
    };

    fn setup(max_bytes: u64) -> (Arc<DomainRegistry>, Arc<HostEventQueue>, Arc<MemoryManager>) {
        let (domains, events) =
            registry_with_domain(DomainLimits::new().with_max_bytes_per_domain(max_bytes));
        let manager = MemoryManager::new(domains.clone());
        (domains, events, manager)
    }

    #[test]
    fn test_alloc_charges_and_drop_releases() {
        let (domains, _events, manager) = setup(0);
        let heap = manager.create_allocator(MallocFlags::THREAD_SAFE);

        let mut block = heap.alloc(100, MemoryCriticalLevel::TaskCritical).unwrap();
        block[0] = 7;
        assert_eq!(block.len(), 100);
        assert_eq!(domains.memory_usage(DomainId(1)).unwrap(), 100);
        assert_eq!(heap.live_blocks(), 1);

        heap.free(block);
        assert_eq!(domains.memory_usage(DomainId(1)).unwrap(), 0);
        assert_eq!(heap.live_bytes(), 0);
    }

    #[test]
    fn test_zero_sized_alloc() {
        let (domains, _events, manager) = setup(0);
        let heap = manager.create_allocator(MallocFlags::empty());
        let a = heap.alloc(0, MemoryCriticalLevel::TaskCritical).unwrap();
        let b = heap.alloc(0, MemoryCriticalLevel::TaskCritical).unwrap();
        assert!(a.is_empty());
        assert_ne!(a.address(), b.address());
        assert_eq!(domains.memory_usage(DomainId(1)).unwrap(), 0);
    }

    #[test]
    fn test_budget_denial() {
        let (domains, events, manager) = setup(1000);
        let heap = manager.create_allocator(MallocFlags::empty());

        let _held = heap.alloc(900, MemoryCriticalLevel::TaskCritical).unwrap();
        let denied = heap.alloc(200, MemoryCriticalLevel::TaskCritical);
        assert!(matches!(denied, Err(Error::OutOfMemory { requested: 200 })));
        assert_eq!(domains.memory_usage(DomainId(1)).unwrap(), 900);
        assert_eq!(heap.live_blocks(), 1);

        let event = events.poll(Some(std::time::Duration::ZERO)).unwrap();
        assert_eq!(event.kind, HostEventKind::OutOfMemory);
    }

    #[test]
    fn test_critical_allocation_bypasses_budget() {
        let (domains, _events, manager) = setup(1000);
        let heap = manager.create_allocator(MallocFlags::empty());

        let _held = heap.alloc(900, MemoryCriticalLevel::TaskCritical).unwrap();
        let critical = heap
            .alloc(200, MemoryCriticalLevel::AppDomainCritical)
            .unwrap();
        assert_eq!(critical.len(), 200);
        assert_eq!(domains.memory_usage(DomainId(1)).unwrap(), 1100);
    }

    #[test]
    fn test_allocator_flags() {
        let (_domains, _events, manager) = setup(0);
        let heap = manager.create_allocator(MallocFlags::EXECUTABLE | MallocFlags::THREAD_SAFE);
        assert!(heap.flags().contains(MallocFlags::EXECUTABLE));
    }
}
