//! The memory manager.
//!
//! [`crate::memory::MemoryManager`] serves heap allocators and a simulated virtual address
//! space. Every allocation is admitted against the calling thread's domain budget before it
//! happens and charged to that domain once it succeeded. Virtual commits are admitted and
//! charged only for the pages in the touched span that were not committed yet.

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{Arc, Mutex, RwLock},
};

use crate::{
    domain::DomainRegistry,
    memory::{
        malloc::{Allocator, MallocFlags},
        region::{page_ceil, page_floor, VirtualRegion, ALLOCATION_GRANULARITY, PAGE_SIZE},
        AllocationType, FreeType, MemoryCriticalLevel, MemoryLoad, MemoryProtection, RegionInfo,
        RegionState,
    },
    thread::NativeThreadId,
    Error, Result,
};

/// First address handed out when the caller gives no hint.
const VIRTUAL_BASE: u64 = 0x1000_0000;

/// Receives a call whenever a memory admission is denied.
pub trait MemoryNotificationCallback: Send + Sync {
    /// `thread` was refused `requested` bytes.
    fn on_low_memory(&self, thread: NativeThreadId, requested: usize);
}

struct AddressSpace {
    regions: BTreeMap<u64, VirtualRegion>,
    next_base: u64,
}

impl AddressSpace {
    fn region_at(&self, address: u64) -> Option<&VirtualRegion> {
        self.regions
            .range(..=address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(address))
    }

    fn region_at_mut(&mut self, address: u64) -> Option<&mut VirtualRegion> {
        self.regions
            .range_mut(..=address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(address))
    }

    fn is_free(&self, base: u64, size: u64) -> bool {
        let end = base.saturating_add(size);
        let before = self
            .regions
            .range(..base)
            .next_back()
            .is_some_and(|(_, region)| region.end() > base);
        let inside = self
            .regions
            .range((Bound::Included(base), Bound::Excluded(end)))
            .next()
            .is_some();
        !before && !inside
    }

    fn place(&mut self, hint: Option<u64>, size: u64) -> Result<u64> {
        if let Some(address) = hint {
            let base = address - address % ALLOCATION_GRANULARITY;
            if !self.is_free(base, size) {
                return Err(Error::InvalidArgument(format!(
                    "range at {:#x} overlaps an existing reservation",
                    base
                )));
            }
            return Ok(base);
        }

        let mut base = self.next_base;
        while !self.is_free(base, size) {
            base = self
                .regions
                .range(..base.saturating_add(size))
                .next_back()
                .map_or(base, |(_, region)| region.end());
            base = base.div_ceil(ALLOCATION_GRANULARITY) * ALLOCATION_GRANULARITY;
        }
        self.next_base = (base + size).div_ceil(ALLOCATION_GRANULARITY) * ALLOCATION_GRANULARITY;
        Ok(base)
    }
}

/// Gatekeeper for heap and virtual allocations.
///
/// Each request is first checked with [`DomainRegistry::on_memory_acquiring`] for the calling
/// thread, then charged with [`DomainRegistry::on_memory_acquire`] once it succeeded. Virtual
/// reservations are free; only committed pages count. The address space lock is never held
/// while calling into the registry.
pub struct MemoryManager {
    domains: Arc<DomainRegistry>,
    space: Mutex<AddressSpace>,
    callback: RwLock<Option<Arc<dyn MemoryNotificationCallback>>>,
}

impl MemoryManager {
    /// Creates a manager that charges allocations through `domains`.
    pub fn new(domains: Arc<DomainRegistry>) -> Arc<Self> {
        Arc::new(Self {
            domains,
            space: Mutex::new(AddressSpace {
                regions: BTreeMap::new(),
                next_base: VIRTUAL_BASE,
            }),
            callback: RwLock::new(None),
        })
    }

    /// The registry allocations are charged to.
    pub fn domains(&self) -> &Arc<DomainRegistry> {
        &self.domains
    }

    /// Creates a private heap.
    pub fn create_allocator(self: &Arc<Self>, flags: MallocFlags) -> Allocator {
        log::debug!("creating allocator ({:?})", flags);
        Allocator::new(flags, self.clone())
    }

    /// Registers the callback invoked on admission denials, replacing any previous one.
    pub fn register_memory_notification_callback(
        &self,
        callback: Arc<dyn MemoryNotificationCallback>,
    ) {
        *write_lock!(self.callback) = Some(callback);
    }

    /// Admission for `bytes` on behalf of `thread`.
    pub(crate) fn admit(
        &self,
        thread: NativeThreadId,
        bytes: usize,
        level: MemoryCriticalLevel,
    ) -> Result<()> {
        if level.bypasses_budget() || self.domains.on_memory_acquiring(thread, bytes as u64) {
            return Ok(());
        }

        let callback = read_lock!(self.callback).clone();
        if let Some(callback) = callback {
            callback.on_low_memory(thread, bytes);
        }
        Err(Error::OutOfMemory { requested: bytes })
    }

    /// Reserves and/or commits virtual memory. Returns the page-aligned start of the range.
    ///
    /// With an `address` inside an existing reservation and [`AllocationType::COMMIT`], the
    /// covered pages are committed in place. Otherwise a new reservation is placed at the
    /// `address` hint (rounded down to [`ALLOCATION_GRANULARITY`]) or wherever it fits.
    /// Only pages that were not committed yet are charged.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a zero size, an empty `kind`, or an overlapping hint
    /// - [`Error::OutOfMemory`] if admission denies the commit
    pub fn virtual_alloc(
        &self,
        address: Option<u64>,
        size: usize,
        kind: AllocationType,
        protection: MemoryProtection,
        level: MemoryCriticalLevel,
    ) -> Result<u64> {
        if size == 0 || kind.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "virtual_alloc of {} bytes with {:?}",
                size, kind
            )));
        }

        let thread = NativeThreadId::current();
        let commit = kind.contains(AllocationType::COMMIT);
        let in_place = address.filter(|address| lock!(self.space).region_at(*address).is_some());

        let (start, base, committed) = match in_place {
            Some(address) => {
                if !commit {
                    return Err(Error::InvalidArgument(format!(
                        "{:#x} is already reserved",
                        address
                    )));
                }
                self.commit_in_place(thread, address, size, protection, level)?
            }
            None => {
                let length = page_ceil(size as u64);
                if commit {
                    self.admit(thread, length as usize, level)?;
                }
                let mut space = lock!(self.space);
                let base = space.place(address, length)?;
                let mut region = VirtualRegion::new(base, length, protection);
                let committed = if commit {
                    let range = region.page_range(base, length)?;
                    region.commit(range, protection)?
                } else {
                    0
                };
                space.regions.insert(base, region);
                (base, base, committed)
            }
        };

        if committed > 0 {
            self.domains.on_memory_acquire(thread, committed, base);
        }
        log::trace!(
            "virtual_alloc {:#x}+{:#x} {:?} ({} bytes committed)",
            start,
            size,
            kind,
            committed
        );
        Ok(start)
    }

    /// Commits the pages `[address, address + size)` touches inside an existing reservation.
    ///
    /// Admission covers exactly the pages that are not committed yet. The registry is never
    /// called with the address-space lock held, so if more pages became uncommitted between
    /// admission and commit, the larger amount is admitted again before committing.
    fn commit_in_place(
        &self,
        thread: NativeThreadId,
        address: u64,
        size: usize,
        protection: MemoryProtection,
        level: MemoryCriticalLevel,
    ) -> Result<(u64, u64, u64)> {
        let mut admitted = 0u64;
        loop {
            let needed = {
                let mut space = lock!(self.space);
                let region = space
                    .region_at_mut(address)
                    .ok_or_else(|| Error::NotFound(format!("no reservation at {:#x}", address)))?;
                let range = region.page_range(address, size as u64)?;
                let needed = region.uncommitted_bytes(range.clone());
                if needed <= admitted {
                    let committed = region.commit(range, protection)?;
                    return Ok((page_floor(address), region.base(), committed));
                }
                needed
            };
            self.admit(thread, needed as usize, level)?;
            admitted = needed;
        }
    }

    /// Decommits pages or releases a whole reservation.
    ///
    /// [`FreeType::Release`] needs the reservation's base address and a zero `size`.
    /// [`FreeType::Decommit`] with a zero `size` decommits to the end of the reservation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `address` is not reserved and [`Error::InvalidArgument`]
    /// for a malformed range.
    pub fn virtual_free(&self, address: u64, size: usize, free_type: FreeType) -> Result<()> {
        let mut space = lock!(self.space);
        match free_type {
            FreeType::Release => {
                if size != 0 {
                    return Err(Error::InvalidArgument(
                        "release requires a zero size".to_string(),
                    ));
                }
                if space.regions.remove(&address).is_none() {
                    return Err(Error::NotFound(format!("no reservation at {:#x}", address)));
                }
                drop(space);
                let released = self.domains.on_memory_release(address);
                log::trace!("virtual_free release {:#x} ({} bytes)", address, released);
            }
            FreeType::Decommit => {
                let region = space.region_at_mut(address).ok_or_else(|| {
                    Error::NotFound(format!("no reservation at {:#x}", address))
                })?;
                let range = region.page_range(address, size as u64)?;
                let base = region.base();
                let freed = region.decommit(range);
                drop(space);
                if freed > 0 {
                    self.domains.on_memory_release_partial(base, freed);
                }
                log::trace!("virtual_free decommit {:#x} ({} bytes)", address, freed);
            }
        }
        Ok(())
    }

    /// Describes the page containing `address`.
    pub fn virtual_query(&self, address: u64) -> RegionInfo {
        let space = lock!(self.space);
        match space.region_at(address) {
            Some(region) => region.query(address),
            None => RegionInfo {
                address: page_floor(address),
                allocation_base: page_floor(address),
                region_size: PAGE_SIZE as u64,
                state: RegionState::Free,
                protection: MemoryProtection::empty(),
            },
        }
    }

    /// Changes the protection of committed pages. Returns the previous protection of the first
    /// page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `address` is not reserved and [`Error::InvalidArgument`]
    /// if the range leaves the reservation or touches uncommitted pages.
    pub fn virtual_protect(
        &self,
        address: u64,
        size: usize,
        protection: MemoryProtection,
    ) -> Result<MemoryProtection> {
        let mut space = lock!(self.space);
        let region = space
            .region_at_mut(address)
            .ok_or_else(|| Error::NotFound(format!("no reservation at {:#x}", address)))?;
        let range = region.page_range(address, size.max(1) as u64)?;
        region.protect(range, protection)
    }

    /// Reads committed, readable virtual memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `address` is not reserved and [`Error::InvalidArgument`]
    /// if any byte is uncommitted, unreadable or outside the reservation.
    pub fn read_virtual(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let space = lock!(self.space);
        let region = space
            .region_at(address)
            .ok_or_else(|| Error::NotFound(format!("no reservation at {:#x}", address)))?;
        region.read(address, buf)
    }

    /// Writes committed, writable virtual memory. Nothing is written if any byte is refused.
    ///
    /// # Errors
    ///
    /// Same as [`MemoryManager::read_virtual`].
    pub fn write_virtual(&self, address: u64, data: &[u8]) -> Result<()> {
        let mut space = lock!(self.space);
        let region = space
            .region_at_mut(address)
            .ok_or_else(|| Error::NotFound(format!("no reservation at {:#x}", address)))?;
        region.write(address, data)
    }

    /// Committed bytes across all reservations.
    pub fn committed_bytes(&self) -> u64 {
        lock!(self.space)
            .regions
            .values()
            .map(VirtualRegion::committed_bytes)
            .sum()
    }

    /// Number of live reservations.
    pub fn region_count(&self) -> usize {
        lock!(self.space).regions.len()
    }

    /// The host never asks to place address-space mappings itself.
    pub fn needs_virtual_address_space(&self, _start: u64, _size: usize) -> bool {
        false
    }

    /// The runtime mapped `size` bytes at `start` on its own. Recorded, never denied.
    pub fn acquired_virtual_address_space(&self, start: u64, size: usize) {
        log::debug!("address space acquired {:#x}+{:#x}", start, size);
        self.domains
            .on_memory_acquire(NativeThreadId::current(), size as u64, start);
    }

    /// The runtime unmapped the view at `start`.
    pub fn released_virtual_address_space(&self, start: u64) {
        let released = self.domains.on_memory_release(start);
        log::debug!("address space released {:#x} ({} bytes)", start, released);
    }

    /// Current system memory load. Not scoped to any domain.
    ///
    /// # Errors
    ///
    /// See [`MemoryLoad::query`].
    pub fn memory_load(&self) -> Result<MemoryLoad> {
        MemoryLoad::query()
    }
}
