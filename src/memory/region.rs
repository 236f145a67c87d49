//! Virtual memory regions.
//!
//! A region is one reservation in the host's virtual address space: a page-aligned range whose
//! pages are individually committed, decommitted and protected. Committed pages own zeroed
//! backing storage; reserved pages own nothing.

use std::ops::Range;

use bitflags::bitflags;

use crate::{Error, Result};

/// Standard page size (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Reservations start on multiples of this (64KB).
pub const ALLOCATION_GRANULARITY: u64 = 0x10000;

bitflags! {
    /// Memory protection flags for virtual memory pages.
    ///
    /// These flags control what operations are permitted on a page. They are modeled after
    /// Windows `PAGE_*` protection constants.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemoryProtection: u32 {
        /// Page is readable.
        const READ = 0x01;
        /// Page is writable.
        const WRITE = 0x02;
        /// Page is executable.
        const EXECUTE = 0x04;
        /// Read and write access.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read, write, and execute access.
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
        /// Read and execute access.
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

impl MemoryProtection {
    /// Windows PAGE_* protection constants.
    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READONLY: u32 = 0x02;
    const PAGE_READWRITE: u32 = 0x04;
    const PAGE_EXECUTE: u32 = 0x10;
    const PAGE_EXECUTE_READ: u32 = 0x20;
    const PAGE_EXECUTE_READWRITE: u32 = 0x40;
    const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;

    /// Converts a Windows PAGE_* protection constant to `MemoryProtection` flags.
    ///
    /// Write-copy variants map to their writable equivalents.
    #[must_use]
    pub fn from_windows(page_protect: u32) -> Self {
        match page_protect & 0xFF {
            Self::PAGE_NOACCESS => Self::empty(),
            Self::PAGE_READONLY => Self::READ,
            Self::PAGE_EXECUTE => Self::EXECUTE,
            Self::PAGE_EXECUTE_READ => Self::READ_EXECUTE,
            Self::PAGE_EXECUTE_READWRITE | Self::PAGE_EXECUTE_WRITECOPY => Self::READ_WRITE_EXECUTE,
            _ => Self::READ_WRITE,
        }
    }

    /// Converts `MemoryProtection` flags to a Windows PAGE_* constant.
    #[must_use]
    pub fn to_windows(self) -> u32 {
        let r = self.contains(Self::READ);
        let w = self.contains(Self::WRITE);
        let x = self.contains(Self::EXECUTE);

        match (r, w, x) {
            (false, false, false) => Self::PAGE_NOACCESS,
            (true, false, false) => Self::PAGE_READONLY,
            (_, true, false) => Self::PAGE_READWRITE,
            (false, false, true) => Self::PAGE_EXECUTE,
            (true, false, true) => Self::PAGE_EXECUTE_READ,
            (_, true, true) => Self::PAGE_EXECUTE_READWRITE,
        }
    }
}

bitflags! {
    /// What a virtual allocation should do with its range.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AllocationType: u32 {
        /// Back the pages with storage. Implies a reservation for a new range.
        const COMMIT = 0x1000;
        /// Reserve address space only.
        const RESERVE = 0x2000;
    }
}

/// How [`crate::memory::MemoryManager::virtual_free`] treats a range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreeType {
    /// Drop the backing storage but keep the reservation.
    Decommit,
    /// Drop the whole reservation.
    Release,
}

/// State of a page as reported by a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionState {
    /// Not part of any reservation.
    Free,
    /// Reserved without storage.
    Reserved,
    /// Reserved and backed.
    Committed,
}

/// Result of a virtual memory query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    /// Page-aligned address that was queried.
    pub address: u64,
    /// Start of the reservation containing it, or the page itself when free.
    pub allocation_base: u64,
    /// Size of the reservation, or of one page when free.
    pub region_size: u64,
    /// State of the queried page.
    pub state: RegionState,
    /// Protection of the queried page.
    pub protection: MemoryProtection,
}

/// Rounds `value` down to a page boundary.
#[must_use]
pub fn page_floor(value: u64) -> u64 {
    value & !(PAGE_SIZE as u64 - 1)
}

/// Rounds `value` up to a page boundary.
#[must_use]
pub fn page_ceil(value: u64) -> u64 {
    value.saturating_add(PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

struct RegionPage {
    data: Option<Box<[u8]>>,
    protection: MemoryProtection,
}

/// One reservation.
pub(crate) struct VirtualRegion {
    base: u64,
    pages: Vec<RegionPage>,
}

impl VirtualRegion {
    pub(crate) fn new(base: u64, size: u64, protection: MemoryProtection) -> Self {
        let count = (page_ceil(size) / PAGE_SIZE as u64) as usize;
        let pages = (0..count)
            .map(|_| RegionPage {
                data: None,
                protection,
            })
            .collect();
        Self { base, pages }
    }

    pub(crate) fn base(&self) -> u64 {
        self.base
    }

    pub(crate) fn size(&self) -> u64 {
        (self.pages.len() * PAGE_SIZE) as u64
    }

    pub(crate) fn end(&self) -> u64 {
        self.base + self.size()
    }

    pub(crate) fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }

    pub(crate) fn committed_bytes(&self) -> u64 {
        self.pages.iter().filter(|page| page.data.is_some()).count() as u64 * PAGE_SIZE as u64
    }

    /// Page indices covering `[address, address + len)`. `len == 0` means "to the end".
    pub(crate) fn page_range(&self, address: u64, len: u64) -> Result<Range<usize>> {
        if !self.contains(address) {
            return Err(Error::InvalidArgument(format!(
                "{:#x} is outside the region at {:#x}",
                address, self.base
            )));
        }
        let end = if len == 0 {
            self.end()
        } else {
            page_ceil(address.saturating_add(len))
        };
        if end > self.end() {
            return Err(Error::InvalidArgument(format!(
                "range {:#x}+{:#x} runs past the region end {:#x}",
                address,
                len,
                self.end()
            )));
        }
        let first = ((page_floor(address) - self.base) / PAGE_SIZE as u64) as usize;
        let last = ((end - self.base) / PAGE_SIZE as u64) as usize;
        Ok(first..last)
    }

    /// Bytes in `range` that are not committed yet.
    pub(crate) fn uncommitted_bytes(&self, range: Range<usize>) -> u64 {
        self.pages[range]
            .iter()
            .filter(|page| page.data.is_none())
            .count() as u64
            * PAGE_SIZE as u64
    }

    /// Backs the pages in `range` and applies `protection` to them. Returns the newly
    /// committed byte count.
    pub(crate) fn commit(
        &mut self,
        range: Range<usize>,
        protection: MemoryProtection,
    ) -> Result<u64> {
        let mut committed = 0u64;
        for page in &mut self.pages[range] {
            if page.data.is_none() {
                let mut storage = Vec::new();
                storage
                    .try_reserve_exact(PAGE_SIZE)
                    .map_err(|_| Error::OutOfMemory {
                        requested: PAGE_SIZE,
                    })?;
                storage.resize(PAGE_SIZE, 0);
                page.data = Some(storage.into_boxed_slice());
                committed += PAGE_SIZE as u64;
            }
            page.protection = protection;
        }
        Ok(committed)
    }

    /// Drops the storage of the pages in `range`. Returns the released byte count.
    pub(crate) fn decommit(&mut self, range: Range<usize>) -> u64 {
        self.pages[range]
            .iter_mut()
            .filter_map(|page| page.data.take())
            .map(|data| data.len() as u64)
            .sum()
    }

    /// Sets the protection of committed pages in `range`. Returns the first page's previous
    /// protection.
    pub(crate) fn protect(
        &mut self,
        range: Range<usize>,
        protection: MemoryProtection,
    ) -> Result<MemoryProtection> {
        if self.pages[range.clone()]
            .iter()
            .any(|page| page.data.is_none())
        {
            return Err(Error::InvalidArgument(
                "protection change on uncommitted pages".to_string(),
            ));
        }
        let previous = self.pages[range.start].protection;
        for page in &mut self.pages[range] {
            page.protection = protection;
        }
        Ok(previous)
    }

    pub(crate) fn query(&self, address: u64) -> RegionInfo {
        let index = ((address - self.base) / PAGE_SIZE as u64) as usize;
        let page = &self.pages[index];
        RegionInfo {
            address: page_floor(address),
            allocation_base: self.base,
            region_size: self.size(),
            state: if page.data.is_some() {
                RegionState::Committed
            } else {
                RegionState::Reserved
            },
            protection: page.protection,
        }
    }

    /// Copies bytes out of committed, readable pages.
    pub(crate) fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let current = address + done as u64;
            let (page, offset) = self.page_at(current, MemoryProtection::READ)?;
            let count = (PAGE_SIZE - offset).min(buf.len() - done);
            buf[done..done + count].copy_from_slice(&page[offset..offset + count]);
            done += count;
        }
        Ok(())
    }

    /// Copies bytes into committed, writable pages.
    pub(crate) fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        // Check the whole range first so a failing write changes nothing.
        let mut checked = 0usize;
        while checked < data.len() {
            let current = address + checked as u64;
            let (_, offset) = self.page_at(current, MemoryProtection::WRITE)?;
            checked += PAGE_SIZE - offset;
        }

        let mut done = 0usize;
        while done < data.len() {
            let current = address + done as u64;
            let index = ((current - self.base) / PAGE_SIZE as u64) as usize;
            let offset = (current % PAGE_SIZE as u64) as usize;
            let count = (PAGE_SIZE - offset).min(data.len() - done);
            if let Some(page) = self.pages[index].data.as_mut() {
                page[offset..offset + count].copy_from_slice(&data[done..done + count]);
            }
            done += count;
        }
        Ok(())
    }

    fn page_at(&self, address: u64, access: MemoryProtection) -> Result<(&[u8], usize)> {
        if !self.contains(address) {
            return Err(Error::InvalidArgument(format!(
                "access at {:#x} runs past the region end {:#x}",
                address,
                self.end()
            )));
        }
        let index = ((address - self.base) / PAGE_SIZE as u64) as usize;
        let page = &self.pages[index];
        let data = page.data.as_deref().ok_or_else(|| {
            Error::InvalidArgument(format!("access to uncommitted page at {:#x}", address))
        })?;
        if !page.protection.contains(access) {
            return Err(Error::InvalidArgument(format!(
                "{:?} access denied at {:#x} ({:?})",
                access, address, page.protection
            )));
        }
        Ok((data, (address % PAGE_SIZE as u64) as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_protection_round_trip() {
        assert_eq!(MemoryProtection::from_windows(0x20), MemoryProtection::READ_EXECUTE);
        assert_eq!(MemoryProtection::from_windows(0x01), MemoryProtection::empty());
        assert_eq!(MemoryProtection::READ.to_windows(), 0x02);
        assert_eq!(MemoryProtection::READ_WRITE_EXECUTE.to_windows(), 0x40);
    }

    #[test]
    fn test_page_rounding() {
        assert_eq!(page_floor(0x1fff), 0x1000);
        assert_eq!(page_ceil(0x1001), 0x2000);
        assert_eq!(page_ceil(0x2000), 0x2000);
    }

    #[test]
    fn test_commit_decommit() {
        let mut region = VirtualRegion::new(0x10000, 3 * PAGE_SIZE as u64, MemoryProtection::READ);
        assert_eq!(region.size(), 3 * PAGE_SIZE as u64);
        let range = region.page_range(0x10000 + 10, 10).unwrap();
        assert_eq!(range, 0..1);

        assert_eq!(
            region.commit(0..2, MemoryProtection::READ_WRITE).unwrap(),
            2 * PAGE_SIZE as u64
        );
        assert_eq!(region.commit(0..2, MemoryProtection::READ_WRITE).unwrap(), 0);
        assert_eq!(region.query(0x10000).state, RegionState::Committed);
        assert_eq!(region.query(0x12000).state, RegionState::Reserved);
        assert_eq!(region.decommit(1..3), PAGE_SIZE as u64);
        assert_eq!(region.committed_bytes(), PAGE_SIZE as u64);
    }

    #[test]
    fn test_range_validation() {
        let region = VirtualRegion::new(0x10000, PAGE_SIZE as u64, MemoryProtection::READ);
        assert!(region.page_range(0x20000, 1).is_err());
        assert!(region.page_range(0x10000, 2 * PAGE_SIZE as u64).is_err());
        assert_eq!(region.page_range(0x10000, 0).unwrap(), 0..1);
    }

    #[test]
    fn test_read_write_protection() {
        let mut region =
            VirtualRegion::new(0x10000, 2 * PAGE_SIZE as u64, MemoryProtection::READ_WRITE);
        region.commit(0..2, MemoryProtection::READ_WRITE).unwrap();

        let address = 0x10000 + PAGE_SIZE as u64 - 2;
        region.write(address, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        region.read(address, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        assert_eq!(
            region.protect(1..2, MemoryProtection::READ).unwrap(),
            MemoryProtection::READ_WRITE
        );
        assert!(region.write(address, &[9, 9, 9, 9]).is_err());
        region.read(address, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_uncommitted_access_fails() {
        let mut region = VirtualRegion::new(0x10000, PAGE_SIZE as u64, MemoryProtection::READ_WRITE);
        let mut buf = [0u8; 1];
        assert!(region.read(0x10000, &mut buf).is_err());
        assert!(region.protect(0..1, MemoryProtection::READ).is_err());
        assert!(region.write(0x10000, &[1]).is_err());
    }
}
