// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal address-space model backing the coherence protocol
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//!
//! Stands in for the host kernel's memory manager: mapped VM regions with
//! bounds, page-table entries carrying a present/writable state and a page
//! frame, and per-entry locks that the protocol's non-blocking paths probe
//! with `try_lock`. Entry locks are striped; two pages may share a stripe,
//! which only ever makes the non-blocking paths more conservative.

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::{page_align, DsmError, PAGE_SHIFT, PAGE_SIZE};

const PT_STRIPES: usize = 64;

fn stripe_of(addr: u64) -> usize {
    ((addr >> PAGE_SHIFT) % PT_STRIPES as u64) as usize
}

/// One mapped virtual-memory region, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmRegion {
    pub start: u64,
    pub end: u64,
}

impl VmRegion {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// A page-table entry: validity bits plus the backing frame.
#[derive(Debug)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    frame: Box<[u8; PAGE_SIZE]>,
}

impl PageEntry {
    fn empty() -> Self {
        Self {
            present: false,
            writable: false,
            frame: Box::new([0u8; PAGE_SIZE]),
        }
    }

    pub fn frame(&self) -> &[u8; PAGE_SIZE] {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.frame
    }
}

/// Process address space shared by every local thread of the process.
pub struct AddressSpace {
    regions: RwLock<Vec<VmRegion>>,
    stripes: Box<[Mutex<HashMap<u64, PageEntry>>]>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        let stripes = (0..PT_STRIPES)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            regions: RwLock::new(Vec::new()),
            stripes,
        }
    }

    /// Maps `[start, start + len)`. Both bounds must be page aligned.
    pub fn map_region(&self, start: u64, len: u64) -> Result<(), DsmError> {
        if start != page_align(start) {
            return Err(DsmError::Misaligned(start));
        }
        if len == 0 || len % PAGE_SIZE as u64 != 0 {
            return Err(DsmError::Misaligned(len));
        }
        let region = VmRegion {
            start,
            end: start + len,
        };
        let mut regions = self.regions.write();
        if let Some(existing) = regions
            .iter()
            .find(|r| r.start < region.end && region.start < r.end)
        {
            return Err(DsmError::Overlap(existing.start));
        }
        regions.push(region);
        Ok(())
    }

    /// Whether `addr` falls inside a mapped region.
    pub fn contains(&self, addr: u64) -> bool {
        self.regions.read().iter().any(|r| r.contains(addr))
    }

    /// The region covering `addr`, if any.
    pub fn find_region(&self, addr: u64) -> Option<VmRegion> {
        self.regions.read().iter().copied().find(|r| r.contains(addr))
    }

    /// Creates empty (not-present) page-table entries for a range, modeling
    /// page-table pages that exist before any frame is installed. Prefetch
    /// candidates without an entry are never selected.
    pub fn reserve_range(&self, start: u64, len: u64) -> Result<(), DsmError> {
        if start != page_align(start) || len % PAGE_SIZE as u64 != 0 {
            return Err(DsmError::Misaligned(start));
        }
        let mut addr = start;
        while addr < start + len {
            if !self.contains(addr) {
                return Err(DsmError::NotMapped(addr));
            }
            let mut map = self.stripes[stripe_of(addr)].lock();
            map.entry(addr).or_insert_with(PageEntry::empty);
            addr += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Installs a present, writable entry with the given contents. This is
    /// the initial state of pages at the process's origin node.
    pub fn populate(&self, addr: u64, bytes: &[u8]) -> Result<(), DsmError> {
        let addr = page_align(addr);
        if !self.contains(addr) {
            return Err(DsmError::NotMapped(addr));
        }
        let mut guard = self.pte_lock(addr);
        guard.install(bytes, true);
        Ok(())
    }

    /// Locks the page-table entry slot for `addr`, blocking.
    pub fn pte_lock(&self, addr: u64) -> PteGuard<'_> {
        let addr = page_align(addr);
        PteGuard {
            map: self.stripes[stripe_of(addr)].lock(),
            addr,
        }
    }

    /// Locks the page-table entry slot for `addr` only if immediately free.
    pub fn pte_try_lock(&self, addr: u64) -> Option<PteGuard<'_>> {
        let addr = page_align(addr);
        self.stripes[stripe_of(addr)]
            .try_lock()
            .map(|map| PteGuard { map, addr })
    }

    /// Whether a page-table entry exists for `addr` (present or not).
    pub fn has_pte(&self, addr: u64) -> bool {
        let addr = page_align(addr);
        self.stripes[stripe_of(addr)].lock().contains_key(&addr)
    }

    /// Whether a present entry exists for `addr`.
    pub fn page_present(&self, addr: u64) -> bool {
        let addr = page_align(addr);
        self.stripes[stripe_of(addr)]
            .lock()
            .get(&addr)
            .map(|e| e.present)
            .unwrap_or(false)
    }

    /// Copies out the page contents if present. Test and diagnostics aid.
    pub fn read_page(&self, addr: u64) -> Option<Vec<u8>> {
        let guard = self.pte_lock(addr);
        guard.copy_out()
    }
}

/// Exclusive access to one page-table entry slot.
pub struct PteGuard<'a> {
    map: MutexGuard<'a, HashMap<u64, PageEntry>>,
    addr: u64,
}

impl PteGuard<'_> {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn entry(&self) -> Option<&PageEntry> {
        self.map.get(&self.addr)
    }

    pub fn entry_mut(&mut self) -> Option<&mut PageEntry> {
        self.map.get_mut(&self.addr)
    }

    /// Installs page contents, allocating the entry if none is mapped yet,
    /// and validates it with the requested write permission.
    pub fn install(&mut self, bytes: &[u8], writable: bool) {
        let entry = self
            .map
            .entry(self.addr)
            .or_insert_with(PageEntry::empty);
        let n = bytes.len().min(PAGE_SIZE);
        entry.frame[..n].copy_from_slice(&bytes[..n]);
        entry.frame[n..].fill(0);
        entry.present = true;
        entry.writable = writable;
    }

    /// Clears the entry's validity so any later access faults. The frame
    /// stays allocated; its contents are no longer authoritative.
    pub fn invalidate(&mut self) {
        if let Some(entry) = self.map.get_mut(&self.addr) {
            entry.present = false;
            entry.writable = false;
        }
    }

    /// Upgrades a present entry to writable.
    pub fn make_writable(&mut self) {
        if let Some(entry) = self.map.get_mut(&self.addr) {
            if entry.present {
                entry.writable = true;
            }
        }
    }

    /// Copies the page contents out if the entry is present.
    pub fn copy_out(&self) -> Option<Vec<u8>> {
        self.map
            .get(&self.addr)
            .filter(|e| e.present)
            .map(|e| e.frame.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_populate_and_read_back() {
        let mm = AddressSpace::new();
        mm.map_region(0x1000, 4 * PAGE_SIZE as u64).expect("map");
        assert!(mm.contains(0x1000));
        assert!(!mm.contains(0x0));

        mm.populate(0x2000, b"hello").expect("populate");
        let page = mm.read_page(0x2000).expect("present");
        assert_eq!(&page[..5], b"hello");
        assert!(mm.page_present(0x2000));
        assert!(!mm.page_present(0x1000));
    }

    #[test]
    fn overlapping_regions_rejected() {
        let mm = AddressSpace::new();
        mm.map_region(0x1000, 2 * PAGE_SIZE as u64).expect("map");
        assert!(matches!(
            mm.map_region(0x2000, PAGE_SIZE as u64),
            Err(DsmError::Overlap(_))
        ));
    }

    #[test]
    fn invalidate_clears_validity_but_keeps_entry() {
        let mm = AddressSpace::new();
        mm.map_region(0x0, PAGE_SIZE as u64).expect("map");
        mm.populate(0x0, &[7u8; 16]).expect("populate");

        let mut guard = mm.pte_lock(0x0);
        guard.invalidate();
        drop(guard);

        assert!(mm.has_pte(0x0));
        assert!(!mm.page_present(0x0));
        assert!(mm.read_page(0x0).is_none());
    }

    #[test]
    fn try_lock_fails_while_stripe_held() {
        let mm = AddressSpace::new();
        mm.map_region(0x0, PAGE_SIZE as u64).expect("map");
        let _held = mm.pte_lock(0x0);
        assert!(mm.pte_try_lock(0x0).is_none());
    }

    #[test]
    fn write_upgrade_requires_present_entry() {
        let mm = AddressSpace::new();
        mm.map_region(0x0, 2 * PAGE_SIZE as u64).expect("map");
        mm.reserve_range(0x0, 2 * PAGE_SIZE as u64).expect("reserve");

        let mut guard = mm.pte_lock(0x0);
        guard.make_writable();
        assert!(!guard.entry().map(|e| e.writable).unwrap_or(true));
        guard.install(b"x", false);
        guard.make_writable();
        assert!(guard.entry().map(|e| e.writable).unwrap_or(false));
    }
}
