// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sparse per-page ownership index for a distributed address space
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//!
//! One 64-bit word per page: bits 0..=62 mark which node owns the page,
//! bit 63 marks the page as distributed (it has left local-only status at
//! least once). A page with no word, or with the distributed bit clear, is
//! locally owned by definition; ownership metadata only exists for pages
//! that have actually migrated. Words are grouped into lazily allocated
//! regions so metadata cost tracks touched pages, not address-space size.
//!
//! The index does not enforce single ownership itself. Callers mutate it
//! from fault-completion paths only, while the page's resolution is held
//! exclusively (an in-flight fault handle, or the owner-side bucket lock),
//! clearing the previous owner's bit in the same critical section they set
//! the new one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::{page_align, NodeId, MAX_NODES, PAGE_SHIFT, PAGE_SIZE};

/// Bit reserved in every ownership word for "this page has become
/// distributed".
const DISTRIBUTED_BIT: u32 = 63;

/// Ownership words per region: one metadata page's worth.
const REGION_ENTRIES: usize = PAGE_SIZE / std::mem::size_of::<u64>();

struct Region {
    words: Box<[AtomicU64]>,
}

impl Region {
    fn new() -> Self {
        let words = (0..REGION_ENTRIES)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { words }
    }
}

/// Sparse map from page address to ownership word.
pub struct OwnershipIndex {
    local: NodeId,
    regions: RwLock<HashMap<u64, Region>>,
}

fn region_key(addr: u64) -> (u64, usize) {
    let pfn = addr >> PAGE_SHIFT;
    (
        pfn / REGION_ENTRIES as u64,
        (pfn % REGION_ENTRIES as u64) as usize,
    )
}

impl OwnershipIndex {
    pub fn new(local: NodeId) -> Self {
        debug_assert!(local.index() < MAX_NODES);
        Self {
            local,
            regions: RwLock::new(HashMap::new()),
        }
    }

    /// The node this index belongs to.
    pub fn local_node(&self) -> NodeId {
        self.local
    }

    fn load_word(&self, addr: u64) -> Option<u64> {
        let (key, offset) = region_key(page_align(addr));
        let regions = self.regions.read();
        regions
            .get(&key)
            .map(|r| r.words[offset].load(Ordering::Acquire))
    }

    /// Runs `f` against the ownership word for `addr`, allocating and
    /// zero-filling the region on first touch.
    fn with_word<T>(&self, addr: u64, f: impl FnOnce(&AtomicU64) -> T) -> T {
        let (key, offset) = region_key(page_align(addr));
        {
            let regions = self.regions.read();
            if let Some(region) = regions.get(&key) {
                return f(&region.words[offset]);
            }
        }
        let mut regions = self.regions.write();
        let region = regions.entry(key).or_insert_with(Region::new);
        f(&region.words[offset])
    }

    /// True when the page has never been marked distributed, or when the
    /// local node's ownership bit is set.
    pub fn is_owned_locally(&self, addr: u64) -> bool {
        match self.load_word(addr) {
            None => true,
            Some(word) => {
                if word & (1 << DISTRIBUTED_BIT) == 0 {
                    true
                } else {
                    word & (1 << self.local.index()) != 0
                }
            }
        }
    }

    /// Whether the page has ever left local-only status.
    pub fn is_distributed(&self, addr: u64) -> bool {
        self.load_word(addr)
            .map(|w| w & (1 << DISTRIBUTED_BIT) != 0)
            .unwrap_or(false)
    }

    /// The recorded owner of a distributed page. `None` for pages that are
    /// still local-only (no metadata, or distributed bit clear) and for the
    /// transient no-owner window inside a hand-off.
    pub fn owner_of(&self, addr: u64) -> Option<NodeId> {
        let word = self.load_word(addr)?;
        if word & (1 << DISTRIBUTED_BIT) == 0 {
            return None;
        }
        (0..MAX_NODES as u32)
            .find(|bit| word & (1u64 << bit) != 0)
            .map(|bit| NodeId(bit as u16))
    }

    /// Marks the page distributed. Idempotent.
    pub fn mark_distributed(&self, addr: u64) {
        self.with_word(addr, |w| {
            w.fetch_or(1 << DISTRIBUTED_BIT, Ordering::AcqRel);
        });
    }

    /// Sets `node`'s ownership bit. The caller clears the previous owner in
    /// the same critical section; the index does not do it.
    pub fn set_owner(&self, node: NodeId, addr: u64) {
        debug_assert!(node.index() < MAX_NODES);
        self.with_word(addr, |w| {
            w.fetch_or(1u64 << node.index(), Ordering::AcqRel);
        });
    }

    /// Clears `node`'s ownership bit.
    pub fn clear_owner(&self, node: NodeId, addr: u64) {
        self.with_word(addr, |w| {
            w.fetch_and(!(1u64 << node.index()), Ordering::AcqRel);
        });
    }

    /// Number of ownership regions currently allocated.
    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }
}
