// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Property tests for the ownership index invariants.

use std::collections::HashSet;

use proptest::prelude::*;

use dsm::{page_align, NodeId, OwnershipIndex, PAGE_SHIFT, PAGE_SIZE};

proptest! {
    #[test]
    fn page_align_is_an_idempotent_floor(addr in any::<u64>()) {
        let aligned = page_align(addr);
        prop_assert_eq!(aligned % PAGE_SIZE as u64, 0);
        prop_assert!(aligned <= addr);
        prop_assert!(addr - aligned < PAGE_SIZE as u64);
        prop_assert_eq!(page_align(aligned), aligned);
    }

    #[test]
    fn transfer_chains_preserve_single_ownership(
        pfn in 0u64..(1 << 20),
        owners in proptest::collection::vec(0u16..8, 1..16),
    ) {
        let addr = pfn << PAGE_SHIFT;
        let local = NodeId(0);
        let index = OwnershipIndex::new(local);
        index.mark_distributed(addr);

        let mut prev: Option<NodeId> = None;
        for id in owners {
            let next = NodeId(id);
            // Clear-then-set in one logical hand-off, as the fault
            // completion paths do.
            if let Some(prev) = prev {
                index.clear_owner(prev, addr);
            }
            index.set_owner(next, addr);
            prev = Some(next);

            prop_assert_eq!(index.owner_of(addr), Some(next));
            prop_assert_eq!(index.is_owned_locally(addr), next == local);
            prop_assert!(index.is_distributed(addr));
        }
    }

    #[test]
    fn untouched_neighbours_stay_local(pfn in 1u64..(1 << 20)) {
        let index = OwnershipIndex::new(NodeId(2));
        let addr = pfn << PAGE_SHIFT;
        index.mark_distributed(addr);
        index.set_owner(NodeId(0), addr);

        for neighbour in [(pfn - 1) << PAGE_SHIFT, (pfn + 1) << PAGE_SHIFT] {
            prop_assert!(index.is_owned_locally(neighbour));
            prop_assert!(!index.is_distributed(neighbour));
            prop_assert_eq!(index.owner_of(neighbour), None);
        }
    }

    #[test]
    fn region_allocation_tracks_touched_regions_exactly(
        pfns in proptest::collection::vec(0u64..(1 << 16), 1..64),
    ) {
        let index = OwnershipIndex::new(NodeId(0));
        for &pfn in &pfns {
            index.mark_distributed(pfn << PAGE_SHIFT);
        }
        let regions: HashSet<u64> =
            pfns.iter().map(|pfn| pfn / (PAGE_SIZE as u64 / 8)).collect();
        prop_assert_eq!(index.region_count(), regions.len());
    }
}
