// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Opportunistic prefetch around a faulting page
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//!
//! After a fault on address A, the pages following A are candidates for
//! riding along on the same fetch request. Selection must never block the
//! fault that triggered it: every lock in the cascade is a try-lock, and
//! any contention simply drops the candidate. A selected candidate gets a
//! leader fault handle with the prefetch flag, so concurrent genuine
//! faults on it join as followers instead of issuing their own fetch.

use std::sync::Arc;

use log::trace;

use crate::config::DsmConfig;
use crate::context::ProcessContext;
use crate::faults::{FaultHandle, FAULT_PREFETCH};
use crate::{page_align, PAGE_SIZE};

/// Cadence gate and window geometry for prefetch selection.
pub struct PrefetchPolicy {
    window: usize,
    skip: usize,
    cadence: u32,
}

impl PrefetchPolicy {
    pub fn new(cfg: &DsmConfig) -> Self {
        Self {
            window: cfg.prefetch_window,
            skip: cfg.prefetch_skip,
            cadence: cfg.prefetch_cadence,
        }
    }

    /// Whether the fault with this per-context sequence number should
    /// attempt prefetch. Cadence 0 disables prefetch entirely.
    pub fn should_run(&self, fault_seq: u64) -> bool {
        self.cadence != 0 && self.window != 0 && fault_seq % self.cadence as u64 == 0
    }

    /// Walks the window after `fault_addr` and claims a leader handle for
    /// every page that survives the try-lock cascade. Candidates are
    /// dropped, never waited for: unmapped address, no page-table entry,
    /// contended entry or bucket lock, an existing handle, or a page this
    /// node already holds. A full fault table stops selection early.
    pub fn select(
        &self,
        ctx: &Arc<ProcessContext>,
        fault_addr: u64,
    ) -> Vec<Arc<FaultHandle>> {
        let base = page_align(fault_addr);
        let mut picked = Vec::with_capacity(self.window);
        for i in 0..self.window {
            let addr = base + (self.skip + i) as u64 * PAGE_SIZE as u64;
            if ctx.mm.find_region(addr).is_none() {
                continue;
            }
            let Some(pte) = ctx.mm.pte_try_lock(addr) else {
                continue;
            };
            let Some(entry) = pte.entry() else {
                continue;
            };
            if entry.present && ctx.ownership.is_owned_locally(addr) {
                continue;
            }
            let Some(mut bucket) = ctx.faults.try_lock_bucket(addr) else {
                continue;
            };
            if bucket.find(addr).is_some() {
                continue;
            }
            match bucket.insert_leader(ctx, addr, FAULT_PREFETCH) {
                Ok(fh) => {
                    trace!("prefetch pick {:#x}", addr);
                    picked.push(fh);
                }
                Err(_) => break,
            }
        }
        picked
    }
}
