// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process protocol state and its lifecycle on one node
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//!
//! A [`ProcessContext`] bundles everything the coherence protocol keeps per
//! distributed process on one node: the address-space model, the ownership
//! index, and the fault coordination table. A node holds one context per
//! process it participates in, in two flavours: origin contexts for
//! processes born here whose threads run remotely, and remote contexts for
//! processes born elsewhere whose threads (or page requests) arrive here.
//!
//! Contexts are reference counted; in-flight fault handles pin their
//! context alive, so a detach makes the context unreachable for new work
//! while pending resolutions drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::config::DsmConfig;
use crate::faults::FaultTable;
use crate::memory::AddressSpace;
use crate::ownership::OwnershipIndex;
use crate::{NodeId, Tgid};

/// Protocol state for one distributed process on one node.
pub struct ProcessContext {
    tgid: Tgid,
    origin: NodeId,
    remote: bool,
    pub mm: Arc<AddressSpace>,
    pub ownership: OwnershipIndex,
    pub faults: FaultTable,
    fault_seq: AtomicU64,
}

impl ProcessContext {
    fn new(
        tgid: Tgid,
        origin: NodeId,
        remote: bool,
        mm: Arc<AddressSpace>,
        local: NodeId,
        cfg: &DsmConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tgid,
            origin,
            remote,
            mm,
            ownership: OwnershipIndex::new(local),
            faults: FaultTable::new(cfg),
            fault_seq: AtomicU64::new(0),
        })
    }

    /// Thread-group id assigned at the origin node.
    pub fn tgid(&self) -> Tgid {
        self.tgid
    }

    /// The node the process was born on.
    pub fn origin(&self) -> NodeId {
        self.origin
    }

    /// Whether this context hosts a process born on another node.
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Bumps and returns the per-context fault sequence number. Drives the
    /// prefetch cadence gate.
    pub fn next_fault_seq(&self) -> u64 {
        self.fault_seq.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// All process contexts known to one node.
pub struct ContextTable {
    local: NodeId,
    cfg: DsmConfig,
    origins: Mutex<Vec<Arc<ProcessContext>>>,
    remotes: Mutex<Vec<Arc<ProcessContext>>>,
}

fn find_in(list: &[Arc<ProcessContext>], tgid: Tgid) -> Option<Arc<ProcessContext>> {
    list.iter().find(|ctx| ctx.tgid() == tgid).cloned()
}

impl ContextTable {
    pub fn new(local: NodeId, cfg: DsmConfig) -> Self {
        Self {
            local,
            cfg,
            origins: Mutex::new(Vec::new()),
            remotes: Mutex::new(Vec::new()),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    pub fn config(&self) -> &DsmConfig {
        &self.cfg
    }

    /// Registers a process born on this node. Idempotent per tgid; a second
    /// attach returns the existing context.
    pub fn attach_origin(&self, tgid: Tgid, mm: Arc<AddressSpace>) -> Arc<ProcessContext> {
        let mut origins = self.origins.lock();
        if let Some(existing) = find_in(&origins, tgid) {
            return existing;
        }
        debug!("attach origin context tgid={} on node {}", tgid, self.local);
        let ctx = ProcessContext::new(tgid, self.local, false, mm, self.local, &self.cfg);
        origins.push(Arc::clone(&ctx));
        ctx
    }

    /// Finds the remote context for `tgid`, creating it on first arrival.
    /// `provision` supplies the address space for a fresh context; it runs
    /// only on creation, under the table lock.
    pub fn lookup_or_create_remote(
        &self,
        tgid: Tgid,
        origin: NodeId,
        provision: impl FnOnce() -> Arc<AddressSpace>,
    ) -> Arc<ProcessContext> {
        let mut remotes = self.remotes.lock();
        if let Some(existing) = find_in(&remotes, tgid) {
            return existing;
        }
        debug!(
            "attach remote context tgid={} origin={} on node {}",
            tgid, origin, self.local
        );
        let ctx = ProcessContext::new(tgid, origin, true, provision(), self.local, &self.cfg);
        remotes.push(Arc::clone(&ctx));
        ctx
    }

    /// Looks up a context by tgid, either flavour.
    pub fn find(&self, tgid: Tgid) -> Option<Arc<ProcessContext>> {
        if let Some(ctx) = find_in(&self.origins.lock(), tgid) {
            return Some(ctx);
        }
        find_in(&self.remotes.lock(), tgid)
    }

    /// Unregisters a context. New lookups stop resolving it immediately;
    /// fault handles still in flight keep the context itself alive until
    /// they drain. Returns whether anything was removed.
    pub fn detach(&self, tgid: Tgid) -> bool {
        let mut removed = false;
        for list in [&self.origins, &self.remotes] {
            let mut list = list.lock();
            let before = list.len();
            list.retain(|ctx| ctx.tgid() != tgid);
            removed |= list.len() != before;
        }
        if removed {
            debug!("detached context tgid={} on node {}", tgid, self.local);
        }
        removed
    }

    /// Number of registered contexts, both flavours.
    pub fn len(&self) -> usize {
        self.origins.lock().len() + self.remotes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn attach_origin_is_idempotent() {
        let table = ContextTable::new(NodeId(0), DsmConfig::default());
        let mm = Arc::new(AddressSpace::new());
        let a = table.attach_origin(42, Arc::clone(&mm));
        let b = table.attach_origin(42, Arc::new(AddressSpace::new()));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
        assert!(!a.is_remote());
        assert_eq!(a.origin(), NodeId(0));
    }

    #[test]
    fn remote_lookup_provisions_once() {
        let table = ContextTable::new(NodeId(1), DsmConfig::default());
        let mut provisioned = 0;
        let a = table.lookup_or_create_remote(7, NodeId(0), || {
            provisioned += 1;
            Arc::new(AddressSpace::new())
        });
        let b = table.lookup_or_create_remote(7, NodeId(0), || {
            provisioned += 1;
            Arc::new(AddressSpace::new())
        });
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provisioned, 1);
        assert!(a.is_remote());
        assert_eq!(a.origin(), NodeId(0));
    }

    #[test]
    fn find_spans_both_flavours_and_detach_removes() {
        let table = ContextTable::new(NodeId(0), DsmConfig::default());
        table.attach_origin(1, Arc::new(AddressSpace::new()));
        table.lookup_or_create_remote(2, NodeId(3), || Arc::new(AddressSpace::new()));

        assert!(table.find(1).is_some());
        assert!(table.find(2).is_some());
        assert!(table.find(9).is_none());

        assert!(table.detach(2));
        assert!(table.find(2).is_none());
        assert!(!table.detach(2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn detached_context_survives_while_referenced() {
        let table = ContextTable::new(NodeId(0), DsmConfig::default());
        let ctx = table.attach_origin(5, Arc::new(AddressSpace::new()));
        assert!(table.detach(5));
        // Still usable through the retained handle.
        assert_eq!(ctx.tgid(), 5);
        assert_eq!(ctx.next_fault_seq(), 1);
        assert_eq!(ctx.next_fault_seq(), 2);
    }
}
