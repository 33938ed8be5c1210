// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fault coordination table — per-page mutual exclusion for fault resolution
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests here; concurrency scenarios in dsm/tests
//!
//! A hashed table of in-flight fault handles, one handle per (address,
//! context) at any instant. The first faulter on an address becomes the
//! leader and performs the resolution; concurrent faulters join as
//! followers and block until the leader's outcome is published. Buckets
//! carry their own locks so unrelated addresses proceed in parallel, and
//! every handle's condvars pair with its bucket's mutex.
//!
//! Lock order: a page-table entry lock may be held while taking a bucket
//! lock, never the reverse.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::DsmConfig;
use crate::context::ProcessContext;
use crate::proto::FetchResult;
use crate::{DsmError, PAGE_SHIFT};

/// The faulting access wants write permission.
pub const FAULT_WRITE: u32 = 0x01;
/// The handle was claimed by the prefetch selector, nobody blocks on it.
pub const FAULT_PREFETCH: u32 = 0x08;

/// One in-flight fault-resolution activity for a page.
///
/// All counters are mutated only under the owning bucket's lock; they are
/// atomics so diagnostics can read them without taking it.
pub struct FaultHandle {
    addr: u64,
    flags: u32,
    /// Follower re-wait spins; a safety valve, not a correctness input.
    limit: AtomicU32,
    /// Threads participating in this resolution. The handle is never
    /// destroyed while this is non-zero.
    pendings: AtomicU32,
    /// Threads waiting for the handle to be unlinked so they can retry.
    pendings_retry: AtomicU32,
    result: AtomicU32,
    completed: AtomicBool,
    sync_armed: AtomicBool,
    sync_done: AtomicBool,
    unlinked: AtomicBool,
    /// Primary completion queue (followers).
    waits: Condvar,
    /// Synchronous-completion signal (a leader blocked in `await_sync`).
    sync_wait: Condvar,
    /// Retry queue: woken when the handle is unlinked.
    waits_retry: Condvar,
    context: Arc<ProcessContext>,
}

impl FaultHandle {
    fn new(addr: u64, flags: u32, context: Arc<ProcessContext>) -> Self {
        Self {
            addr,
            flags,
            limit: AtomicU32::new(0),
            pendings: AtomicU32::new(1),
            pendings_retry: AtomicU32::new(0),
            result: AtomicU32::new(FetchResult::Fail.as_u32()),
            completed: AtomicBool::new(false),
            sync_armed: AtomicBool::new(false),
            sync_done: AtomicBool::new(false),
            unlinked: AtomicBool::new(false),
            waits: Condvar::new(),
            sync_wait: Condvar::new(),
            waits_retry: Condvar::new(),
            context,
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn context(&self) -> &Arc<ProcessContext> {
        &self.context
    }

    pub fn result(&self) -> FetchResult {
        FetchResult::from_u32(self.result.load(Ordering::Acquire))
    }

    fn set_result(&self, result: FetchResult) {
        self.result.store(result.as_u32(), Ordering::Release);
    }

    pub fn pendings(&self) -> u32 {
        self.pendings.load(Ordering::Acquire)
    }

    pub fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::Acquire)
    }
}

/// Outcome of a blocking acquisition.
pub enum Join {
    /// No handle existed; the caller drives the resolution.
    Leader(Arc<FaultHandle>),
    /// An existing resolution was joined; the caller waits on it.
    Follower(Arc<FaultHandle>),
}

struct Bucket {
    slots: Mutex<Vec<Arc<FaultHandle>>>,
}

/// Hashed table of in-flight fault handles for one process context.
pub struct FaultTable {
    buckets: Box<[Bucket]>,
    capacity: usize,
    in_flight: AtomicUsize,
    retry_limit: u32,
    sequential_wake: bool,
}

fn find_in(slots: &[Arc<FaultHandle>], addr: u64) -> Option<Arc<FaultHandle>> {
    slots.iter().find(|fh| fh.addr == addr).cloned()
}

impl FaultTable {
    pub fn new(cfg: &DsmConfig) -> Self {
        let buckets = (0..cfg.fault_buckets)
            .map(|_| Bucket {
                slots: Mutex::new(Vec::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            capacity: cfg.max_fault_handles,
            in_flight: AtomicUsize::new(0),
            retry_limit: cfg.retry_limit,
            sequential_wake: cfg.sequential_wake,
        }
    }

    fn bucket_of(&self, addr: u64) -> &Bucket {
        let key = (addr >> PAGE_SHIFT) as usize % self.buckets.len();
        &self.buckets[key]
    }

    /// Handles currently in flight across all buckets.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Locks the bucket covering `addr`.
    pub fn lock_bucket(&self, addr: u64) -> BucketGuard<'_> {
        BucketGuard {
            table: self,
            slots: self.bucket_of(addr).slots.lock(),
        }
    }

    /// Locks the bucket covering `addr` only if immediately free.
    pub fn try_lock_bucket(&self, addr: u64) -> Option<BucketGuard<'_>> {
        self.bucket_of(addr)
            .slots
            .try_lock()
            .map(|slots| BucketGuard { table: self, slots })
    }

    /// Pendings count of the in-flight handle for `addr`, if one exists.
    pub fn pendings_for(&self, addr: u64) -> Option<u32> {
        let slots = self.bucket_of(addr).slots.lock();
        find_in(&slots, addr).map(|fh| fh.pendings())
    }

    /// Whether a handle for `addr` is currently linked.
    pub fn handle_exists(&self, addr: u64) -> bool {
        let slots = self.bucket_of(addr).slots.lock();
        find_in(&slots, addr).is_some()
    }

    fn insert_locked(
        &self,
        slots: &mut MutexGuard<'_, Vec<Arc<FaultHandle>>>,
        ctx: &Arc<ProcessContext>,
        addr: u64,
        flags: u32,
    ) -> Result<Arc<FaultHandle>, DsmError> {
        if self.in_flight.load(Ordering::Acquire) >= self.capacity {
            return Err(DsmError::FaultsExhausted);
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let fh = Arc::new(FaultHandle::new(addr, flags, Arc::clone(ctx)));
        slots.push(Arc::clone(&fh));
        Ok(fh)
    }

    fn unlink_locked(&self, slots: &mut MutexGuard<'_, Vec<Arc<FaultHandle>>>, fh: &Arc<FaultHandle>) {
        slots.retain(|h| !Arc::ptr_eq(h, fh));
        fh.unlinked.store(true, Ordering::Release);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if fh.pendings_retry.load(Ordering::Acquire) > 0 {
            fh.waits_retry.notify_all();
        }
    }

    /// Acquires the handle for `addr`, creating it (leader) or joining an
    /// existing resolution (follower). A handle caught in its teardown
    /// window (resolved, unlink pending) parks the caller on the retry
    /// queue until the unlink lands, then rescans.
    pub fn acquire_or_join(
        &self,
        ctx: &Arc<ProcessContext>,
        addr: u64,
        flags: u32,
    ) -> Result<Join, DsmError> {
        let bucket = self.bucket_of(addr);
        let mut slots = bucket.slots.lock();
        let mut attempts = 0u32;
        loop {
            match find_in(&slots, addr) {
                Some(fh) => {
                    if fh.pendings.load(Ordering::Acquire) == 0 {
                        fh.pendings_retry.fetch_add(1, Ordering::AcqRel);
                        while !fh.unlinked.load(Ordering::Acquire) {
                            fh.waits_retry.wait(&mut slots);
                        }
                        fh.pendings_retry.fetch_sub(1, Ordering::AcqRel);
                        attempts += 1;
                        if attempts > self.retry_limit {
                            warn!(
                                "fault {:#x}: {} retry spins through teardown window",
                                addr, attempts
                            );
                        }
                        continue;
                    }
                    fh.pendings.fetch_add(1, Ordering::AcqRel);
                    trace!("fault {:#x}: joined, pendings={}", addr, fh.pendings());
                    return Ok(Join::Follower(fh));
                }
                None => {
                    let fh = self.insert_locked(&mut slots, ctx, addr, flags)?;
                    trace!("fault {:#x}: leader", addr);
                    return Ok(Join::Leader(fh));
                }
            }
        }
    }

    /// Blocks a follower until the resolution outcome is published, then
    /// returns it. The follower still owes one `finish` call.
    pub fn follower_wait(&self, fh: &Arc<FaultHandle>) -> FetchResult {
        let mut slots = self.bucket_of(fh.addr).slots.lock();
        while !fh.completed.load(Ordering::Acquire) && !fh.unlinked.load(Ordering::Acquire) {
            fh.waits.wait(&mut slots);
            let spins = fh.limit.fetch_add(1, Ordering::AcqRel) + 1;
            if spins > self.retry_limit {
                warn!("fault {:#x}: follower re-waited {} times", fh.addr, spins);
            }
        }
        fh.result()
    }

    /// Blocks the leader until its pending share has been consumed by the
    /// resolver, then unlinks the handle. Used by the synchronous (genuine
    /// fault) path; the resolver's `finish` hands completion off here
    /// instead of freeing the handle.
    pub fn await_sync(&self, fh: &Arc<FaultHandle>) -> FetchResult {
        let mut slots = self.bucket_of(fh.addr).slots.lock();
        if !fh.unlinked.load(Ordering::Acquire) {
            fh.sync_armed.store(true, Ordering::Release);
            while !fh.sync_done.load(Ordering::Acquire) && !fh.unlinked.load(Ordering::Acquire) {
                fh.sync_wait.wait(&mut slots);
            }
            if !fh.unlinked.load(Ordering::Acquire) {
                self.unlink_locked(&mut slots, fh);
            }
        }
        fh.result()
    }

    /// Publishes the resolution outcome and consumes one pending share.
    /// Used by whoever resolved the fault (response handler or a local
    /// fix-up leader).
    pub fn finish_with(&self, fh: &Arc<FaultHandle>, result: FetchResult) -> bool {
        let mut slots = self.bucket_of(fh.addr).slots.lock();
        fh.set_result(result);
        fh.completed.store(true, Ordering::Release);
        self.finish_locked(&mut slots, fh)
    }

    /// Consumes one pending share. When the last share goes, the handle is
    /// unlinked and freed, unless a synchronous waiter armed completion
    /// hand-off, in which case that waiter performs the unlink. Returns
    /// whether this call destroyed (unlinked) the handle, so the caller
    /// drops its context reference exactly once.
    pub fn finish(&self, fh: &Arc<FaultHandle>) -> bool {
        let mut slots = self.bucket_of(fh.addr).slots.lock();
        self.finish_locked(&mut slots, fh)
    }

    fn finish_locked(
        &self,
        slots: &mut MutexGuard<'_, Vec<Arc<FaultHandle>>>,
        fh: &Arc<FaultHandle>,
    ) -> bool {
        let remaining = fh.pendings.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 {
            trace!(" >{:#x} pendings={}", fh.addr, remaining);
            if self.sequential_wake {
                fh.waits.notify_one();
            } else {
                fh.waits.notify_all();
            }
            return false;
        }
        trace!(">>{:#x}", fh.addr);
        if fh.sync_armed.load(Ordering::Acquire) {
            fh.sync_done.store(true, Ordering::Release);
            fh.sync_wait.notify_all();
            return false;
        }
        self.unlink_locked(slots, fh);
        true
    }
}

/// Exclusive access to one bucket, for the non-blocking cascades (prefetch
/// selection, owner-side request handling) and for ownership-index
/// mutations that must share the page's critical section.
pub struct BucketGuard<'a> {
    table: &'a FaultTable,
    slots: MutexGuard<'a, Vec<Arc<FaultHandle>>>,
}

impl BucketGuard<'_> {
    /// The in-flight handle for `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<Arc<FaultHandle>> {
        find_in(&self.slots, addr)
    }

    /// Inserts a fresh leader handle for `addr`. The caller has verified no
    /// handle exists.
    pub fn insert_leader(
        &mut self,
        ctx: &Arc<ProcessContext>,
        addr: u64,
        flags: u32,
    ) -> Result<Arc<FaultHandle>, DsmError> {
        debug_assert!(self.find(addr).is_none());
        self.table.insert_locked(&mut self.slots, ctx, addr, flags)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::context::ContextTable;
    use crate::memory::AddressSpace;
    use crate::{DsmConfig, NodeId};

    fn test_ctx() -> Arc<ProcessContext> {
        let contexts = ContextTable::new(NodeId(0), DsmConfig::default());
        contexts.attach_origin(100, Arc::new(AddressSpace::new()))
    }

    #[test]
    fn leader_then_join_then_drain() {
        let ctx = test_ctx();
        let fh = match ctx.faults.acquire_or_join(&ctx, 0x1000, 0).expect("acquire") {
            Join::Leader(fh) => fh,
            Join::Follower(_) => panic!("expected leader"),
        };
        assert_eq!(ctx.faults.pendings_for(0x1000), Some(1));

        let follower = match ctx.faults.acquire_or_join(&ctx, 0x1000, 0).expect("join") {
            Join::Follower(fh) => fh,
            Join::Leader(_) => panic!("expected follower"),
        };
        assert!(Arc::ptr_eq(&fh, &follower));
        assert_eq!(ctx.faults.pendings_for(0x1000), Some(2));

        assert!(!ctx.faults.finish_with(&fh, FetchResult::Success));
        assert!(ctx.faults.finish(&follower));
        assert!(!ctx.faults.handle_exists(0x1000));
        assert_eq!(ctx.faults.in_flight(), 0);
    }

    #[test]
    fn different_addresses_get_distinct_handles() {
        let ctx = test_ctx();
        let a = match ctx.faults.acquire_or_join(&ctx, 0x1000, 0).expect("a") {
            Join::Leader(fh) => fh,
            _ => panic!("leader"),
        };
        let b = match ctx.faults.acquire_or_join(&ctx, 0x2000, 0).expect("b") {
            Join::Leader(fh) => fh,
            _ => panic!("leader"),
        };
        assert!(!Arc::ptr_eq(&a, &b));
        ctx.faults.finish_with(&a, FetchResult::Fail);
        ctx.faults.finish_with(&b, FetchResult::Fail);
    }

    #[test]
    fn capacity_exhaustion_is_retryable_error() {
        let cfg = DsmConfig {
            max_fault_handles: 1,
            ..DsmConfig::default()
        };
        let contexts = ContextTable::new(NodeId(0), cfg);
        let ctx = contexts.attach_origin(100, Arc::new(AddressSpace::new()));

        let fh = match ctx.faults.acquire_or_join(&ctx, 0x1000, 0).expect("first") {
            Join::Leader(fh) => fh,
            _ => panic!("leader"),
        };
        assert!(matches!(
            ctx.faults.acquire_or_join(&ctx, 0x2000, 0),
            Err(DsmError::FaultsExhausted)
        ));
        ctx.faults.finish_with(&fh, FetchResult::Fail);
        assert!(matches!(
            ctx.faults.acquire_or_join(&ctx, 0x2000, 0),
            Ok(Join::Leader(_))
        ));
    }

    #[test]
    fn sync_completion_handoff() {
        let ctx = test_ctx();
        let fh = match ctx.faults.acquire_or_join(&ctx, 0x3000, 0).expect("acquire") {
            Join::Leader(fh) => fh,
            _ => panic!("leader"),
        };

        let resolver = {
            let ctx = Arc::clone(&ctx);
            let fh = Arc::clone(&fh);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ctx.faults.finish_with(&fh, FetchResult::Success)
            })
        };

        let result = ctx.faults.await_sync(&fh);
        assert_eq!(result, FetchResult::Success);
        assert!(fh.is_unlinked());
        assert!(!ctx.faults.handle_exists(0x3000));
        // The resolver handed completion off instead of destroying.
        assert!(!resolver.join().expect("resolver"));
    }

    #[test]
    fn await_sync_after_fast_resolution() {
        // Resolution lands before the leader arms the sync hand-off; the
        // handle is already unlinked and the result is still readable.
        let ctx = test_ctx();
        let fh = match ctx.faults.acquire_or_join(&ctx, 0x4000, 0).expect("acquire") {
            Join::Leader(fh) => fh,
            _ => panic!("leader"),
        };
        assert!(ctx.faults.finish_with(&fh, FetchResult::Concurrency));
        assert!(fh.is_unlinked());
        assert_eq!(ctx.faults.await_sync(&fh), FetchResult::Concurrency);
    }

    #[test]
    fn followers_all_wake_after_drain() {
        let ctx = test_ctx();
        let fh = match ctx.faults.acquire_or_join(&ctx, 0x5000, 0).expect("acquire") {
            Join::Leader(fh) => fh,
            _ => panic!("leader"),
        };

        let mut followers = Vec::new();
        for _ in 0..4 {
            let ctx = Arc::clone(&ctx);
            followers.push(thread::spawn(move || {
                let fh = match ctx.faults.acquire_or_join(&ctx, 0x5000, 0).expect("join") {
                    Join::Follower(fh) => fh,
                    Join::Leader(_) => panic!("leader already exists"),
                };
                let result = ctx.faults.follower_wait(&fh);
                ctx.faults.finish(&fh);
                result
            }));
        }

        // Wait until every follower has joined before resolving.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while ctx.faults.pendings_for(0x5000) != Some(5) {
            assert!(std::time::Instant::now() < deadline, "followers never joined");
            thread::sleep(Duration::from_millis(1));
        }

        ctx.faults.finish_with(&fh, FetchResult::Success);
        for follower in followers {
            assert_eq!(follower.join().expect("follower"), FetchResult::Success);
        }
        assert!(!ctx.faults.handle_exists(0x5000));
        assert_eq!(ctx.faults.in_flight(), 0);
    }

    #[test]
    fn retry_window_rescan_becomes_leader() {
        let ctx = test_ctx();
        let fh = match ctx.faults.acquire_or_join(&ctx, 0x6000, 0).expect("acquire") {
            Join::Leader(fh) => fh,
            _ => panic!("leader"),
        };
        // Arm sync so the resolved handle lingers linked with pendings == 0.
        let waiter = {
            let ctx = Arc::clone(&ctx);
            let fh = Arc::clone(&fh);
            thread::spawn(move || ctx.faults.await_sync(&fh))
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !fh.sync_armed.load(Ordering::Acquire) {
            assert!(std::time::Instant::now() < deadline, "sync never armed");
            thread::sleep(Duration::from_millis(1));
        }
        ctx.faults.finish_with(&fh, FetchResult::Success);
        waiter.join().expect("waiter");

        // The handle is gone; a new acquisition leads.
        assert!(matches!(
            ctx.faults.acquire_or_join(&ctx, 0x6000, 0),
            Ok(Join::Leader(_))
        ));
    }
}
