// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Protocol driver — faults in, fetch requests out, pages moving
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests here; multi-node scenarios in dsm/tests
//!
//! [`DsmNode`] binds the per-process machinery (contexts, ownership, fault
//! handles, prefetch) to a [`Transport`] endpoint. The faulting side claims
//! or joins a fault handle, sends one fetch request naming the faulting
//! page plus any prefetch picks, and blocks until the response handler
//! publishes an outcome through the handle. The owning side serves each
//! candidate with try-locks only and replies exactly once per candidate;
//! anything contended is a `Fail` the requester may retry.
//!
//! Handle tokens cross the wire instead of addresses-as-identity: the
//! requester mints a u64 per in-flight handle and resolves it back on
//! response, so a stale or duplicated response can never reach a handle
//! that has moved on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::config::DsmConfig;
use crate::context::{ContextTable, ProcessContext};
use crate::faults::{FaultHandle, Join, FAULT_PREFETCH, FAULT_WRITE};
use crate::prefetch::PrefetchPolicy;
use crate::proto::{
    FetchResult, Message, MessageKind, PageCandidate, PageFetchRequest, PageFetchResponse, Payload,
};
use crate::{page_align, DsmError, NodeId, Transport};

/// Pause between retries of a failed fault resolution attempt.
const RETRY_PAUSE: Duration = Duration::from_millis(1);

/// Outcome of one fault resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    /// The page is present with the requested access.
    Resolved,
    /// The attempt lost a race or the owner declined; try again.
    Retry,
}

/// Maps in-flight wire tokens to their fault handles.
struct TokenRegistry {
    next: AtomicU64,
    live: Mutex<HashMap<u64, Arc<FaultHandle>>>,
}

impl TokenRegistry {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    fn mint(&self, fh: &Arc<FaultHandle>) -> u64 {
        let token = self.next.fetch_add(1, Ordering::AcqRel);
        self.live.lock().insert(token, Arc::clone(fh));
        token
    }

    /// Resolves and retires a token. Each token is consumed at most once.
    fn take(&self, token: u64) -> Option<Arc<FaultHandle>> {
        self.live.lock().remove(&token)
    }

    fn outstanding(&self) -> usize {
        self.live.lock().len()
    }
}

struct NodeInner {
    transport: Arc<dyn Transport>,
    contexts: ContextTable,
    policy: PrefetchPolicy,
    tokens: TokenRegistry,
    retry_limit: u32,
}

/// One node's view of the coherence protocol. Clone-cheap; clones share
/// the same endpoint and contexts.
#[derive(Clone)]
pub struct DsmNode {
    inner: Arc<NodeInner>,
}

impl DsmNode {
    /// Binds a node to its transport endpoint and registers the protocol's
    /// message handlers. Handlers hold only a weak reference, so dropping
    /// the node quiesces them.
    pub fn new(transport: Arc<dyn Transport>, cfg: DsmConfig) -> Result<Self, DsmError> {
        let local = transport.local_node();
        let inner = Arc::new(NodeInner {
            contexts: ContextTable::new(local, cfg.clone()),
            policy: PrefetchPolicy::new(&cfg),
            tokens: TokenRegistry::new(),
            retry_limit: cfg.retry_limit,
            transport,
        });

        let weak = Arc::downgrade(&inner);
        inner.transport.register_handler(
            MessageKind::PageFetchRequest,
            Box::new(move |msg| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_message(msg);
                }
            }),
        )?;
        let weak = Arc::downgrade(&inner);
        inner.transport.register_handler(
            MessageKind::PageFetchResponse,
            Box::new(move |msg| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_message(msg);
                }
            }),
        )?;
        Ok(Self { inner })
    }

    pub fn local_node(&self) -> NodeId {
        self.inner.contexts.local_node()
    }

    /// The process contexts registered on this node.
    pub fn contexts(&self) -> &ContextTable {
        &self.inner.contexts
    }

    /// Resolves one fault: returns once the page is present with the
    /// requested access ([`FaultStatus::Resolved`]) or the attempt should be
    /// repeated ([`FaultStatus::Retry`]).
    pub fn resolve_fault(
        &self,
        ctx: &Arc<ProcessContext>,
        addr: u64,
        write: bool,
    ) -> Result<FaultStatus, DsmError> {
        self.inner.resolve_fault(ctx, addr, write)
    }

    /// [`resolve_fault`](Self::resolve_fault) in a bounded retry loop.
    pub fn resolve_fault_blocking(
        &self,
        ctx: &Arc<ProcessContext>,
        addr: u64,
        write: bool,
    ) -> Result<(), DsmError> {
        for attempt in 0..=self.inner.retry_limit {
            match self.inner.resolve_fault(ctx, addr, write)? {
                FaultStatus::Resolved => return Ok(()),
                FaultStatus::Retry => {
                    trace!("fault {:#x}: retry {}", addr, attempt + 1);
                    thread::sleep(RETRY_PAUSE);
                }
            }
        }
        Err(DsmError::RetryExhausted(page_align(addr)))
    }

    /// In-flight wire tokens, for diagnostics.
    pub fn outstanding_tokens(&self) -> usize {
        self.inner.tokens.outstanding()
    }
}

impl NodeInner {
    fn local(&self) -> NodeId {
        self.contexts.local_node()
    }

    fn resolve_fault(
        &self,
        ctx: &Arc<ProcessContext>,
        addr: u64,
        write: bool,
    ) -> Result<FaultStatus, DsmError> {
        let addr = page_align(addr);
        if !ctx.mm.contains(addr) {
            return Err(DsmError::NotMapped(addr));
        }
        let seq = ctx.next_fault_seq();

        // Fast path: the page is already here and ours. A write fault on a
        // read-only mapping upgrades in place; exclusive ownership means no
        // other node can hold a copy.
        {
            let mut pte = ctx.mm.pte_lock(addr);
            let present = pte.entry().map(|e| e.present).unwrap_or(false);
            if present && ctx.ownership.is_owned_locally(addr) {
                if write {
                    pte.make_writable();
                }
                return Ok(FaultStatus::Resolved);
            }
        }

        let flags = if write { FAULT_WRITE } else { 0 };
        match ctx.faults.acquire_or_join(ctx, addr, flags)? {
            Join::Follower(fh) => {
                // Wait out the in-flight resolution, then re-attempt: the
                // fast path picks up whatever the leader installed, and a
                // write follower behind a read leader upgrades there too.
                let result = ctx.faults.follower_wait(&fh);
                ctx.faults.finish(&fh);
                trace!("fault {:#x}: follower woke with {:?}", addr, result);
                Ok(FaultStatus::Retry)
            }
            Join::Leader(fh) => self.lead_resolution(ctx, &fh, addr, write, seq),
        }
    }

    fn lead_resolution(
        &self,
        ctx: &Arc<ProcessContext>,
        fh: &Arc<FaultHandle>,
        addr: u64,
        write: bool,
        seq: u64,
    ) -> Result<FaultStatus, DsmError> {
        // Re-check under the handle: a previous resolution may have landed
        // between the fast path and leadership.
        {
            let mut pte = ctx.mm.pte_lock(addr);
            let present = pte.entry().map(|e| e.present).unwrap_or(false);
            if present && ctx.ownership.is_owned_locally(addr) {
                if write {
                    pte.make_writable();
                }
                drop(pte);
                ctx.faults.finish_with(fh, FetchResult::Success);
                return Ok(FaultStatus::Resolved);
            }
            // At the origin, a page nobody has distributed is resolved
            // locally: demand-zero install.
            if !ctx.is_remote() && ctx.ownership.is_owned_locally(addr) {
                pte.install(&[], write);
                drop(pte);
                ctx.faults.finish_with(fh, FetchResult::Success);
                return Ok(FaultStatus::Resolved);
            }
        }

        let Some(target) = self.fetch_target(ctx, addr) else {
            // Transient no-owner window during a hand-off elsewhere.
            ctx.faults.finish_with(fh, FetchResult::Fail);
            return Ok(FaultStatus::Retry);
        };

        let mut prefetched = Vec::new();
        if self.policy.should_run(seq) {
            prefetched = self.policy.select(ctx, addr);
        }

        let mut candidates = Vec::with_capacity(1 + prefetched.len());
        let mut tokens = Vec::with_capacity(1 + prefetched.len());
        let token = self.tokens.mint(fh);
        tokens.push(token);
        candidates.push(PageCandidate { addr, token, write });
        for pf in &prefetched {
            let token = self.tokens.mint(pf);
            tokens.push(token);
            candidates.push(PageCandidate {
                addr: pf.addr(),
                token,
                write: false,
            });
        }
        debug!(
            "fetch {:#x} from node {} (+{} prefetch)",
            addr,
            target,
            prefetched.len()
        );

        let msg = Message {
            from: self.local(),
            payload: Payload::PageFetchRequest(PageFetchRequest {
                tgid: ctx.tgid(),
                candidates,
            }),
        };
        if let Err(err) = self.transport.send(target, msg) {
            // No response will come; retire the tokens and release every
            // handle this attempt claimed.
            for token in tokens {
                self.tokens.take(token);
            }
            ctx.faults.finish_with(fh, FetchResult::Fail);
            for pf in &prefetched {
                ctx.faults.finish_with(pf, FetchResult::Fail);
            }
            return Err(err.into());
        }

        match ctx.faults.await_sync(fh) {
            FetchResult::Success | FetchResult::Concurrency => Ok(FaultStatus::Resolved),
            FetchResult::Fail => Ok(FaultStatus::Retry),
        }
    }

    /// Where to fetch `addr` from. A remote context without ownership
    /// metadata falls back to the origin; a stale owner hint is tolerated,
    /// the addressee answers `Fail` if the page moved on.
    fn fetch_target(&self, ctx: &Arc<ProcessContext>, addr: u64) -> Option<NodeId> {
        match ctx.ownership.owner_of(addr) {
            Some(owner) if owner != self.local() => Some(owner),
            Some(_) => None,
            None if ctx.is_remote() => Some(ctx.origin()),
            None => None,
        }
    }

    fn on_message(self: Arc<Self>, msg: Message) {
        let from = msg.from;
        match msg.payload {
            Payload::PageFetchRequest(req) => self.on_fetch_request(from, req),
            Payload::PageFetchResponse(resp) => self.on_fetch_response(from, resp),
        }
    }

    fn on_fetch_request(&self, from: NodeId, req: PageFetchRequest) {
        let ctx = self.contexts.find(req.tgid);
        for cand in req.candidates {
            let (result, page) = match &ctx {
                Some(ctx) => self.serve_candidate(ctx, from, &cand),
                None => (FetchResult::Fail, Vec::new()),
            };
            let reply = Message {
                from: self.local(),
                payload: Payload::PageFetchResponse(PageFetchResponse {
                    tgid: req.tgid,
                    addr: cand.addr,
                    token: cand.token,
                    result,
                    page,
                }),
            };
            if let Err(err) = self.transport.send(from, reply) {
                warn!("fetch reply {:#x} to node {} failed: {}", cand.addr, from, err);
            }
        }
    }

    /// Serves one candidate with try-locks only. A held entry lock, a held
    /// bucket, an in-flight local resolution, or a page this node does not
    /// hold all answer `Fail`; success invalidates the local mapping and
    /// moves the ownership bit in the same critical section.
    fn serve_candidate(
        &self,
        ctx: &Arc<ProcessContext>,
        from: NodeId,
        cand: &PageCandidate,
    ) -> (FetchResult, Vec<u8>) {
        let addr = page_align(cand.addr);
        let Some(mut pte) = ctx.mm.pte_try_lock(addr) else {
            return (FetchResult::Fail, Vec::new());
        };
        let Some(bucket) = ctx.faults.try_lock_bucket(addr) else {
            return (FetchResult::Fail, Vec::new());
        };
        if bucket.find(addr).is_some() {
            return (FetchResult::Fail, Vec::new());
        }
        let holds = pte.entry().map(|e| e.present).unwrap_or(false)
            && ctx.ownership.is_owned_locally(addr);
        if !holds {
            return (FetchResult::Fail, Vec::new());
        }
        let page = match pte.entry() {
            Some(entry) => entry.frame().to_vec(),
            None => return (FetchResult::Fail, Vec::new()),
        };
        pte.invalidate();
        ctx.ownership.mark_distributed(addr);
        ctx.ownership.clear_owner(self.local(), addr);
        ctx.ownership.set_owner(from, addr);
        trace!("page {:#x} handed to node {}", addr, from);
        (FetchResult::Success, page)
    }

    fn on_fetch_response(&self, from: NodeId, resp: PageFetchResponse) {
        let Some(fh) = self.tokens.take(resp.token) else {
            warn!(
                "response for unknown token {} ({:#x} from node {})",
                resp.token, resp.addr, from
            );
            return;
        };
        let ctx = Arc::clone(fh.context());
        let addr = page_align(resp.addr);
        let result = match resp.result {
            FetchResult::Success => {
                let mut pte = ctx.mm.pte_lock(addr);
                let already = pte.entry().map(|e| e.present).unwrap_or(false)
                    && ctx.ownership.is_owned_locally(addr);
                if already {
                    // The page arrived by another route while this response
                    // was in flight; its payload is stale.
                    FetchResult::Concurrency
                } else {
                    let writable = fh.flags() & FAULT_WRITE != 0;
                    pte.install(&resp.page, writable);
                    drop(pte);
                    ctx.ownership.mark_distributed(addr);
                    ctx.ownership.clear_owner(from, addr);
                    ctx.ownership.set_owner(self.local(), addr);
                    FetchResult::Success
                }
            }
            other => other,
        };
        if fh.flags() & FAULT_PREFETCH != 0 {
            trace!("prefetch {:#x}: {:?}", addr, result);
        }
        ctx.faults.finish_with(&fh, result);
    }
}
