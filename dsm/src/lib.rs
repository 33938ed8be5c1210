// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Distributed shared-memory page coherence (ownership + fault coordination)
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Covered by dsm unit and integration tests
//!
//! A cluster of nodes jointly executes threads of one process; this crate
//! keeps the process address space coherent when pages move between nodes.
//! It tracks per-page ownership, serializes concurrent faults on the same
//! page through fault handles, opportunistically prefetches neighbouring
//! pages, and runs the request/response exchange that hands a page (bytes
//! and ownership) from its current owner to a faulting node.
//!
//! The wire transport is an external collaborator consumed through the
//! [`Transport`] trait: "send a message to node N" and "register a handler
//! for message kind K". The in-process backend in [`inproc`] exists so the
//! protocol can be exercised deterministically without sockets.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod config;
pub mod context;
pub mod faults;
pub mod inproc;
pub mod memory;
pub mod node;
pub mod ownership;
pub mod prefetch;
pub mod proto;

pub use config::DsmConfig;
pub use context::{ContextTable, ProcessContext};
pub use faults::{FaultHandle, FaultTable};
pub use inproc::{InProcBus, InProcEndpoint};
pub use memory::AddressSpace;
pub use node::{DsmNode, FaultStatus};
pub use ownership::OwnershipIndex;
pub use proto::{FetchResult, Message, MessageKind, PageCandidate};

/// Base-2 log of the page size.
pub const PAGE_SHIFT: u32 = 12;
/// Page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Largest cluster this crate supports. Bit 63 of each ownership word is
/// reserved for the distributed flag, so node ids stop at 62.
pub const MAX_NODES: usize = 63;

/// Identifies one node in the cluster.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Bit index of this node in an ownership word.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread-group id of a distributed process, as assigned at its origin node.
pub type Tgid = u32;

/// Rounds an address down to its page boundary.
pub fn page_align(addr: u64) -> u64 {
    addr & !((PAGE_SIZE as u64) - 1)
}

/// Errors surfaced by the transport seam.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No endpoint is registered for the destination node.
    #[error("no route to node {0}")]
    NoRoute(NodeId),
    /// A handler is already registered for this message kind.
    #[error("handler already registered for {0:?}")]
    HandlerExists(MessageKind),
    /// The endpoint has been shut down.
    #[error("endpoint closed")]
    Closed,
    /// Message encode/decode failure.
    #[error("codec error: {0}")]
    Codec(String),
}

/// Errors produced by the coherence protocol itself.
#[derive(Debug, Error)]
pub enum DsmError {
    /// Underlying transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Address is not page aligned where alignment is required.
    #[error("address {0:#x} is not page aligned")]
    Misaligned(u64),
    /// Address falls outside every mapped VM region.
    #[error("address {0:#x} is not mapped")]
    NotMapped(u64),
    /// The in-flight fault handle capacity has been reached. Retryable.
    #[error("fault handle table exhausted")]
    FaultsExhausted,
    /// A bounded fault retry loop gave up.
    #[error("fault retry limit exceeded for {0:#x}")]
    RetryExhausted(u64),
    /// No node could be determined to fetch the page from.
    #[error("no fetch target for page {0:#x}")]
    NoOwner(u64),
    /// Configuration parse or validation failure.
    #[error("config error: {0}")]
    Config(String),
    /// A VM region overlaps an existing mapping.
    #[error("mapping overlaps existing region at {0:#x}")]
    Overlap(u64),
}

/// Handler invoked by the transport for one received message.
///
/// Handlers run on the transport's worker pool, one invocation per message,
/// and own the message they are given.
pub type Handler = Box<dyn Fn(Message) + Send + Sync>;

/// Node-to-node message delivery, reliable and ordered per peer pair.
///
/// One instance represents the local node's endpoint. Implementations
/// dispatch received messages asynchronously to the handler registered for
/// the message's kind; exactly one handler may exist per kind.
pub trait Transport: Send + Sync {
    /// Sends one message to `dest`. Best effort: delivery of a reply, not a
    /// transport acknowledgement, is what the protocol layers on top.
    fn send(&self, dest: NodeId, msg: Message) -> Result<(), TransportError>;

    /// Registers the handler for one message kind.
    fn register_handler(&self, kind: MessageKind, handler: Handler)
        -> Result<(), TransportError>;

    /// The local node id this endpoint speaks for.
    fn local_node(&self) -> NodeId;
}
