// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process transport backend for deterministic protocol tests
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//!
//! A bus of loopback endpoints, one per simulated node. Messages are
//! serialized to JSON frames on send and decoded on the receiving side, so
//! the wire codec is exercised even without sockets, and each endpoint
//! dispatches frames to handlers on its own small worker pool, so handler
//! code runs off the sender's thread exactly like a real transport.
//!
//! Tests steer interleavings through the delivery gate: holding a message
//! kind parks matching frames inside the bus until released, which makes
//! "a response is still in flight" a state a test can construct at will.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use log::warn;
use parking_lot::{Mutex, RwLock};

use crate::proto::{Message, MessageKind};
use crate::{Handler, NodeId, Transport, TransportError};

type Frame = String;

fn encode(msg: &Message) -> Result<Frame, TransportError> {
    serde_json::to_string(msg).map_err(|e| TransportError::Codec(e.to_string()))
}

struct EndpointInner {
    node: NodeId,
    handlers: RwLock<HashMap<MessageKind, Handler>>,
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sent: Mutex<HashMap<MessageKind, u64>>,
    closed: AtomicBool,
}

impl EndpointInner {
    fn dispatch(self: &Arc<Self>, frame: Frame) {
        let msg: Message = match serde_json::from_str(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("node {}: dropping undecodable frame: {}", self.node, e);
                return;
            }
        };
        let kind = msg.kind();
        let handlers = self.handlers.read();
        match handlers.get(&kind) {
            Some(handler) => handler(msg),
            None => warn!("node {}: no handler for {:?}, dropped", self.node, kind),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the sender ends the worker loops.
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

struct BusInner {
    endpoints: RwLock<HashMap<NodeId, Arc<EndpointInner>>>,
    gate: Mutex<Vec<MessageKind>>,
    held: Mutex<Vec<(NodeId, MessageKind, Frame)>>,
}

impl BusInner {
    fn route(&self, dest: NodeId, kind: MessageKind, frame: Frame) -> Result<(), TransportError> {
        if self.gate.lock().contains(&kind) {
            self.held.lock().push((dest, kind, frame));
            return Ok(());
        }
        self.deliver(dest, frame)
    }

    fn deliver(&self, dest: NodeId, frame: Frame) -> Result<(), TransportError> {
        let endpoint = self
            .endpoints
            .read()
            .get(&dest)
            .cloned()
            .ok_or(TransportError::NoRoute(dest))?;
        let tx = endpoint.tx.lock();
        tx.as_ref()
            .ok_or(TransportError::Closed)?
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }
}

/// The shared bus. Clone-cheap; all clones steer the same endpoints.
#[derive(Clone)]
pub struct InProcBus {
    inner: Arc<BusInner>,
}

impl Default for InProcBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                endpoints: RwLock::new(HashMap::new()),
                gate: Mutex::new(Vec::new()),
                held: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates the endpoint for `node` with `workers` dispatch threads.
    /// One endpoint per node id; creating a second replaces the route and
    /// orphans the first, so tests create each node once.
    pub fn endpoint(&self, node: NodeId, workers: usize) -> Arc<InProcEndpoint> {
        let (tx, rx) = mpsc::channel::<Frame>();
        let inner = Arc::new(EndpointInner {
            node,
            handlers: RwLock::new(HashMap::new()),
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::new()),
            sent: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(workers.max(1));
        for _ in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let ep = Arc::clone(&inner);
            handles.push(thread::spawn(move || loop {
                let frame = {
                    let rx = rx.lock();
                    rx.recv()
                };
                match frame {
                    Ok(frame) => ep.dispatch(frame),
                    Err(_) => break,
                }
            }));
        }
        *inner.workers.lock() = handles;

        self.inner
            .endpoints
            .write()
            .insert(node, Arc::clone(&inner));
        Arc::new(InProcEndpoint {
            bus: Arc::clone(&self.inner),
            inner,
        })
    }

    /// Parks every frame of `kind` sent from now on inside the bus.
    pub fn hold(&self, kind: MessageKind) {
        let mut gate = self.inner.gate.lock();
        if !gate.contains(&kind) {
            gate.push(kind);
        }
    }

    /// Reopens `kind` and delivers the parked frames in send order.
    /// Returns how many frames were delivered.
    pub fn release(&self, kind: MessageKind) -> usize {
        self.inner.gate.lock().retain(|k| *k != kind);
        let parked: Vec<_> = {
            let mut held = self.inner.held.lock();
            let (matching, rest): (Vec<_>, Vec<_>) =
                held.drain(..).partition(|(_, k, _)| *k == kind);
            *held = rest;
            matching
        };
        let mut delivered = 0;
        for (dest, _, frame) in parked {
            match self.inner.deliver(dest, frame) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("releasing held frame to node {} failed: {}", dest, e),
            }
        }
        delivered
    }

    /// Frames currently parked behind the gate.
    pub fn held_count(&self) -> usize {
        self.inner.held.lock().len()
    }

    /// Closes every endpoint and joins their workers.
    pub fn shutdown(&self) {
        let endpoints: Vec<_> = self.inner.endpoints.write().drain().collect();
        for (_, endpoint) in endpoints {
            endpoint.close();
        }
    }
}

/// One node's attachment to the bus.
pub struct InProcEndpoint {
    bus: Arc<BusInner>,
    inner: Arc<EndpointInner>,
}

impl InProcEndpoint {
    /// Messages of `kind` accepted for sending by this endpoint.
    pub fn sent_count(&self, kind: MessageKind) -> u64 {
        self.inner.sent.lock().get(&kind).copied().unwrap_or(0)
    }

    /// Closes this endpoint. Later sends fail with [`TransportError::Closed`].
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Transport for InProcEndpoint {
    fn send(&self, dest: NodeId, msg: Message) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let kind = msg.kind();
        let frame = encode(&msg)?;
        self.bus.route(dest, kind, frame)?;
        *self.inner.sent.lock().entry(kind).or_insert(0) += 1;
        Ok(())
    }

    fn register_handler(
        &self,
        kind: MessageKind,
        handler: Handler,
    ) -> Result<(), TransportError> {
        let mut handlers = self.inner.handlers.write();
        if handlers.contains_key(&kind) {
            return Err(TransportError::HandlerExists(kind));
        }
        handlers.insert(kind, handler);
        Ok(())
    }

    fn local_node(&self) -> NodeId {
        self.inner.node
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::proto::{PageCandidate, PageFetchRequest, Payload};

    fn request_to(from: NodeId) -> Message {
        Message {
            from,
            payload: Payload::PageFetchRequest(PageFetchRequest {
                tgid: 1,
                candidates: vec![PageCandidate {
                    addr: 0x1000,
                    token: 1,
                    write: false,
                }],
            }),
        }
    }

    #[test]
    fn frames_cross_the_bus_and_reach_the_handler() {
        let bus = InProcBus::new();
        let a = bus.endpoint(NodeId(0), 1);
        let b = bus.endpoint(NodeId(1), 1);

        let (tx, rx) = mpsc::channel();
        b.register_handler(
            MessageKind::PageFetchRequest,
            Box::new(move |msg| {
                tx.send(msg.from).expect("report");
            }),
        )
        .expect("register");

        a.send(NodeId(1), request_to(NodeId(0))).expect("send");
        let from = rx.recv_timeout(Duration::from_secs(2)).expect("delivery");
        assert_eq!(from, NodeId(0));
        assert_eq!(a.sent_count(MessageKind::PageFetchRequest), 1);
        bus.shutdown();
    }

    #[test]
    fn duplicate_handler_registration_is_rejected() {
        let bus = InProcBus::new();
        let a = bus.endpoint(NodeId(0), 1);
        a.register_handler(MessageKind::PageFetchRequest, Box::new(|_| {}))
            .expect("first");
        assert!(matches!(
            a.register_handler(MessageKind::PageFetchRequest, Box::new(|_| {})),
            Err(TransportError::HandlerExists(MessageKind::PageFetchRequest))
        ));
        bus.shutdown();
    }

    #[test]
    fn unknown_destination_is_no_route() {
        let bus = InProcBus::new();
        let a = bus.endpoint(NodeId(0), 1);
        assert!(matches!(
            a.send(NodeId(9), request_to(NodeId(0))),
            Err(TransportError::NoRoute(NodeId(9)))
        ));
        assert_eq!(a.sent_count(MessageKind::PageFetchRequest), 0);
        bus.shutdown();
    }

    #[test]
    fn closed_endpoint_refuses_sends() {
        let bus = InProcBus::new();
        let a = bus.endpoint(NodeId(0), 1);
        bus.endpoint(NodeId(1), 1);
        a.close();
        assert!(matches!(
            a.send(NodeId(1), request_to(NodeId(0))),
            Err(TransportError::Closed)
        ));
        bus.shutdown();
    }

    #[test]
    fn held_frames_deliver_on_release_in_order() {
        let bus = InProcBus::new();
        let a = bus.endpoint(NodeId(0), 1);
        let b = bus.endpoint(NodeId(1), 1);

        let (tx, rx) = mpsc::channel();
        b.register_handler(
            MessageKind::PageFetchRequest,
            Box::new(move |msg| {
                if let Payload::PageFetchRequest(req) = msg.payload {
                    tx.send(req.candidates[0].token).expect("report");
                }
            }),
        )
        .expect("register");

        bus.hold(MessageKind::PageFetchRequest);
        for token in 1..=3u64 {
            let mut msg = request_to(NodeId(0));
            if let Payload::PageFetchRequest(req) = &mut msg.payload {
                req.candidates[0].token = token;
            }
            a.send(NodeId(1), msg).expect("send");
        }
        assert_eq!(bus.held_count(), 3);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        assert_eq!(bus.release(MessageKind::PageFetchRequest), 3);
        for expected in 1..=3u64 {
            let token = rx.recv_timeout(Duration::from_secs(2)).expect("delivery");
            assert_eq!(token, expected);
        }
        bus.shutdown();
    }
}
