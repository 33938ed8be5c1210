// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire messages for the page fetch exchange.
//!
//! Two kinds: a fetch request carrying one or more page candidates (the
//! faulting page plus any prefetch picks), and a fetch response per
//! candidate carrying the outcome and, on success, the page bytes. Handle
//! tokens are opaque u64s minted by the requester; the owner echoes them
//! back so the requester can correlate responses without trusting remote
//! state.

use serde::{Deserialize, Serialize};

use crate::{NodeId, Tgid};

/// Message kinds a transport handler can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    PageFetchRequest,
    PageFetchResponse,
}

/// One delivered message: sender plus payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub from: NodeId,
    pub payload: Payload,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self.payload {
            Payload::PageFetchRequest(_) => MessageKind::PageFetchRequest,
            Payload::PageFetchResponse(_) => MessageKind::PageFetchResponse,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    PageFetchRequest(PageFetchRequest),
    PageFetchResponse(PageFetchResponse),
}

/// Outcome of one page fetch candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchResult {
    /// Page bytes and ownership transferred.
    Success,
    /// The owner could not serve the candidate; retry later if it matters.
    Fail,
    /// The page changed state while the response was in flight (already
    /// present and owned here); the response payload was discarded.
    Concurrency,
}

impl FetchResult {
    pub(crate) fn as_u32(self) -> u32 {
        match self {
            FetchResult::Fail => 0,
            FetchResult::Success => 1,
            FetchResult::Concurrency => 2,
        }
    }

    pub(crate) fn from_u32(v: u32) -> Self {
        match v {
            1 => FetchResult::Success,
            2 => FetchResult::Concurrency,
            _ => FetchResult::Fail,
        }
    }
}

/// One page the requester wants, with the token identifying its fault
/// handle on the requester side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageCandidate {
    pub addr: u64,
    pub token: u64,
    /// Write access requested; the installed mapping is writable.
    pub write: bool,
}

/// Fetch request: the faulting candidate first, prefetch picks after it.
/// Addressed to a node already hosting the process; a node without a
/// context for `tgid` holds none of its pages and answers `Fail`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageFetchRequest {
    pub tgid: Tgid,
    pub candidates: Vec<PageCandidate>,
}

/// Per-candidate fetch response. `page` is empty unless `result` is
/// [`FetchResult::Success`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageFetchResponse {
    pub tgid: Tgid,
    pub addr: u64,
    pub token: u64,
    pub result: FetchResult,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "hex::serde")]
    pub page: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let msg = Message {
            from: NodeId(1),
            payload: Payload::PageFetchRequest(PageFetchRequest {
                tgid: 42,
                candidates: vec![
                    PageCandidate {
                        addr: 0x2000,
                        token: 7,
                        write: true,
                    },
                    PageCandidate {
                        addr: 0x4000,
                        token: 8,
                        write: false,
                    },
                ],
            }),
        };
        assert_eq!(msg.kind(), MessageKind::PageFetchRequest);

        let json = serde_json::to_string(&msg).expect("encode");
        let back: Message = serde_json::from_str(&json).expect("decode");
        match back.payload {
            Payload::PageFetchRequest(req) => {
                assert_eq!(req.tgid, 42);
                assert_eq!(req.candidates.len(), 2);
                assert_eq!(req.candidates[0].addr, 0x2000);
                assert!(req.candidates[0].write);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn page_bytes_travel_as_hex() {
        let resp = PageFetchResponse {
            tgid: 1,
            addr: 0x1000,
            token: 3,
            result: FetchResult::Success,
            page: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let json = serde_json::to_string(&resp).expect("encode");
        assert!(json.contains("\"deadbeef\""));

        let back: PageFetchResponse = serde_json::from_str(&json).expect("decode");
        assert_eq!(back.page, resp.page);
        assert_eq!(back.result, FetchResult::Success);
    }

    #[test]
    fn empty_page_is_omitted() {
        let resp = PageFetchResponse {
            tgid: 1,
            addr: 0x1000,
            token: 3,
            result: FetchResult::Fail,
            page: Vec::new(),
        };
        let json = serde_json::to_string(&resp).expect("encode");
        assert!(!json.contains("page"));

        let back: PageFetchResponse = serde_json::from_str(&json).expect("decode");
        assert!(back.page.is_empty());
        assert_eq!(back.result, FetchResult::Fail);
    }
}
