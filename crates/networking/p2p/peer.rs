//! The request surface of a connected peer.
//!
//! Transport, handshake and message framing live in the wire layer. The sync
//! core only needs a handle able to answer the four eth retrieval requests.

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use ethsync_common::{
    H256,
    types::{BlockBody, BlockHeader, Receipt},
};
use thiserror::Error;

pub type PeerId = H256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    Hash(H256),
    Number(u64),
}

impl From<u64> for HashOrNumber {
    fn from(number: u64) -> Self {
        HashOrNumber::Number(number)
    }
}

impl From<H256> for HashOrNumber {
    fn from(hash: H256) -> Self {
        HashOrNumber::Hash(hash)
    }
}

/// GetBlockHeaders request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadersRequest {
    pub start: HashOrNumber,
    pub limit: u64,
    pub skip: u64,
    pub reverse: bool,
}

impl HeadersRequest {
    /// `limit` consecutive headers starting at `start`, oldest first.
    pub fn range(start: u64, limit: u64) -> Self {
        Self {
            start: HashOrNumber::Number(start),
            limit,
            skip: 0,
            reverse: false,
        }
    }

    /// A single header.
    pub fn single(start: impl Into<HashOrNumber>) -> Self {
        Self {
            start: start.into(),
            limit: 1,
            skip: 0,
            reverse: false,
        }
    }

    /// `limit` headers starting at `start`, `skip` headers apart.
    pub fn spaced(start: u64, limit: u64, skip: u64) -> Self {
        Self {
            start: HashOrNumber::Number(start),
            limit,
            skip,
            reverse: false,
        }
    }

    /// Block numbers this request covers when started by number.
    pub fn numbers(&self) -> Vec<u64> {
        let HashOrNumber::Number(start) = self.start else {
            return Vec::new();
        };
        (0..self.limit)
            .map(|i| {
                let offset = i * (self.skip + 1);
                if self.reverse {
                    start.saturating_sub(offset)
                } else {
                    start + offset
                }
            })
            .collect()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerConnectionError {
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Peer sent a message that violates the protocol: {0}")]
    ProtocolViolation(String),
    #[error("Failed to send request to peer: {0}")]
    SendFailed(String),
}

/// Request/response handle of a connected peer.
///
/// Implementations answer with whatever the peer returned (possibly fewer items
/// than requested, possibly nothing). Validation happens in the sync core.
#[async_trait]
pub trait PeerConnection: Debug + Send + Sync {
    async fn get_block_headers(
        &self,
        request: HeadersRequest,
    ) -> Result<Vec<BlockHeader>, PeerConnectionError>;

    async fn get_block_bodies(
        &self,
        block_hashes: Vec<H256>,
    ) -> Result<Vec<BlockBody>, PeerConnectionError>;

    async fn get_receipts(
        &self,
        block_hashes: Vec<H256>,
    ) -> Result<Vec<Vec<Receipt>>, PeerConnectionError>;

    async fn get_node_data(&self, hashes: Vec<H256>) -> Result<Vec<Bytes>, PeerConnectionError>;
}
