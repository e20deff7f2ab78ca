//! Sync module - drives light, full and snap synchronization
//!
//! The [`Downloader`] owns one sync session at a time. A session picks the
//! best peer, negotiates the common ancestor with it and then walks towards
//! the target in segments: a skeleton of headers from the master peer, fill
//! batches fetched in parallel from every peer, then bodies and receipts, and
//! finally the commit of the segment to the chain sink.
//!
//! Every parallel fetch is a [`fetcher::FetchTask`] run by the same driver,
//! which hands work to idle peers, applies timeouts and reassigns the work of
//! peers that disappear.

mod ancestor;
mod bodies;
mod downloader;
mod fetcher;
mod headers;
mod queue;
mod state;

use std::sync::{Arc, Mutex};

use ethsync_common::H256;
use serde::Serialize;

use crate::{
    chain::{ChainError, StateStoreError},
    peer::PeerId,
    peer_set::PeerSetError,
    types::{DataCategory, FetchRange},
};

pub use downloader::{ChainHeadEvent, Downloader};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Headers only
    Light,
    /// Every block is downloaded and executed
    #[default]
    Full,
    /// Blocks and receipts up to a pivot are stored without execution, the
    /// pivot state is downloaded node by node, the rest is executed
    Snap,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    SelectingPeer,
    NegotiatingAncestor,
    FetchingHeaders,
    FetchingBodiesAndReceipts,
    FetchingState,
    Committing,
    Cancelled,
}

/// Snapshot of the current (or last) sync session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub mode: SyncMode,
    pub phase: SyncPhase,
    /// Block the session started from
    pub origin: u64,
    /// Highest block committed
    pub current: u64,
    pub target: u64,
    pub pivot: Option<u64>,
    pub headers: u64,
    pub bodies: u64,
    pub receipts: u64,
    pub state_nodes: u64,
    pub pending_state_nodes: u64,
}

/// Progress shared between the downloader and its running fetches.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedProgress(Arc<Mutex<SyncProgress>>);

impl SharedProgress {
    pub fn update(&self, apply: impl FnOnce(&mut SyncProgress)) {
        let mut progress = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        apply(&mut progress);
    }

    pub fn snapshot(&self) -> SyncProgress {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Peer {peer:#x} misbehaved serving {category} {range}: {reason}")]
    PeerFault {
        peer: PeerId,
        category: DataCategory,
        range: FetchRange,
        reason: String,
    },
    #[error("Peer {peer:#x} timed out serving {category} {range}")]
    Timeout {
        peer: PeerId,
        category: DataCategory,
        range: FetchRange,
    },
    #[error("Invalid {category} {range}: {reason}")]
    ValidationFailure {
        category: DataCategory,
        range: FetchRange,
        peer: Option<PeerId>,
        reason: String,
    },
    #[error("No usable peers to sync from")]
    NoUsablePeers,
    #[error("Common ancestor with peer {peer:#x} not found: {reason}")]
    AncestorNotFound { peer: PeerId, reason: String },
    #[error("Sync cancelled")]
    Cancelled,
    #[error("Invalid sync target {target}, peer head is {head}")]
    InvalidTarget { target: u64, head: u64 },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    StateStore(#[from] StateStoreError),
    #[error("Error in Peer Set: {0}")]
    PeerSet(#[from] PeerSetError),
    #[error(transparent)]
    JoinHandle(#[from] tokio::task::JoinError),
    #[error("Unknown block {0:#x}")]
    UnknownBlock(H256),
}

impl SyncError {
    /// Whether a new session may succeed where this one failed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::PeerFault { .. }
            | SyncError::Timeout { .. }
            | SyncError::ValidationFailure { .. }
            | SyncError::NoUsablePeers
            | SyncError::AncestorNotFound { .. }
            | SyncError::Cancelled
            | SyncError::InvalidTarget { .. }
            | SyncError::PeerSet(_)
            | SyncError::UnknownBlock(_) => true,
            SyncError::Chain(_)
            | SyncError::StateStore(_)
            | SyncError::JoinHandle(_) => false,
        }
    }

    /// Peer the error is attributed to, if any.
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            SyncError::PeerFault { peer, .. }
            | SyncError::Timeout { peer, .. }
            | SyncError::AncestorNotFound { peer, .. } => Some(*peer),
            SyncError::ValidationFailure { peer, .. } => *peer,
            _ => None,
        }
    }

    /// Errors caused by the master peer that warrant retrying with another one.
    pub(crate) fn is_master_failure(&self) -> bool {
        matches!(
            self,
            SyncError::PeerFault { .. }
                | SyncError::Timeout { .. }
                | SyncError::AncestorNotFound { .. }
        )
    }
}
