//! Common ancestor negotiation with the master peer.

use std::sync::Arc;

use ethsync_common::types::BlockHeader;
use tracing::debug;

use crate::{chain::ChainSink, peer::HeadersRequest, peer_set::SyncPeer};

use super::{SyncError, fetcher::FetchContext, headers::request_headers};

#[derive(Debug)]
pub(crate) struct Ancestor {
    /// Local copy of the highest block both chains share
    pub header: BlockHeader,
    pub probes: u32,
}

struct Search<'a> {
    ctx: &'a FetchContext,
    chain: &'a Arc<dyn ChainSink>,
    peer: &'a SyncPeer,
    probes: u32,
}

impl Search<'_> {
    fn not_found(&self, reason: impl Into<String>) -> SyncError {
        SyncError::AncestorNotFound {
            peer: self.peer.id(),
            reason: reason.into(),
        }
    }

    /// Asks the peer for its header at `number` and returns our copy of it if
    /// we have it on the canonical chain.
    async fn probe(&mut self, number: u64) -> Result<Option<BlockHeader>, SyncError> {
        self.probes += 1;
        let headers = match request_headers(self.ctx, self.peer, HeadersRequest::single(number))
            .await
        {
            Ok(headers) => headers,
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(err) => return Err(self.not_found(err.to_string())),
        };
        let [remote] = headers.as_slice() else {
            return Err(self.not_found(format!(
                "expected one header at {number}, got {}",
                headers.len()
            )));
        };
        if remote.number != number {
            return Err(self.not_found(format!(
                "asked for header {number}, got {}",
                remote.number
            )));
        }
        let local = self
            .chain
            .get_header_by_hash(remote.hash())?
            .filter(|local| local.number == number);
        debug!(peer = %self.peer.id(), number, known = local.is_some(), "Ancestor probe");
        Ok(local)
    }
}

/// Finds the highest block shared by the local chain and `peer`.
///
/// The header at the lower of both heads is probed first, which settles the
/// common case of a peer extending our chain. Otherwise the fork point is
/// binary searched, taking at most `ceil(log2(height)) + 1` probes.
pub(crate) async fn find_common_ancestor(
    ctx: &FetchContext,
    chain: &Arc<dyn ChainSink>,
    peer: &SyncPeer,
    local_head: &BlockHeader,
    max_fork_ancestry: u64,
) -> Result<Ancestor, SyncError> {
    let mut search = Search {
        ctx,
        chain,
        peer,
        probes: 0,
    };
    let height = local_head.number.min(peer.info.head_number);

    let header = match search.probe(height).await? {
        Some(header) => header,
        None => {
            // Invariant: `lo` is shared (or untested genesis), `hi` is not.
            let (mut lo, mut hi) = (0u64, height);
            let mut known = None;
            while lo + 1 < hi {
                let mid = lo + (hi - lo) / 2;
                match search.probe(mid).await? {
                    Some(header) => {
                        lo = mid;
                        known = Some(header);
                    }
                    None => hi = mid,
                }
            }
            match known {
                Some(header) => header,
                None if height == 0 => {
                    return Err(search.not_found("genesis mismatch"));
                }
                None => search
                    .probe(0)
                    .await?
                    .ok_or_else(|| search.not_found("genesis mismatch"))?,
            }
        }
    };

    let depth = local_head.number - header.number;
    if depth > max_fork_ancestry {
        return Err(search.not_found(format!(
            "ancestor {} is {depth} blocks below the local head, limit is {max_fork_ancestry}",
            header.number
        )));
    }
    debug!(peer = %peer.id(), ancestor = header.number, probes = search.probes, "Found common ancestor");
    Ok(Ancestor {
        header,
        probes: search.probes,
    })
}
