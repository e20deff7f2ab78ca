//! Skeleton header sync.
//!
//! The master peer provides a sparse skeleton, one header every
//! `header_batch_size` blocks plus the header at the end of the segment. The
//! gaps are then filled in parallel by every available peer, each fill batch
//! being anchored to the skeleton header before it and the one that closes it.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use ethsync_common::{H256, types::BlockHeader};
use futures::{FutureExt, future::BoxFuture};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    consensus::ConsensusEngine,
    peer::{HashOrNumber, HeadersRequest, PeerConnection, PeerConnectionError, PeerId},
    peer_set::SyncPeer,
    types::{DataCategory, FetchRange, RequestId},
};

use super::{
    SharedProgress, SyncError,
    fetcher::{Assignment, Delivery, FetchContext, FetchTask},
    queue::FetchQueue,
};

fn request_range(request: &HeadersRequest) -> FetchRange {
    match request.start {
        HashOrNumber::Number(start) => FetchRange::new(start, request.limit),
        HashOrNumber::Hash(_) => FetchRange::new(0, request.limit),
    }
}

/// Sends a single header request to `peer`, outside of any fetch queue.
pub(crate) async fn request_headers(
    ctx: &FetchContext,
    peer: &SyncPeer,
    request: HeadersRequest,
) -> Result<Vec<BlockHeader>, SyncError> {
    let id = peer.id();
    let category = DataCategory::Headers;
    let range = request_range(&request);
    let slot = ctx.peers.begin_request(&id, category)?;
    let timeout = ctx.peers.request_timeout(&id);
    let connection = peer.connection();
    let started = Instant::now();
    let response = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(SyncError::Cancelled),
        response = tokio::time::timeout(timeout, connection.get_block_headers(request)) => response,
    };
    drop(slot);
    match response {
        Ok(Ok(headers)) => {
            let elapsed = started.elapsed();
            ctx.metrics.record_inbound(category, headers.len());
            ctx.metrics.record_latency(category, elapsed);
            ctx.peers
                .record_delivery(&id, category, headers.len(), elapsed);
            Ok(headers)
        }
        Ok(Err(err)) => Err(SyncError::PeerFault {
            peer: id,
            category,
            range,
            reason: err.to_string(),
        }),
        Err(_) => {
            ctx.metrics.record_timeout(category);
            ctx.peers.record_timeout(&id, category);
            Err(SyncError::Timeout {
                peer: id,
                category,
                range,
            })
        }
    }
}

/// Block numbers of the skeleton headers closing each fill batch between
/// `from` (exclusive) and `to` (inclusive).
pub(crate) fn skeleton_positions(from: u64, to: u64, batch_size: u64) -> Vec<u64> {
    let mut positions: Vec<u64> = (1..)
        .map(|i| from + i * batch_size)
        .take_while(|number| *number <= to)
        .collect();
    if positions.last() != Some(&to) && to > from {
        positions.push(to);
    }
    positions
}

/// Fetches the skeleton of the segment `(from, to]` from the master peer.
pub(crate) async fn fetch_skeleton(
    ctx: &FetchContext,
    master: &SyncPeer,
    from: u64,
    to: u64,
    batch_size: u64,
) -> Result<Vec<BlockHeader>, SyncError> {
    let positions = skeleton_positions(from, to, batch_size);
    let spaced: Vec<u64> = positions
        .iter()
        .copied()
        .filter(|number| (number - from) % batch_size == 0)
        .collect();
    let mut skeleton = Vec::with_capacity(positions.len());
    if let Some(first) = spaced.first() {
        let request = HeadersRequest::spaced(*first, spaced.len() as u64, batch_size - 1);
        skeleton.extend(request_headers(ctx, master, request).await?);
    }
    if spaced.len() < positions.len() {
        skeleton.extend(request_headers(ctx, master, HeadersRequest::single(to)).await?);
    }
    let numbers: Vec<u64> = skeleton.iter().map(|header| header.number).collect();
    if numbers != positions {
        return Err(SyncError::PeerFault {
            peer: master.id(),
            category: DataCategory::Headers,
            range: FetchRange::new(from + 1, to - from),
            reason: format!(
                "skeleton has {} headers, expected {}",
                numbers.len(),
                positions.len()
            ),
        });
    }
    debug!(peer = %master.id(), from, to, anchors = skeleton.len(), "Fetched skeleton");
    Ok(skeleton)
}

/// Parallel fill of the gaps of a skeleton.
pub(crate) struct HeaderFill {
    queue: FetchQueue<BlockHeader>,
    engine: ConsensusEngine,
    /// Trusted headers fill batches link to: the segment origin and the skeleton
    anchors: BTreeMap<u64, BlockHeader>,
    master: PeerId,
    /// Distinct peers that disagreed with the skeleton anywhere in the segment
    mismatches: HashSet<PeerId>,
    mismatch_limit: usize,
    released: Vec<BlockHeader>,
    progress: SharedProgress,
}

impl HeaderFill {
    pub fn new(
        session: u64,
        origin: BlockHeader,
        skeleton: Vec<BlockHeader>,
        master: PeerId,
        engine: ConsensusEngine,
        mismatch_limit: usize,
        progress: SharedProgress,
    ) -> Self {
        let mut ranges = Vec::with_capacity(skeleton.len());
        let mut previous = origin.number;
        for anchor in &skeleton {
            ranges.push(FetchRange::new(previous + 1, anchor.number - previous));
            previous = anchor.number;
        }
        let mut anchors = BTreeMap::new();
        anchors.insert(origin.number, origin);
        for header in skeleton {
            anchors.insert(header.number, header);
        }
        Self {
            queue: FetchQueue::from_ranges(session, &ranges, false),
            engine,
            anchors,
            master,
            mismatches: HashSet::new(),
            mismatch_limit,
            released: Vec::new(),
            progress,
        }
    }

    /// Headers of the segment in ascending order.
    pub fn into_headers(self) -> Vec<BlockHeader> {
        self.released
    }

    fn anchor_hash(&self, number: u64) -> Option<H256> {
        self.anchors.get(&number).map(BlockHeader::hash)
    }

    /// Records a batch that does not link to the skeleton. Enough distinct
    /// peers disagreeing with the skeleton means the master lied.
    fn anchor_mismatch(
        &mut self,
        peer: PeerId,
        range: FetchRange,
        reason: &str,
    ) -> Result<(), SyncError> {
        self.mismatches.insert(peer);
        let disagreeing = self.mismatches.len();
        if peer == self.master || disagreeing >= self.mismatch_limit {
            warn!(master = %self.master, %range, disagreeing, "Skeleton rejected by fill peers");
            return Err(SyncError::PeerFault {
                peer: self.master,
                category: DataCategory::Headers,
                range,
                reason: format!("skeleton not matched by {disagreeing} peers: {reason}"),
            });
        }
        Ok(())
    }
}

impl FetchTask for HeaderFill {
    type Request = HeadersRequest;
    type Response = Vec<BlockHeader>;

    fn category(&self) -> DataCategory {
        DataCategory::Headers
    }

    fn is_done(&self) -> bool {
        self.queue.is_done()
    }

    fn reserve(
        &mut self,
        peer: PeerId,
        capacity: u64,
        live_peers: &HashSet<PeerId>,
    ) -> Option<Assignment<HeadersRequest>> {
        let (id, range) = self.queue.reserve(peer, capacity, live_peers)?;
        Some(Assignment {
            id,
            range,
            request: HeadersRequest::range(range.start, range.count),
        })
    }

    fn send(
        connection: Arc<dyn PeerConnection>,
        request: HeadersRequest,
    ) -> BoxFuture<'static, Result<Vec<BlockHeader>, PeerConnectionError>> {
        async move { connection.get_block_headers(request).await }.boxed()
    }

    fn deliver(
        &mut self,
        id: RequestId,
        peer: PeerId,
        headers: Vec<BlockHeader>,
    ) -> Result<Delivery, SyncError> {
        let Some(request) = self.queue.take(&id) else {
            return Ok(Delivery::Stale {
                items: headers.len(),
            });
        };
        let range = request.range;
        let received = headers.len();
        let Some(parent) = self.anchors.get(&(range.start - 1)).cloned() else {
            return Err(SyncError::ValidationFailure {
                category: DataCategory::Headers,
                range,
                peer: None,
                reason: "fill batch has no anchor".to_string(),
            });
        };

        let mut fault = None;
        let mut anchor_fault = None;
        let mut previous = &parent;
        for (offset, header) in headers.iter().enumerate() {
            let expected = range.start + offset as u64;
            if expected >= range.end() {
                fault = Some(format!("more headers than the {} requested", range.count));
                break;
            }
            if header.number != expected {
                fault = Some(format!("header {} where {expected} was expected", header.number));
                break;
            }
            if offset == 0 && header.parent_hash != parent.hash() {
                anchor_fault = Some(format!("header {expected} does not link to its anchor"));
                break;
            }
            if let Err(err) = self.engine.verify_header(header, previous) {
                fault = Some(err.to_string());
                break;
            }
            previous = header;
        }
        let complete = received as u64 == range.count;
        if fault.is_none() && anchor_fault.is_none() && complete {
            let closing = range.end() - 1;
            if headers.last().map(BlockHeader::hash) != self.anchor_hash(closing) {
                anchor_fault = Some(format!("header {closing} does not match the skeleton"));
            }
        }

        if let Some(reason) = anchor_fault {
            self.anchor_mismatch(peer, range, &reason)?;
            self.queue.complete(request, Vec::new(), true);
            return Ok(Delivery::Disputed {
                items: received,
                reason,
            });
        }
        if let Some(reason) = fault {
            self.queue.complete(request, Vec::new(), true);
            return Ok(Delivery::Rejected {
                accepted: 0,
                dropped: received,
                reason,
            });
        }
        // A fill is only trusted once it links both anchors, short answers are retried whole.
        if !complete {
            debug!(%peer, %range, received, "Incomplete header batch");
            self.queue.complete(request, Vec::new(), false);
            return Ok(Delivery::Accepted { items: 0 });
        }

        self.queue.complete(request, headers, false);
        let ready = self.queue.take_ready();
        if !ready.is_empty() {
            self.progress
                .update(|progress| progress.headers += ready.len() as u64);
            self.released.extend(ready);
        }
        Ok(Delivery::Accepted { items: received })
    }

    fn fail(&mut self, id: RequestId) -> bool {
        self.queue.fail(&id).is_some()
    }

    fn fail_peer(&mut self, peer: PeerId) -> usize {
        self.queue.fail_peer(&peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethsync_common::U256;

    fn chain(len: u64) -> Vec<BlockHeader> {
        let mut headers = vec![BlockHeader {
            difficulty: U256::from(131_072),
            gas_limit: 8_000_000,
            ..Default::default()
        }];
        for number in 1..len {
            let parent = &headers[number as usize - 1];
            headers.push(BlockHeader {
                parent_hash: parent.hash(),
                number,
                timestamp: number * 10,
                difficulty: parent.difficulty,
                gas_limit: parent.gas_limit,
                ..Default::default()
            });
        }
        headers
    }

    fn peer(n: u64) -> PeerId {
        H256::from_low_u64_be(n)
    }

    fn fill(headers: &[BlockHeader], to: u64, batch: u64) -> HeaderFill {
        let skeleton = skeleton_positions(0, to, batch)
            .into_iter()
            .map(|n| headers[n as usize].clone())
            .collect();
        HeaderFill::new(
            1,
            headers[0].clone(),
            skeleton,
            peer(1),
            ConsensusEngine::default(),
            2,
            SharedProgress::default(),
        )
    }

    fn live(peers: &[u64]) -> HashSet<PeerId> {
        peers.iter().map(|n| peer(*n)).collect()
    }

    #[test]
    fn test_skeleton_positions() {
        assert_eq!(skeleton_positions(0, 10, 4), vec![4, 8, 10]);
        assert_eq!(skeleton_positions(100, 108, 4), vec![104, 108]);
        assert_eq!(skeleton_positions(5, 7, 192), vec![7]);
        assert!(skeleton_positions(5, 5, 192).is_empty());
    }

    #[test]
    fn test_fill_releases_in_order() {
        let headers = chain(11);
        let mut task = fill(&headers, 10, 4);
        let peers = live(&[2, 3, 4]);
        let a = task.reserve(peer(2), 192, &peers).unwrap();
        let b = task.reserve(peer(3), 192, &peers).unwrap();
        let c = task.reserve(peer(4), 192, &peers).unwrap();
        assert_eq!(c.range, FetchRange::new(9, 2));

        let slice = |range: FetchRange| headers[range.start as usize..range.end() as usize].to_vec();
        assert_eq!(
            task.deliver(c.id, peer(4), slice(c.range)).unwrap(),
            Delivery::Accepted { items: 2 }
        );
        task.deliver(b.id, peer(3), slice(b.range)).unwrap();
        assert!(!task.is_done());
        task.deliver(a.id, peer(2), slice(a.range)).unwrap();
        assert!(task.is_done());
        assert_eq!(task.into_headers(), headers[1..].to_vec());
    }

    #[test]
    fn test_short_fill_is_retried_whole() {
        let headers = chain(9);
        let mut task = fill(&headers, 8, 8);
        let peers = live(&[2]);
        let a = task.reserve(peer(2), 192, &peers).unwrap();
        assert_eq!(
            task.deliver(a.id, peer(2), headers[1..4].to_vec()).unwrap(),
            Delivery::Accepted { items: 0 }
        );
        let b = task.reserve(peer(2), 192, &peers).unwrap();
        assert_eq!(b.range, FetchRange::new(1, 8));
        task.deliver(b.id, peer(2), headers[1..9].to_vec()).unwrap();
        assert_eq!(task.into_headers(), headers[1..].to_vec());
    }

    #[test]
    fn test_broken_linkage_is_rejected() {
        let headers = chain(9);
        let mut task = fill(&headers, 8, 8);
        let peers = live(&[2, 3]);
        let a = task.reserve(peer(2), 192, &peers).unwrap();
        let mut response = headers[1..9].to_vec();
        response[3].timestamp += 1;
        let delivery = task.deliver(a.id, peer(2), response).unwrap();
        assert!(matches!(delivery, Delivery::Rejected { accepted: 0, dropped: 8, .. }));
        // The faulty peer is not offered the batch again while another peer is around.
        assert!(task.reserve(peer(2), 192, &peers).is_none());
        let b = task.reserve(peer(3), 192, &peers).unwrap();
        assert_eq!(b.range, FetchRange::new(1, 8));
    }

    #[test]
    fn test_skeleton_mismatch_blames_master() {
        let headers = chain(9);
        let mut forged = chain(9);
        forged[8].extra_data = ethsync_common::Bytes::from_static(b"forged");
        let skeleton = vec![forged[8].clone()];
        let mut task = HeaderFill::new(
            1,
            headers[0].clone(),
            skeleton,
            peer(1),
            ConsensusEngine::default(),
            2,
            SharedProgress::default(),
        );
        let peers = live(&[1, 2, 3]);
        let a = task.reserve(peer(2), 192, &peers).unwrap();
        assert!(matches!(
            task.deliver(a.id, peer(2), headers[1..9].to_vec()).unwrap(),
            Delivery::Disputed { items: 8, .. }
        ));
        // The disputing peer is skipped for that batch but not treated as faulty.
        assert!(task.reserve(peer(2), 192, &peers).is_none());
        let b = task.reserve(peer(3), 192, &peers).unwrap();
        let err = task.deliver(b.id, peer(3), headers[1..9].to_vec()).unwrap_err();
        assert!(matches!(err, SyncError::PeerFault { peer, .. } if peer == H256::from_low_u64_be(1)));
    }

    #[test]
    fn test_mismatches_are_counted_across_the_segment() {
        let headers = chain(9);
        let mut forged = chain(9);
        forged[4].extra_data = ethsync_common::Bytes::from_static(b"forged");
        let skeleton = vec![forged[4].clone(), headers[8].clone()];
        let mut task = HeaderFill::new(
            1,
            headers[0].clone(),
            skeleton,
            peer(1),
            ConsensusEngine::default(),
            2,
            SharedProgress::default(),
        );
        let peers = live(&[1, 2, 3]);
        let a = task.reserve(peer(2), 192, &peers).unwrap();
        assert_eq!(a.range, FetchRange::new(1, 4));
        let b = task.reserve(peer(3), 192, &peers).unwrap();
        assert_eq!(b.range, FetchRange::new(5, 4));
        // Peer 2 disagrees on the closing anchor of the first batch.
        assert!(matches!(
            task.deliver(a.id, peer(2), headers[1..5].to_vec()).unwrap(),
            Delivery::Disputed { .. }
        ));
        // Peer 3 disagrees on the opening anchor of the second batch, which
        // makes two distinct peers against the same skeleton.
        let err = task.deliver(b.id, peer(3), headers[5..9].to_vec()).unwrap_err();
        assert!(matches!(err, SyncError::PeerFault { peer, .. } if peer == H256::from_low_u64_be(1)));
    }

    #[test]
    fn test_stale_response_is_discarded() {
        let headers = chain(5);
        let mut task = fill(&headers, 4, 4);
        let peers = live(&[2, 3]);
        let a = task.reserve(peer(2), 192, &peers).unwrap();
        assert_eq!(task.fail_peer(peer(2)), 1);
        assert_eq!(
            task.deliver(a.id, peer(2), headers[1..5].to_vec()).unwrap(),
            Delivery::Stale { items: 4 }
        );
        let b = task.reserve(peer(3), 192, &peers).unwrap();
        assert_eq!(b.range, a.range);
        assert_ne!(b.id, a.id);
    }
}
