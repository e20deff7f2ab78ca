//! Block body and receipt fetching.
//!
//! Both are fetched by block hash for headers that are already trusted and are
//! checked against the commitments in those headers. Blocks whose header
//! commits to an empty list are completed locally without asking anyone.

use std::{collections::HashSet, sync::Arc};

use ethsync_common::{
    H256,
    types::{
        BlockBody, BlockHeader, InvalidBlockBodyError, Receipt, validate_block_body,
        validate_receipts,
    },
};
use futures::{FutureExt, future::BoxFuture};

use crate::{
    peer::{PeerConnection, PeerConnectionError, PeerId},
    types::{DataCategory, FetchRange, RequestId},
};

use super::{
    SharedProgress, SyncError, SyncProgress,
    fetcher::{Assignment, Delivery, FetchTask},
    queue::FetchQueue,
};

/// Per-block data fetched by hash and checked against a header commitment.
pub(crate) trait BlockData: Sized + Send + 'static {
    const CATEGORY: DataCategory;

    /// Whether the header commits to an empty value, which needs no fetch.
    fn committed_empty(header: &BlockHeader) -> bool;

    fn empty() -> Self;

    fn validate(&self, header: &BlockHeader) -> Result<(), InvalidBlockBodyError>;

    fn request(
        connection: Arc<dyn PeerConnection>,
        hashes: Vec<H256>,
    ) -> BoxFuture<'static, Result<Vec<Self>, PeerConnectionError>>;

    fn count(progress: &mut SyncProgress, items: u64);
}

impl BlockData for BlockBody {
    const CATEGORY: DataCategory = DataCategory::Bodies;

    fn committed_empty(header: &BlockHeader) -> bool {
        header.has_empty_body()
    }

    fn empty() -> Self {
        BlockBody::empty()
    }

    fn validate(&self, header: &BlockHeader) -> Result<(), InvalidBlockBodyError> {
        validate_block_body(header, self)
    }

    fn request(
        connection: Arc<dyn PeerConnection>,
        hashes: Vec<H256>,
    ) -> BoxFuture<'static, Result<Vec<Self>, PeerConnectionError>> {
        async move { connection.get_block_bodies(hashes).await }.boxed()
    }

    fn count(progress: &mut SyncProgress, items: u64) {
        progress.bodies += items;
    }
}

impl BlockData for Vec<Receipt> {
    const CATEGORY: DataCategory = DataCategory::Receipts;

    fn committed_empty(header: &BlockHeader) -> bool {
        header.has_empty_receipts()
    }

    fn empty() -> Self {
        Vec::new()
    }

    fn validate(&self, header: &BlockHeader) -> Result<(), InvalidBlockBodyError> {
        validate_receipts(header, self)
    }

    fn request(
        connection: Arc<dyn PeerConnection>,
        hashes: Vec<H256>,
    ) -> BoxFuture<'static, Result<Vec<Self>, PeerConnectionError>> {
        async move { connection.get_receipts(hashes).await }.boxed()
    }

    fn count(progress: &mut SyncProgress, items: u64) {
        progress.receipts += items;
    }
}

/// Fetches `D` for a run of consecutive headers.
///
/// Queue positions index into `wanted`, the headers that actually need a
/// fetch, so batches stay contiguous even when empty blocks are skipped.
pub(crate) struct BlockDataTask<D: BlockData> {
    headers: Arc<[BlockHeader]>,
    wanted: Vec<usize>,
    queue: FetchQueue<(D, PeerId)>,
    items: Vec<Option<D>>,
    delivered_by: Vec<Option<PeerId>>,
    released: usize,
    progress: SharedProgress,
}

pub(crate) type BodiesTask = BlockDataTask<BlockBody>;
pub(crate) type ReceiptsTask = BlockDataTask<Vec<Receipt>>;

/// Fetched values in header order, with the peer that delivered each one.
pub(crate) struct BlockDataOutput<D> {
    pub items: Vec<D>,
    pub delivered_by: Vec<Option<PeerId>>,
}

impl<D: BlockData> BlockDataTask<D> {
    pub fn new(
        session: u64,
        headers: Arc<[BlockHeader]>,
        batch_size: u64,
        progress: SharedProgress,
    ) -> Self {
        let mut items = Vec::with_capacity(headers.len());
        let mut wanted = Vec::new();
        for (index, header) in headers.iter().enumerate() {
            if D::committed_empty(header) {
                items.push(Some(D::empty()));
            } else {
                items.push(None);
                wanted.push(index);
            }
        }
        progress.update(|progress| D::count(progress, (headers.len() - wanted.len()) as u64));
        Self {
            queue: FetchQueue::new(session, 0, wanted.len() as u64, batch_size, true),
            delivered_by: vec![None; headers.len()],
            headers,
            wanted,
            items,
            released: 0,
            progress,
        }
    }

    fn header_at(&self, position: u64) -> Option<&BlockHeader> {
        self.wanted
            .get(position as usize)
            .map(|index| &self.headers[*index])
    }

    /// Block numbers covered by a range of queue positions.
    fn block_range(&self, range: FetchRange) -> FetchRange {
        let first = self.header_at(range.start).map(|h| h.number);
        let last = self.header_at(range.end().saturating_sub(1)).map(|h| h.number);
        match (first, last) {
            (Some(first), Some(last)) => FetchRange::new(first, last - first + 1),
            _ => range,
        }
    }

    pub fn into_output(self) -> BlockDataOutput<D> {
        BlockDataOutput {
            items: self.items.into_iter().flatten().collect(),
            delivered_by: self.delivered_by,
        }
    }
}

impl<D: BlockData> FetchTask for BlockDataTask<D> {
    type Request = Vec<H256>;
    type Response = Vec<D>;

    fn category(&self) -> DataCategory {
        D::CATEGORY
    }

    fn is_done(&self) -> bool {
        self.queue.is_done()
    }

    fn reserve(
        &mut self,
        peer: PeerId,
        capacity: u64,
        live_peers: &HashSet<PeerId>,
    ) -> Option<Assignment<Vec<H256>>> {
        let (id, range) = self.queue.reserve(peer, capacity, live_peers)?;
        let hashes = (range.start..range.end())
            .filter_map(|position| self.header_at(position).map(BlockHeader::hash))
            .collect();
        Some(Assignment {
            id,
            range: self.block_range(range),
            request: hashes,
        })
    }

    fn send(
        connection: Arc<dyn PeerConnection>,
        hashes: Vec<H256>,
    ) -> BoxFuture<'static, Result<Vec<D>, PeerConnectionError>> {
        D::request(connection, hashes)
    }

    fn deliver(
        &mut self,
        id: RequestId,
        peer: PeerId,
        response: Vec<D>,
    ) -> Result<Delivery, SyncError> {
        let Some(request) = self.queue.take(&id) else {
            return Ok(Delivery::Stale {
                items: response.len(),
            });
        };
        let range = request.range;
        let received = response.len();
        let mut fault = None;
        let mut accepted = Vec::with_capacity(received);
        for (offset, item) in response.into_iter().enumerate() {
            let position = range.start + offset as u64;
            let header = if position < range.end() {
                self.header_at(position)
            } else {
                None
            };
            let Some(header) = header else {
                fault = Some(format!("more items than the {} requested", range.count));
                break;
            };
            if let Err(err) = item.validate(header) {
                fault = Some(format!("block {}: {err}", header.number));
                break;
            }
            accepted.push((item, peer));
        }
        let valid = accepted.len();
        self.queue.complete(request, accepted, fault.is_some());

        let ready = self.queue.take_ready();
        let released = ready.len() as u64;
        for (item, delivered_by) in ready {
            let index = self.wanted[self.released];
            self.items[index] = Some(item);
            self.delivered_by[index] = Some(delivered_by);
            self.released += 1;
        }
        if released > 0 {
            self.progress.update(|progress| D::count(progress, released));
        }
        Ok(match fault {
            Some(reason) => Delivery::Rejected {
                accepted: valid,
                dropped: received - valid,
                reason,
            },
            None => Delivery::Accepted { items: valid },
        })
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
    use ethsync_common::{
        Bytes,
        types::{compute_receipts_root, compute_transactions_root},
    };

    fn peer(n: u64) -> PeerId {
        H256::from_low_u64_be(n)
    }

    fn body(number: u64) -> BlockBody {
        BlockBody {
            transactions: vec![Bytes::from(number.to_be_bytes().to_vec())],
            ommers: Vec::new(),
        }
    }

    /// Blocks 1..=len, every third one empty.
    fn headers(len: u64) -> (Arc<[BlockHeader]>, Vec<BlockBody>) {
        let mut headers = Vec::new();
        let mut bodies = Vec::new();
        for number in 1..=len {
            let body = if number % 3 == 0 {
                BlockBody::empty()
            } else {
                body(number)
            };
            headers.push(BlockHeader {
                number,
                transactions_root: compute_transactions_root(&body.transactions),
                receipts_root: if number % 3 == 0 {
                    compute_receipts_root(&[])
                } else {
                    compute_receipts_root(&[Receipt::new(true, number, Vec::new())])
                },
                ..Default::default()
            });
            bodies.push(body);
        }
        (headers.into(), bodies)
    }

    fn live(peers: &[u64]) -> HashSet<PeerId> {
        peers.iter().map(|n| peer(*n)).collect()
    }

    #[test]
    fn test_empty_bodies_are_not_requested() {
        let (headers, bodies) = headers(6);
        let mut task = BodiesTask::new(1, headers.clone(), 128, SharedProgress::default());
        let assignment = task.reserve(peer(1), 128, &live(&[1])).unwrap();
        let expected: Vec<H256> = [0, 1, 3, 4].iter().map(|i| headers[*i].hash()).collect();
        assert_eq!(assignment.request, expected);
        assert_eq!(assignment.range, FetchRange::new(1, 5));

        let response = [0, 1, 3, 4].iter().map(|i| bodies[*i].clone()).collect();
        assert_eq!(
            task.deliver(assignment.id, peer(1), response).unwrap(),
            Delivery::Accepted { items: 4 }
        );
        assert!(task.is_done());
        let output = task.into_output();
        assert_eq!(output.items, bodies);
        assert_eq!(output.delivered_by[2], None);
        assert_eq!(output.delivered_by[4], Some(peer(1)));
    }

    #[test]
    fn test_capacity_splits_requests() {
        let (headers, bodies) = headers(6);
        let mut task = BodiesTask::new(1, headers, 128, SharedProgress::default());
        let peers = live(&[1, 2]);
        let first = task.reserve(peer(1), 3, &peers).unwrap();
        let second = task.reserve(peer(2), 3, &peers).unwrap();
        assert_eq!(first.request.len(), 3);
        assert_eq!(second.request.len(), 1);

        task.deliver(second.id, peer(2), vec![bodies[4].clone()]).unwrap();
        assert!(!task.is_done());
        let response = [0, 1, 3].iter().map(|i| bodies[*i].clone()).collect();
        task.deliver(first.id, peer(1), response).unwrap();
        assert!(task.is_done());
        let output = task.into_output();
        assert_eq!(output.items, bodies);
        assert_eq!(output.delivered_by[4], Some(peer(2)));
    }

    #[test]
    fn test_invalid_body_keeps_prefix_and_requeues() {
        let (headers, bodies) = headers(5);
        let progress = SharedProgress::default();
        let mut task = BodiesTask::new(1, headers, 128, progress.clone());
        let peers = live(&[1, 2]);
        let assignment = task.reserve(peer(1), 128, &peers).unwrap();
        // Wanted blocks are 1, 2, 4, 5, the third answer belongs to block 5.
        let response = vec![bodies[0].clone(), bodies[1].clone(), bodies[4].clone()];
        let delivery = task.deliver(assignment.id, peer(1), response).unwrap();
        assert!(matches!(delivery, Delivery::Rejected { accepted: 2, dropped: 1, .. }));
        assert_eq!(progress.snapshot().bodies, 3);

        assert!(task.reserve(peer(1), 128, &peers).is_none());
        let retry = task.reserve(peer(2), 128, &peers).unwrap();
        assert_eq!(retry.range, FetchRange::new(4, 2));
        task.deliver(retry.id, peer(2), vec![bodies[3].clone(), bodies[4].clone()])
            .unwrap();
        assert!(task.is_done());
        assert_eq!(progress.snapshot().bodies, 5);
    }

    #[test]
    fn test_receipts_checked_against_root() {
        let (headers, _) = headers(2);
        let mut task = ReceiptsTask::new(1, headers, 256, SharedProgress::default());
        let assignment = task.reserve(peer(1), 256, &live(&[1])).unwrap();
        let wrong = vec![vec![Receipt::new(true, 2, Vec::new())]];
        assert!(matches!(
            task.deliver(assignment.id, peer(1), wrong).unwrap(),
            Delivery::Rejected { accepted: 0, .. }
        ));
        let retry = task.reserve(peer(1), 256, &live(&[1])).unwrap();
        let receipts = vec![
            vec![Receipt::new(true, 1, Vec::new())],
            vec![Receipt::new(true, 2, Vec::new())],
        ];
        task.deliver(retry.id, peer(1), receipts.clone()).unwrap();
        assert_eq!(task.into_output().items, receipts);
    }
}
