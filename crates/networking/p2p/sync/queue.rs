//! Range bookkeeping shared by the header, body and receipt fetchers.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{
    peer::PeerId,
    types::{FetchRange, RequestId},
};

#[derive(Debug, Clone)]
struct PendingBatch {
    count: u64,
    /// Peers that already failed to serve this batch
    failed_by: HashSet<PeerId>,
}

#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub peer: PeerId,
    pub range: FetchRange,
    failed_by: HashSet<PeerId>,
}

/// Ordered work queue over the positions `[start, end)`.
///
/// Pending batches are handed out lowest first. A batch is owned by exactly one
/// request until it is delivered, or declared lost and put back. Delivered
/// items land in a reassembly buffer keyed by position and leave it only as a
/// contiguous prefix.
#[derive(Debug)]
pub(crate) struct FetchQueue<T> {
    session: u64,
    next_attempt: u64,
    pending: BTreeMap<u64, PendingBatch>,
    in_flight: HashMap<RequestId, InFlight>,
    done: BTreeMap<u64, T>,
    next_release: u64,
    end: u64,
    /// Whether a batch can be handed out partially to match a peer's capacity
    splittable: bool,
}

impl<T> FetchQueue<T> {
    /// Queue over explicit batches. Ranges must be sorted, non overlapping and
    /// gap free.
    pub fn from_ranges(session: u64, ranges: &[FetchRange], splittable: bool) -> Self {
        let start = ranges.first().map(|range| range.start).unwrap_or_default();
        let end = ranges.last().map(FetchRange::end).unwrap_or(start);
        let pending = ranges
            .iter()
            .filter(|range| range.count > 0)
            .map(|range| {
                (
                    range.start,
                    PendingBatch {
                        count: range.count,
                        failed_by: HashSet::new(),
                    },
                )
            })
            .collect();
        Self {
            session,
            next_attempt: 0,
            pending,
            in_flight: HashMap::new(),
            done: BTreeMap::new(),
            next_release: start,
            end,
            splittable,
        }
    }

    /// Queue over `count` positions from `start` cut into batches of `batch_size`.
    pub fn new(session: u64, start: u64, count: u64, batch_size: u64, splittable: bool) -> Self {
        let batch_size = batch_size.max(1);
        let mut ranges = Vec::new();
        let mut position = start;
        while position < start + count {
            let len = batch_size.min(start + count - position);
            ranges.push(FetchRange::new(position, len));
            position += len;
        }
        let mut queue = Self::from_ranges(session, &ranges, splittable);
        queue.next_release = start;
        queue.end = start + count;
        queue
    }

    /// Hands the lowest batch `peer` has not failed to it.
    /// `live_peers` are the peers currently able to serve requests: once all of
    /// them failed a batch, its failures are forgotten and it is retried.
    pub fn reserve(
        &mut self,
        peer: PeerId,
        capacity: u64,
        live_peers: &HashSet<PeerId>,
    ) -> Option<(RequestId, FetchRange)> {
        let start = self.pending.iter_mut().find_map(|(start, batch)| {
            if !batch.failed_by.contains(&peer) {
                return Some(*start);
            }
            if live_peers.iter().all(|live| batch.failed_by.contains(live)) {
                batch.failed_by.clear();
                return Some(*start);
            }
            None
        })?;
        let mut batch = self.pending.remove(&start)?;
        let mut range = FetchRange::new(start, batch.count);
        if self.splittable && batch.count > capacity.max(1) {
            range.count = capacity.max(1);
            batch.count -= range.count;
            self.pending.insert(range.end(), batch.clone());
        }
        let id = RequestId {
            session: self.session,
            attempt: self.next_attempt,
        };
        self.next_attempt += 1;
        self.in_flight.insert(
            id,
            InFlight {
                peer,
                range,
                failed_by: batch.failed_by,
            },
        );
        Some((id, range))
    }

    /// Removes the request from the in-flight set. `None` means the response
    /// is stale.
    pub fn take(&mut self, id: &RequestId) -> Option<InFlight> {
        self.in_flight.remove(id)
    }

    /// Stores the delivered prefix of a request and puts the rest back. The
    /// serving peer is excluded from the rest when it was at fault or
    /// delivered nothing at all.
    pub fn complete(&mut self, request: InFlight, items: Vec<T>, peer_failed: bool) {
        let delivered = (items.len() as u64).min(request.range.count);
        for (offset, item) in items.into_iter().take(delivered as usize).enumerate() {
            self.done.insert(request.range.start + offset as u64, item);
        }
        if delivered < request.range.count {
            let mut failed_by = request.failed_by;
            if peer_failed || delivered == 0 {
                failed_by.insert(request.peer);
            }
            self.requeue(
                FetchRange::new(
                    request.range.start + delivered,
                    request.range.count - delivered,
                ),
                failed_by,
            );
        }
    }

    /// Puts a lost request back, excluding the peer that lost it.
    pub fn fail(&mut self, id: &RequestId) -> Option<InFlight> {
        let request = self.in_flight.remove(id)?;
        let mut failed_by = request.failed_by.clone();
        failed_by.insert(request.peer);
        self.requeue(request.range, failed_by);
        Some(request)
    }

    /// Fails every request in flight to `peer`. Returns how many there were.
    pub fn fail_peer(&mut self, peer: &PeerId) -> usize {
        let ids: Vec<RequestId> = self
            .in_flight
            .iter()
            .filter(|(_, request)| request.peer == *peer)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.fail(id);
        }
        ids.len()
    }

    fn requeue(&mut self, range: FetchRange, failed_by: HashSet<PeerId>) {
        if range.count == 0 {
            return;
        }
        self.pending.insert(
            range.start,
            PendingBatch {
                count: range.count,
                failed_by,
            },
        );
    }

    /// Removes and returns the contiguous run of delivered items starting at
    /// the first position not yet released.
    pub fn take_ready(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(item) = self.done.remove(&self.next_release) {
            ready.push(item);
            self.next_release += 1;
        }
        ready
    }

    /// Every position was delivered and released.
    pub fn is_done(&self) -> bool {
        self.next_release >= self.end
    }

    #[cfg(test)]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Ranges currently owned by in-flight requests.
    #[cfg(test)]
    pub fn in_flight_ranges(&self) -> Vec<FetchRange> {
        let mut ranges: Vec<FetchRange> = self.in_flight.values().map(|r| r.range).collect();
        ranges.sort();
        ranges
    }
}
