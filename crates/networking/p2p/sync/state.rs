//! State trie download by node hash.
//!
//! Starting from the pivot state root, nodes are requested breadth first. A
//! retrieved node is held in memory until every node it references is stored,
//! then committed, so the database never contains a node whose subtrie is
//! incomplete. Committed nodes are flushed to the [`StateStore`] in batches.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use ethsync_common::{Bytes, H256, constants::EMPTY_TRIE_HASH, utils::keccak};
use futures::{FutureExt, future::BoxFuture};
use tracing::debug;

use crate::{
    chain::StateStore,
    peer::{PeerConnection, PeerConnectionError, PeerId},
    types::{DataCategory, FetchRange, RequestId},
};

use super::{
    SharedProgress, SyncError,
    fetcher::{Assignment, Delivery, FetchTask},
};

#[derive(Debug)]
struct Scheduled {
    failed_by: HashSet<PeerId>,
}

/// A retrieved node waiting for its children.
#[derive(Debug)]
struct WaitingNode {
    data: Bytes,
    missing_children: usize,
}

pub(crate) struct StateSync {
    store: Arc<dyn StateStore>,
    root: H256,
    session: u64,
    next_attempt: u64,
    /// Hashes to request, in breadth first order
    queue: VecDeque<H256>,
    scheduled: HashMap<H256, Scheduled>,
    in_flight: HashMap<RequestId, (PeerId, Vec<H256>)>,
    waiting: HashMap<H256, WaitingNode>,
    /// Nodes waiting on a child, keyed by the child
    parents: HashMap<H256, Vec<H256>>,
    /// Committed nodes not yet flushed to the store
    membatch: Vec<(H256, Bytes)>,
    membatch_hashes: HashSet<H256>,
    commit_batch: usize,
    committed: u64,
    progress: SharedProgress,
}

impl StateSync {
    pub fn new(
        session: u64,
        root: H256,
        store: Arc<dyn StateStore>,
        commit_batch: usize,
        progress: SharedProgress,
    ) -> Result<Self, SyncError> {
        let mut sync = Self {
            store,
            root,
            session,
            next_attempt: 0,
            queue: VecDeque::new(),
            scheduled: HashMap::new(),
            in_flight: HashMap::new(),
            waiting: HashMap::new(),
            parents: HashMap::new(),
            membatch: Vec::new(),
            membatch_hashes: HashSet::new(),
            commit_batch: commit_batch.max(1),
            committed: 0,
            progress,
        };
        if root != EMPTY_TRIE_HASH && !sync.store.has_node(root)? {
            sync.schedule(root);
        }
        sync.report();
        Ok(sync)
    }

    pub fn root(&self) -> H256 {
        self.root
    }

    /// Nodes known to be missing but not yet committed.
    pub fn pending(&self) -> usize {
        self.scheduled.len() + self.waiting.len()
    }

    fn is_known(&self, hash: &H256) -> Result<bool, SyncError> {
        Ok(self.membatch_hashes.contains(hash) || self.store.has_node(*hash)?)
    }

    fn schedule(&mut self, hash: H256) {
        if self.scheduled.contains_key(&hash) {
            return;
        }
        self.scheduled.insert(
            hash,
            Scheduled {
                failed_by: HashSet::new(),
            },
        );
        self.queue.push_back(hash);
    }

    /// Links a retrieved node into the dependency graph, committing it right
    /// away if its children are all present.
    fn process(&mut self, hash: H256, data: Bytes) -> Result<(), SyncError> {
        let mut missing = 0;
        for child in self.store.child_hashes(hash, &data)? {
            if child == EMPTY_TRIE_HASH || self.is_known(&child)? {
                continue;
            }
            missing += 1;
            self.parents.entry(child).or_default().push(hash);
            if !self.waiting.contains_key(&child) {
                self.schedule(child);
            }
        }
        if missing == 0 {
            self.commit(hash, data)
        } else {
            self.waiting.insert(
                hash,
                WaitingNode {
                    data,
                    missing_children: missing,
                },
            );
            Ok(())
        }
    }

    fn commit(&mut self, hash: H256, data: Bytes) -> Result<(), SyncError> {
        let mut ready = vec![(hash, data)];
        while let Some((hash, data)) = ready.pop() {
            self.membatch_hashes.insert(hash);
            self.membatch.push((hash, data));
            self.committed += 1;
            for parent in self.parents.remove(&hash).unwrap_or_default() {
                let Some(node) = self.waiting.get_mut(&parent) else {
                    continue;
                };
                node.missing_children -= 1;
                if node.missing_children == 0 {
                    if let Some(node) = self.waiting.remove(&parent) {
                        ready.push((parent, node.data));
                    }
                }
            }
        }
        if self.membatch.len() >= self.commit_batch || self.pending() == 0 {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SyncError> {
        if self.membatch.is_empty() {
            return Ok(());
        }
        let nodes = std::mem::take(&mut self.membatch);
        debug!(nodes = nodes.len(), "Flushing state nodes");
        self.store.commit_nodes(nodes)?;
        self.membatch_hashes.clear();
        Ok(())
    }

    fn requeue(&mut self, hash: H256, failed: Option<PeerId>) {
        if let Some(scheduled) = self.scheduled.get_mut(&hash) {
            if let Some(peer) = failed {
                scheduled.failed_by.insert(peer);
            }
            self.queue.push_back(hash);
        }
    }

    fn report(&self) {
        let committed = self.committed;
        let pending = self.pending() as u64;
        self.progress.update(|progress| {
            progress.state_nodes = committed;
            progress.pending_state_nodes = pending;
        });
    }
}

impl FetchTask for StateSync {
    type Request = Vec<H256>;
    type Response = Vec<Bytes>;

    fn category(&self) -> DataCategory {
        DataCategory::StateNodes
    }

    fn is_done(&self) -> bool {
        self.pending() == 0 && self.membatch.is_empty()
    }

    fn reserve(
        &mut self,
        peer: PeerId,
        capacity: u64,
        live_peers: &HashSet<PeerId>,
    ) -> Option<Assignment<Vec<H256>>> {
        let mut hashes = Vec::new();
        let mut skipped = VecDeque::new();
        while (hashes.len() as u64) < capacity.max(1) {
            let Some(hash) = self.queue.pop_front() else {
                break;
            };
            let Some(scheduled) = self.scheduled.get_mut(&hash) else {
                continue;
            };
            if scheduled.failed_by.contains(&peer) {
                if !live_peers.iter().all(|live| scheduled.failed_by.contains(live)) {
                    skipped.push_back(hash);
                    continue;
                }
                scheduled.failed_by.clear();
            }
            hashes.push(hash);
        }
        while let Some(hash) = skipped.pop_back() {
            self.queue.push_front(hash);
        }
        if hashes.is_empty() {
            return None;
        }
        let id = RequestId {
            session: self.session,
            attempt: self.next_attempt,
        };
        self.next_attempt += 1;
        self.in_flight.insert(id, (peer, hashes.clone()));
        Some(Assignment {
            id,
            range: FetchRange::new(self.committed, hashes.len() as u64),
            request: hashes,
        })
    }

    fn send(
        connection: Arc<dyn PeerConnection>,
        hashes: Vec<H256>,
    ) -> BoxFuture<'static, Result<Vec<Bytes>, PeerConnectionError>> {
        async move { connection.get_node_data(hashes).await }.boxed()
    }

    fn deliver(
        &mut self,
        id: RequestId,
        peer: PeerId,
        nodes: Vec<Bytes>,
    ) -> Result<Delivery, SyncError> {
        let Some((_, requested)) = self.in_flight.remove(&id) else {
            return Ok(Delivery::Stale { items: nodes.len() });
        };
        let mut outstanding: HashSet<H256> = requested.iter().copied().collect();
        let mut accepted = 0;
        let mut unrequested = 0;
        for data in nodes {
            let hash = keccak(&data);
            if !outstanding.remove(&hash) {
                unrequested += 1;
                continue;
            }
            self.scheduled.remove(&hash);
            self.process(hash, data)?;
            accepted += 1;
        }
        let failed = unrequested > 0 || accepted == 0;
        for hash in requested.into_iter().filter(|hash| outstanding.contains(hash)) {
            self.requeue(hash, failed.then_some(peer));
        }
        self.report();
        if unrequested > 0 {
            return Ok(Delivery::Rejected {
                accepted,
                dropped: unrequested,
                reason: format!("{unrequested} nodes do not match any requested hash"),
            });
        }
        Ok(Delivery::Accepted { items: accepted })
    }

    fn fail(&mut self, id: RequestId) -> bool {
        let Some((peer, hashes)) = self.in_flight.remove(&id) else {
            return false;
        };
        for hash in hashes {
            self.requeue(hash, Some(peer));
        }
        true
    }

    fn fail_peer(&mut self, peer: PeerId) -> usize {
        let ids: Vec<RequestId> = self
            .in_flight
            .iter()
            .filter(|(_, (owner, _))| *owner == peer)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.fail(*id);
        }
        ids.len()
    }
}
