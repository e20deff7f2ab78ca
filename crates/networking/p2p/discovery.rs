//! Glue between the sync core and node discovery.
//!
//! The local node advertises its fork id in the "eth" entry of its node
//! record, refreshed on every new chain head. Candidates coming out of a
//! discovery source can be filtered by the fork id they advertise before a
//! connection is ever attempted.

use std::{
    collections::{BTreeMap, VecDeque},
    net::SocketAddr,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use bytes::{BufMut, Bytes};
use ethsync_common::{
    H256,
    rlp::{Encoder, RLPEncode},
    types::{ChainConfig, ForkFilter, ForkId},
};
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{events::Subscription, peer::PeerId, sync::ChainHeadEvent};

/// An entry of a node record, stored under `key` as its RLP encoding.
pub trait RecordEntry: RLPEncode {
    fn key(&self) -> &'static str;
}

/// The "eth" entry, advertising the fork the node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthEntry {
    pub fork_id: ForkId,
}

impl RecordEntry for EthEntry {
    fn key(&self) -> &'static str {
        "eth"
    }
}

impl RLPEncode for EthEntry {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf).encode_field(&self.fork_id).finish();
    }
}

#[derive(Debug, Default)]
struct Record {
    seq: u64,
    entries: BTreeMap<&'static str, Bytes>,
}

/// Entries the local node publishes through discovery. Cloning shares the
/// record.
#[derive(Debug, Clone, Default)]
pub struct LocalNodeRecord {
    inner: Arc<RwLock<Record>>,
}

impl LocalNodeRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an entry, bumping the sequence number if its value changed.
    pub fn set(&self, entry: &impl RecordEntry) {
        let value = Bytes::from(entry.encode_to_vec());
        let mut record = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if record.entries.get(entry.key()) != Some(&value) {
            record.entries.insert(entry.key(), value);
            record.seq += 1;
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entries
            .get(key)
            .cloned()
    }

    pub fn seq(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .seq
    }
}

/// Keeps the "eth" entry of `record` in line with the chain head.
///
/// The entry is set right away for `head`, then recomputed on every chain
/// head event. The task ends when `cancel` fires or the event bus is dropped.
pub fn spawn_entry_updater(
    mut heads: Subscription<ChainHeadEvent>,
    chain_config: ChainConfig,
    genesis_hash: H256,
    head: u64,
    record: LocalNodeRecord,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let forks = chain_config.gather_forks();
    let entry_at = move |head: u64| EthEntry {
        fork_id: ForkId::new(genesis_hash, &forks, head),
    };
    record.set(&entry_at(head));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = heads.recv() => match event {
                    Some(event) => {
                        let entry = entry_at(event.number);
                        trace!(head = event.number, fork_id = %entry.fork_id, "Updating eth entry");
                        record.set(&entry);
                    }
                    None => break,
                },
            }
        }
        debug!("Eth entry updater stopped");
    })
}

/// A node found by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCandidate {
    pub id: PeerId,
    pub addr: SocketAddr,
    /// Fork id from the node's "eth" entry, if it has one
    pub fork_id: Option<ForkId>,
}

#[async_trait]
pub trait DiscoverySource: Send {
    /// Next node to try. `None` once the source is exhausted.
    async fn next_candidate(&mut self) -> Option<NodeCandidate>;
}

/// A fixed list of nodes, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticNodes {
    nodes: VecDeque<NodeCandidate>,
}

impl StaticNodes {
    pub fn new(nodes: Vec<NodeCandidate>) -> Self {
        Self {
            nodes: nodes.into(),
        }
    }

    /// Same nodes in random order, so restarts do not always dial the same
    /// node first.
    pub fn shuffled(mut nodes: Vec<NodeCandidate>) -> Self {
        nodes.shuffle(&mut rand::thread_rng());
        Self::new(nodes)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[async_trait]
impl DiscoverySource for StaticNodes {
    async fn next_candidate(&mut self) -> Option<NodeCandidate> {
        self.nodes.pop_front()
    }
}

/// Skips candidates that do not advertise a fork id compatible with ours.
#[derive(Debug)]
pub struct ForkFilteredSource<S> {
    source: S,
    filter: ForkFilter,
}

impl<S: DiscoverySource> ForkFilteredSource<S> {
    pub fn new(source: S, filter: ForkFilter) -> Self {
        Self { source, filter }
    }

    /// Moves the local head the filter checks against.
    pub fn set_head(&mut self, head: u64) {
        self.filter.set_head(head);
    }

    pub fn into_inner(self) -> S {
        self.source
    }
}

#[async_trait]
impl<S: DiscoverySource> DiscoverySource for ForkFilteredSource<S> {
    async fn next_candidate(&mut self) -> Option<NodeCandidate> {
        while let Some(candidate) = self.source.next_candidate().await {
            let Some(fork_id) = candidate.fork_id else {
                trace!(node = %candidate.id, "Skipping node without eth entry");
                continue;
            };
            match self.filter.validate(fork_id) {
                Ok(()) => return Some(candidate),
                Err(err) => debug!(node = %candidate.id, %err, "Skipping node on another fork"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn candidate(n: u64, fork_id: Option<ForkId>) -> NodeCandidate {
        NodeCandidate {
            id: H256::from_low_u64_be(n),
            addr: SocketAddr::from(([127, 0, 0, 1], 30303 + n as u16)),
            fork_id,
        }
    }

    fn chain_config() -> ChainConfig {
        ChainConfig {
            chain_id: 1,
            fork_activation_blocks: vec![0, 100, 200],
        }
    }

    #[test]
    fn test_record_seq_only_moves_on_change() {
        let record = LocalNodeRecord::new();
        let genesis = H256::from_low_u64_be(7);
        let entry = EthEntry {
            fork_id: chain_config().fork_id(genesis, 0),
        };
        record.set(&entry);
        record.set(&entry);
        assert_eq!(record.seq(), 1);
        assert_eq!(record.get("eth"), Some(Bytes::from(entry.encode_to_vec())));
    }

    #[tokio::test]
    async fn test_entry_follows_chain_head() {
        let bus = EventBus::new();
        let record = LocalNodeRecord::new();
        let genesis = H256::from_low_u64_be(7);
        let cancel = CancellationToken::new();
        let updater = spawn_entry_updater(
            bus.subscribe(),
            chain_config(),
            genesis,
            0,
            record.clone(),
            cancel.clone(),
        );
        let expected = |head| {
            Bytes::from(
                EthEntry {
                    fork_id: chain_config().fork_id(genesis, head),
                }
                .encode_to_vec(),
            )
        };
        assert_eq!(record.get("eth"), Some(expected(0)));

        bus.publish(ChainHeadEvent {
            number: 150,
            hash: H256::zero(),
        });
        // Dropping the bus ends the updater once the backlog is processed.
        drop(bus);
        updater.await.unwrap();
        assert_eq!(record.get("eth"), Some(expected(150)));
        assert_eq!(record.seq(), 2);
    }

    #[tokio::test]
    async fn test_updater_stops_on_cancel() {
        let bus: EventBus<ChainHeadEvent> = EventBus::new();
        let cancel = CancellationToken::new();
        let updater = spawn_entry_updater(
            bus.subscribe(),
            chain_config(),
            H256::zero(),
            0,
            LocalNodeRecord::new(),
            cancel.clone(),
        );
        cancel.cancel();
        updater.await.unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_fork_filtered_source() {
        let genesis = H256::from_low_u64_be(7);
        let config = chain_config();
        let filter = ForkFilter::new(genesis, config.gather_forks(), 150);
        let ours = config.fork_id(genesis, 150);
        let other_chain = chain_config().fork_id(H256::from_low_u64_be(8), 150);
        let nodes = StaticNodes::new(vec![
            candidate(1, None),
            candidate(2, Some(other_chain)),
            candidate(3, Some(ours)),
        ]);
        let mut source = ForkFilteredSource::new(nodes, filter);
        assert_eq!(source.next_candidate().await, Some(candidate(3, Some(ours))));
        assert_eq!(source.next_candidate().await, None);
    }

    #[tokio::test]
    async fn test_shuffled_static_nodes_keep_every_node() {
        let nodes: Vec<NodeCandidate> = (0..16).map(|n| candidate(n, None)).collect();
        let mut source = StaticNodes::shuffled(nodes.clone());
        assert_eq!(source.len(), 16);
        let mut seen = Vec::new();
        while let Some(node) = source.next_candidate().await {
            seen.push(node.id);
        }
        seen.sort();
        let mut expected: Vec<PeerId> = nodes.iter().map(|node| node.id).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }
}
