//! In-memory chain, peers and state store shared by the sync scenarios.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    time::Duration,
};

use async_trait::async_trait;
use ethsync_common::{
    Bytes, H256, U256,
    constants::{EMPTY_TRIE_HASH, MINIMUM_DIFFICULTY},
    types::{
        Block, BlockBody, BlockHeader, Receipt, compute_receipts_root, compute_transactions_root,
    },
    utils::keccak,
};
use ethsync_p2p::{
    ConsensusEngine, Downloader, PeerInfo, PeerSet, SyncConfig,
    chain::{ChainError, ChainSink, InsertError, StateStore, StateStoreError},
    metrics::SyncMetrics,
    peer::{HashOrNumber, HeadersRequest, PeerConnection, PeerConnectionError},
};

/// Routes sync logs to the test output. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn id(n: u64) -> H256 {
    H256::from_low_u64_be(n)
}

/// A config small enough to exercise batching with short chains.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        header_batch_size: 16,
        skeleton_size: 4,
        max_block_bodies: 8,
        max_receipts: 8,
        max_state_nodes: 4,
        min_request_timeout: Duration::from_millis(200),
        max_request_timeout: Duration::from_millis(500),
        peer_wait_timeout: Some(Duration::from_secs(5)),
        pivot_distance: 64,
        state_commit_batch: 4,
        ..Default::default()
    }
}

/// Headers, bodies and receipts of a generated chain.
#[derive(Debug, Clone)]
pub struct TestChain {
    pub headers: Vec<BlockHeader>,
    pub bodies: HashMap<H256, BlockBody>,
    pub receipts: HashMap<H256, Vec<Receipt>>,
}

impl TestChain {
    /// Blocks `0..=head`. Every fifth block is empty.
    pub fn new(head: u64) -> Self {
        Self::with_state_root(head, EMPTY_TRIE_HASH)
    }

    pub fn with_state_root(head: u64, state_root: H256) -> Self {
        let genesis = BlockHeader {
            difficulty: U256::from(MINIMUM_DIFFICULTY),
            gas_limit: 8_000_000,
            state_root,
            ..Default::default()
        };
        let mut chain = Self {
            headers: vec![genesis],
            bodies: HashMap::new(),
            receipts: HashMap::new(),
        };
        chain.extend(head, 0);
        chain
    }

    /// A chain sharing blocks `0..=at` with this one and then diverging up
    /// to `head`.
    pub fn fork(&self, at: u64, head: u64, variant: u8) -> Self {
        let mut fork = self.clone();
        fork.headers.truncate(at as usize + 1);
        fork.extend(head, variant);
        fork
    }

    fn extend(&mut self, head: u64, variant: u8) {
        while self.head().number < head {
            let parent = self.head().clone();
            let number = parent.number + 1;
            let (body, receipts) = if number % 5 == 0 {
                (BlockBody::empty(), Vec::new())
            } else {
                let tx = Bytes::from(format!("tx-{variant}-{number}").into_bytes());
                (
                    BlockBody {
                        transactions: vec![tx],
                        ommers: Vec::new(),
                    },
                    vec![Receipt::new(true, 21_000, Vec::new())],
                )
            };
            let header = BlockHeader {
                parent_hash: parent.hash(),
                number,
                timestamp: parent.timestamp + 10,
                difficulty: parent.difficulty,
                gas_limit: parent.gas_limit,
                gas_used: 21_000 * receipts.len() as u64,
                state_root: parent.state_root,
                transactions_root: compute_transactions_root(&body.transactions),
                receipts_root: compute_receipts_root(&receipts),
                extra_data: Bytes::from(vec![variant]),
                ..Default::default()
            };
            let hash = header.hash();
            self.bodies.insert(hash, body);
            self.receipts.insert(hash, receipts);
            self.headers.push(header);
        }
    }

    pub fn head(&self) -> &BlockHeader {
        self.headers.last().expect("chain has a genesis")
    }

    pub fn header(&self, number: u64) -> &BlockHeader {
        &self.headers[number as usize]
    }

    pub fn total_difficulty(&self) -> U256 {
        self.headers
            .iter()
            .fold(U256::zero(), |td, header| td + header.difficulty)
    }

    pub fn by_hash(&self, hash: H256) -> Option<&BlockHeader> {
        self.headers.iter().find(|header| header.hash() == hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    Headers,
    Blocks,
    Receipts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    pub kind: CommitKind,
    pub first: u64,
    pub last: u64,
}

#[derive(Debug, Default)]
struct ChainInner {
    canonical: Vec<BlockHeader>,
    total_difficulty: HashMap<H256, U256>,
    bodies: HashMap<H256, BlockBody>,
    receipts: HashMap<H256, Vec<Receipt>>,
    commits: Vec<Commit>,
    reject: HashSet<u64>,
}

/// Blocks an insert until the test lets it through.
#[derive(Debug)]
struct InsertGate {
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

/// Chain sink keeping the canonical chain in memory.
#[derive(Debug, Default)]
pub struct MockChain {
    inner: Mutex<ChainInner>,
    /// Inserts that were started, successful or not
    inserts: AtomicUsize,
    gate: Mutex<Option<InsertGate>>,
}

impl MockChain {
    /// Starts out with blocks `0..=head` of `chain`.
    pub fn new(chain: &TestChain, head: u64) -> Self {
        let mut inner = ChainInner::default();
        let mut td = U256::zero();
        for header in &chain.headers[..=head as usize] {
            td += header.difficulty;
            inner.total_difficulty.insert(header.hash(), td);
            inner.canonical.push(header.clone());
        }
        Self {
            inner: Mutex::new(inner),
            ..Default::default()
        }
    }

    /// Holds the next insert once it has started. Returns a receiver that
    /// fires when it is entered and a sender that lets it proceed.
    pub fn hold_next_insert(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered, entered_rx) = mpsc::channel();
        let (release_tx, release) = mpsc::channel();
        *self.gate.lock().unwrap() = Some(InsertGate { entered, release });
        (entered_rx, release_tx)
    }

    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    /// Makes the sink refuse block `number`.
    pub fn reject(&self, number: u64) {
        self.inner.lock().unwrap().reject.insert(number);
    }

    pub fn head(&self) -> BlockHeader {
        self.inner.lock().unwrap().canonical.last().cloned().unwrap()
    }

    pub fn commits(&self) -> Vec<Commit> {
        self.inner.lock().unwrap().commits.clone()
    }

    pub fn body(&self, hash: H256) -> Option<BlockBody> {
        self.inner.lock().unwrap().bodies.get(&hash).cloned()
    }

    pub fn receipts(&self, hash: H256) -> Option<Vec<Receipt>> {
        self.inner.lock().unwrap().receipts.get(&hash).cloned()
    }

    fn import(&self, headers: &[&BlockHeader], kind: CommitKind) -> Result<(), InsertError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.send(()).unwrap();
            gate.release.recv().unwrap();
        }
        let mut inner = self.inner.lock().unwrap();
        for (index, header) in headers.iter().enumerate() {
            if inner.reject.contains(&header.number) {
                return Err(InsertError::new(
                    index,
                    ChainError::InvalidBlock(format!("block {} rejected", header.number)),
                ));
            }
            inner.canonical.truncate(header.number as usize);
            let parent = inner.canonical.last().map(BlockHeader::hash);
            let parent_td = inner.total_difficulty.get(&header.parent_hash).copied();
            let (Some(parent), Some(parent_td)) = (parent, parent_td) else {
                return Err(InsertError::new(index, ChainError::ParentNotFound(header.parent_hash)));
            };
            if parent != header.parent_hash {
                return Err(InsertError::new(index, ChainError::ParentNotFound(header.parent_hash)));
            }
            inner
                .total_difficulty
                .insert(header.hash(), parent_td + header.difficulty);
            inner.canonical.push((*header).clone());
        }
        if let (Some(first), Some(last)) = (headers.first(), headers.last()) {
            inner.commits.push(Commit {
                kind,
                first: first.number,
                last: last.number,
            });
        }
        Ok(())
    }
}

impl ChainSink for MockChain {
    fn current_header(&self) -> Result<BlockHeader, ChainError> {
        self.inner
            .lock()
            .unwrap()
            .canonical
            .last()
            .cloned()
            .ok_or_else(|| ChainError::Store("empty chain".to_string()))
    }

    fn get_header_by_hash(&self, hash: H256) -> Result<Option<BlockHeader>, ChainError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .canonical
            .iter()
            .find(|header| header.hash() == hash)
            .cloned())
    }

    fn total_difficulty(&self, hash: H256) -> Result<Option<U256>, ChainError> {
        Ok(self.inner.lock().unwrap().total_difficulty.get(&hash).copied())
    }

    fn insert_header_chain(&self, headers: &[BlockHeader]) -> Result<(), InsertError> {
        let headers: Vec<&BlockHeader> = headers.iter().collect();
        self.import(&headers, CommitKind::Headers)
    }

    fn insert_chain(&self, blocks: &[Block]) -> Result<(), InsertError> {
        let headers: Vec<&BlockHeader> = blocks.iter().map(|block| &block.header).collect();
        self.import(&headers, CommitKind::Blocks)?;
        let mut inner = self.inner.lock().unwrap();
        for block in blocks {
            inner.bodies.insert(block.hash(), block.body.clone());
        }
        Ok(())
    }

    fn insert_receipt_chain(
        &self,
        blocks: &[Block],
        receipts: &[Vec<Receipt>],
    ) -> Result<(), InsertError> {
        assert_eq!(blocks.len(), receipts.len());
        let headers: Vec<&BlockHeader> = blocks.iter().map(|block| &block.header).collect();
        self.import(&headers, CommitKind::Receipts)?;
        let mut inner = self.inner.lock().unwrap();
        for (block, receipts) in blocks.iter().zip(receipts) {
            inner.bodies.insert(block.hash(), block.body.clone());
            inner.receipts.insert(block.hash(), receipts.clone());
        }
        Ok(())
    }
}

/// Trie nodes are a one byte child count, the child hashes and a payload.
pub fn trie_node(children: &[H256], payload: &[u8]) -> (H256, Bytes) {
    let mut data = vec![children.len() as u8];
    for child in children {
        data.extend_from_slice(child.as_bytes());
    }
    data.extend_from_slice(payload);
    let data = Bytes::from(data);
    (keccak(&data), data)
}

/// A complete trie of the given depth where every branch has `fanout`
/// children. Returns the root and every node.
pub fn build_trie(depth: u32, fanout: u8) -> (H256, HashMap<H256, Bytes>) {
    fn build(depth: u32, fanout: u8, path: &mut Vec<u8>, nodes: &mut HashMap<H256, Bytes>) -> H256 {
        let children: Vec<H256> = if depth == 0 {
            Vec::new()
        } else {
            (0..fanout)
                .map(|i| {
                    path.push(i);
                    let child = build(depth - 1, fanout, path, nodes);
                    path.pop();
                    child
                })
                .collect()
        };
        let (hash, data) = trie_node(&children, path);
        nodes.insert(hash, data);
        hash
    }
    let mut nodes = HashMap::new();
    let root = build(depth, fanout, &mut Vec::new(), &mut nodes);
    (root, nodes)
}

#[derive(Debug, Default)]
pub struct MockStateStore {
    nodes: Mutex<HashMap<H256, Bytes>>,
}

impl MockStateStore {
    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    pub fn contains(&self, hash: &H256) -> bool {
        self.nodes.lock().unwrap().contains_key(hash)
    }
}

impl StateStore for MockStateStore {
    fn has_node(&self, hash: H256) -> Result<bool, StateStoreError> {
        Ok(self.contains(&hash))
    }

    fn child_hashes(&self, hash: H256, node: &[u8]) -> Result<Vec<H256>, StateStoreError> {
        let count = *node.first().ok_or(StateStoreError::MalformedNode(hash))? as usize;
        if node.len() < 1 + count * 32 {
            return Err(StateStoreError::MalformedNode(hash));
        }
        Ok((0..count)
            .map(|i| H256::from_slice(&node[1 + i * 32..33 + i * 32]))
            .collect())
    }

    fn commit_nodes(&self, nodes: Vec<(H256, Bytes)>) -> Result<(), StateStoreError> {
        let mut stored = self.nodes.lock().unwrap();
        for (hash, data) in nodes {
            // Children always land before their parent.
            for child in self.child_hashes(hash, &data)? {
                assert!(stored.contains_key(&child), "node {hash:#x} committed before child");
            }
            stored.insert(hash, data);
        }
        Ok(())
    }
}

/// A peer serving a [`TestChain`] with configurable misbehaviour.
#[derive(Debug)]
pub struct MockPeer {
    chain: TestChain,
    nodes: HashMap<H256, Bytes>,
    latency: Duration,
    /// Body requests left to leave unanswered
    stall_bodies: AtomicUsize,
    stall_node_data: AtomicBool,
    tamper_bodies: AtomicBool,
    /// Requests served before the connection goes away
    disconnect_after: Option<usize>,
    served: AtomicUsize,
    /// Spaced header answers above this number carry a different extra data
    forge_skeleton_above: Option<u64>,
    pub header_requests: Mutex<Vec<HeadersRequest>>,
    pub body_requests: Mutex<Vec<Vec<H256>>>,
    /// Hashes of the bodies actually returned
    pub served_bodies: Mutex<Vec<H256>>,
}

impl MockPeer {
    pub fn new(chain: TestChain) -> Self {
        Self {
            chain,
            nodes: HashMap::new(),
            latency: Duration::from_millis(1),
            stall_bodies: AtomicUsize::new(0),
            stall_node_data: AtomicBool::new(false),
            tamper_bodies: AtomicBool::new(false),
            disconnect_after: None,
            served: AtomicUsize::new(0),
            forge_skeleton_above: None,
            header_requests: Mutex::new(Vec::new()),
            body_requests: Mutex::new(Vec::new()),
            served_bodies: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_state(mut self, nodes: HashMap<H256, Bytes>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn stalling_bodies(self, requests: usize) -> Self {
        self.stall_bodies.store(requests, Ordering::SeqCst);
        self
    }

    pub fn stalling_node_data(self) -> Self {
        self.stall_node_data.store(true, Ordering::SeqCst);
        self
    }

    pub fn tampering_bodies(self) -> Self {
        self.tamper_bodies.store(true, Ordering::SeqCst);
        self
    }

    /// Serves a skeleton that no other peer can fill above `number`.
    pub fn forging_skeleton_above(mut self, number: u64) -> Self {
        self.forge_skeleton_above = Some(number);
        self
    }

    pub fn disconnecting_after(mut self, requests: usize) -> Self {
        self.disconnect_after = Some(requests);
        self
    }

    pub fn info(self: &Arc<Self>, n: u64) -> PeerInfo {
        let head = self.chain.head();
        PeerInfo {
            id: id(n),
            version: 68,
            head_hash: head.hash(),
            head_number: head.number,
            total_difficulty: self.chain.total_difficulty(),
            fork_id: None,
            connection: self.clone(),
        }
    }

    async fn serve(&self) -> Result<(), PeerConnectionError> {
        let served = self.served.fetch_add(1, Ordering::SeqCst);
        if self.disconnect_after.is_some_and(|limit| served >= limit) {
            return Err(PeerConnectionError::Disconnected);
        }
        tokio::time::sleep(self.latency).await;
        Ok(())
    }

    fn take_stall(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn get_block_headers(
        &self,
        request: HeadersRequest,
    ) -> Result<Vec<BlockHeader>, PeerConnectionError> {
        self.header_requests.lock().unwrap().push(request);
        self.serve().await?;
        let numbers = match request.start {
            HashOrNumber::Number(_) => request.numbers(),
            HashOrNumber::Hash(hash) => self
                .chain
                .by_hash(hash)
                .map(|header| {
                    HeadersRequest {
                        start: HashOrNumber::Number(header.number),
                        ..request
                    }
                    .numbers()
                })
                .unwrap_or_default(),
        };
        let forge_above = self.forge_skeleton_above.filter(|_| request.skip > 0);
        Ok(numbers
            .into_iter()
            .map_while(|number| self.chain.headers.get(number as usize).cloned())
            .map(|mut header| {
                if forge_above.is_some_and(|above| header.number > above) {
                    header.extra_data = Bytes::from_static(b"forged");
                }
                header
            })
            .collect())
    }

    async fn get_block_bodies(
        &self,
        block_hashes: Vec<H256>,
    ) -> Result<Vec<BlockBody>, PeerConnectionError> {
        self.body_requests.lock().unwrap().push(block_hashes.clone());
        if Self::take_stall(&self.stall_bodies) {
            std::future::pending::<()>().await;
        }
        self.serve().await?;
        let tamper = self.tamper_bodies.load(Ordering::SeqCst);
        let bodies: Vec<BlockBody> = block_hashes
            .iter()
            .map_while(|hash| self.chain.bodies.get(hash).cloned())
            .map(|mut body| {
                if tamper {
                    body.transactions.push(Bytes::from_static(b"forged"));
                }
                body
            })
            .collect();
        self.served_bodies
            .lock()
            .unwrap()
            .extend_from_slice(&block_hashes[..bodies.len()]);
        Ok(bodies)
    }

    async fn get_receipts(
        &self,
        block_hashes: Vec<H256>,
    ) -> Result<Vec<Vec<Receipt>>, PeerConnectionError> {
        self.serve().await?;
        Ok(block_hashes
            .iter()
            .map_while(|hash| self.chain.receipts.get(hash).cloned())
            .collect())
    }

    async fn get_node_data(&self, hashes: Vec<H256>) -> Result<Vec<Bytes>, PeerConnectionError> {
        if self.stall_node_data.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.serve().await?;
        Ok(hashes
            .iter()
            .filter_map(|hash| self.nodes.get(hash).cloned())
            .collect())
    }
}

pub struct Harness {
    pub downloader: Downloader,
    pub chain: Arc<MockChain>,
    pub state: Arc<MockStateStore>,
    pub peers: PeerSet,
    pub metrics: Arc<SyncMetrics>,
}

impl Harness {
    /// A downloader whose local chain holds blocks `0..=head` of `local`.
    pub fn new(config: SyncConfig, local: &TestChain, head: u64) -> Self {
        init_tracing();
        let chain = Arc::new(MockChain::new(local, head));
        let state = Arc::new(MockStateStore::default());
        let peers = PeerSet::new(&config);
        let metrics = Arc::new(SyncMetrics::new().unwrap());
        let downloader = Downloader::new(
            config,
            chain.clone(),
            Some(state.clone()),
            peers.clone(),
            ConsensusEngine::default(),
            metrics.clone(),
        )
        .unwrap();
        Self {
            downloader,
            chain,
            state,
            peers,
            metrics,
        }
    }

    pub fn add_peer(&self, n: u64, peer: MockPeer) -> Arc<MockPeer> {
        let peer = Arc::new(peer);
        self.peers.register(peer.info(n)).unwrap();
        peer
    }
}

/// Asserts commits of `kind` cover `first..=last` in order, without gaps.
pub fn assert_contiguous(commits: &[Commit], first: u64, last: u64) {
    let mut next = first;
    for commit in commits {
        assert_eq!(commit.first, next, "gap or overlap before {commit:?}");
        assert!(commit.last >= commit.first);
        next = commit.last + 1;
    }
    assert_eq!(next, last + 1, "commits stop early: {commits:?}");
}
