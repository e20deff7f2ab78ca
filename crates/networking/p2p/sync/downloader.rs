use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicU64, Ordering},
};

use ethsync_common::{
    H256,
    types::{Block, BlockBody, BlockHeader, Receipt},
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    chain::{ChainError, ChainSink, InsertError, StateStore},
    config::{ConfigError, SyncConfig},
    consensus::ConsensusEngine,
    events::{EventBus, Subscription},
    metrics::SyncMetrics,
    peer::PeerId,
    peer_set::{PeerSet, SyncPeer},
    types::{DataCategory, FetchRange},
};

use super::{
    SharedProgress, SyncError, SyncMode, SyncPhase, SyncProgress,
    ancestor::find_common_ancestor,
    bodies::{BlockDataOutput, BodiesTask, ReceiptsTask},
    fetcher::{FetchContext, run_fetch},
    headers::{HeaderFill, fetch_skeleton},
    state::StateSync,
};

/// Published after every batch committed to the chain sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHeadEvent {
    pub number: u64,
    pub hash: H256,
}

/// Drives sync sessions against the peers of a [`PeerSet`].
///
/// Only one session runs at a time: starting a new one cancels the running
/// session and waits until it has wound down.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<Inner>,
}

struct Inner {
    config: SyncConfig,
    chain: Arc<dyn ChainSink>,
    state: Option<Arc<dyn StateStore>>,
    peers: PeerSet,
    engine: ConsensusEngine,
    metrics: Arc<SyncMetrics>,
    chain_head: EventBus<ChainHeadEvent>,
    progress: SharedProgress,
    /// Held for the whole duration of a session
    running: tokio::sync::Mutex<()>,
    cancel: Mutex<CancellationToken>,
    sessions: AtomicU64,
}

/// Per-session state.
struct Session {
    id: u64,
    mode: SyncMode,
    master: SyncPeer,
    target: u64,
    pivot: Option<u64>,
    ctx: FetchContext,
}

impl Downloader {
    pub fn new(
        config: SyncConfig,
        chain: Arc<dyn ChainSink>,
        state: Option<Arc<dyn StateStore>>,
        peers: PeerSet,
        engine: ConsensusEngine,
        metrics: Arc<SyncMetrics>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                chain,
                state,
                peers,
                engine,
                metrics,
                chain_head: EventBus::new(),
                progress: SharedProgress::default(),
                running: tokio::sync::Mutex::new(()),
                cancel: Mutex::new(CancellationToken::new()),
                sessions: AtomicU64::new(0),
            }),
        })
    }

    pub fn peers(&self) -> &PeerSet {
        &self.inner.peers
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.inner.metrics
    }

    pub fn progress(&self) -> SyncProgress {
        self.inner.progress.snapshot()
    }

    pub fn subscribe_chain_head(&self) -> Subscription<ChainHeadEvent> {
        self.inner.chain_head.subscribe()
    }

    /// Aborts the running session, if any. No commit starts after this
    /// returns.
    pub fn cancel(&self) {
        self.lock_cancel().cancel();
        self.inner.progress.update(|progress| {
            if progress.phase != SyncPhase::Idle {
                progress.phase = SyncPhase::Cancelled;
            }
        });
    }

    /// Syncs towards `target`, or towards the head of the best peer when
    /// `None`. Cancels the running session first.
    pub async fn start_sync(&self, mode: SyncMode, target: Option<u64>) -> Result<(), SyncError> {
        let cancel = CancellationToken::new();
        std::mem::replace(&mut *self.lock_cancel(), cancel.clone()).cancel();
        let _running = self.inner.running.lock().await;
        // Superseded while waiting for the previous session.
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let session = self.inner.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.progress.update(|progress| {
            *progress = SyncProgress {
                mode,
                phase: SyncPhase::SelectingPeer,
                ..Default::default()
            }
        });

        let start_time = Instant::now();
        info!(session, ?mode, ?target, "[SYNCING] Starting sync session");
        let result = self.run_session(session, mode, target, &cancel).await;
        let phase = match &result {
            Ok(()) => {
                let progress = self.progress();
                info!(
                    session,
                    time_elapsed_s = start_time.elapsed().as_secs(),
                    head = progress.current,
                    "[SYNCING] Sync session finished"
                );
                SyncPhase::Idle
            }
            Err(SyncError::Cancelled) => {
                info!(session, "[SYNCING] Sync session cancelled");
                SyncPhase::Cancelled
            }
            Err(err) => {
                error!(
                    session,
                    time_elapsed_s = start_time.elapsed().as_secs(),
                    recoverable = err.is_recoverable(),
                    %err,
                    "[SYNCING] Sync session failed"
                );
                SyncPhase::Idle
            }
        };
        self.inner.progress.update(|progress| progress.phase = phase);
        result
    }

    async fn run_session(
        &self,
        id: u64,
        mode: SyncMode,
        target: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let mut attempt = 1;
        loop {
            match self.sync_with_best_peer(id, mode, target, cancel).await {
                Err(err) if err.is_master_failure() => {
                    if let Some(peer) = err.peer() {
                        self.inner.peers.drop_peer(&peer, &err.to_string());
                    }
                    if attempt >= self.inner.config.max_master_attempts {
                        return Err(err);
                    }
                    warn!(attempt, %err, "[SYNCING] Master peer failed, switching to another one");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn select_master(&self) -> Result<SyncPeer, SyncError> {
        let peers = &self.inner.peers;
        loop {
            let best = peers.best_peer().ok_or(SyncError::NoUsablePeers)?;
            if peers.is_fork_compatible(&best) {
                return Ok(best);
            }
            peers.drop_peer(&best.id(), "incompatible fork");
        }
    }

    async fn sync_with_best_peer(
        &self,
        id: u64,
        mut mode: SyncMode,
        target: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let config = &self.inner.config;
        self.set_phase(SyncPhase::SelectingPeer);
        let master = self.select_master()?;
        let target = target.unwrap_or(master.info.head_number);
        if target > master.info.head_number {
            return Err(SyncError::InvalidTarget {
                target,
                head: master.info.head_number,
            });
        }
        if mode == SyncMode::Snap && self.inner.state.is_none() {
            warn!("[SYNCING] No state store available, snap sync falls back to full sync");
            mode = SyncMode::Full;
        }
        let ctx = FetchContext {
            peers: self.inner.peers.clone(),
            metrics: self.inner.metrics.clone(),
            cancel: cancel.clone(),
            peer_wait_timeout: config.peer_wait_timeout,
        };

        self.set_phase(SyncPhase::NegotiatingAncestor);
        let local_head = self.inner.chain.current_header()?;
        let ancestor = find_common_ancestor(
            &ctx,
            &self.inner.chain,
            &master,
            &local_head,
            config.max_fork_ancestry,
        )
        .await?;
        let origin = ancestor.header;
        info!(
            peer = %master.id(),
            ancestor = origin.number,
            probes = ancestor.probes,
            target,
            "[SYNCING] Negotiated common ancestor"
        );

        let pivot = match mode {
            SyncMode::Snap => {
                let pivot = target.saturating_sub(config.pivot_distance);
                if pivot > origin.number {
                    Some(pivot)
                } else {
                    debug!(pivot, "Pivot already below the ancestor, syncing in full mode");
                    mode = SyncMode::Full;
                    None
                }
            }
            _ => None,
        };
        // Counters restart with every master.
        self.inner.progress.update(|progress| {
            *progress = SyncProgress {
                mode,
                phase: progress.phase,
                origin: origin.number,
                current: origin.number,
                target,
                pivot,
                ..Default::default()
            }
        });

        let mut session = Session {
            id,
            mode,
            master,
            target,
            pivot,
            ctx,
        };
        let mut from = origin;
        while from.number < target {
            let to = target.min(from.number + config.segment_len());
            let headers = self.fetch_headers(&session, from, to).await?;
            let Some(last) = headers.last().cloned() else {
                break;
            };
            self.import_segment(&mut session, headers).await?;
            from = last;
        }
        self.check_total_difficulty(&session)
    }

    async fn fetch_headers(
        &self,
        session: &Session,
        from: BlockHeader,
        to: u64,
    ) -> Result<Arc<[BlockHeader]>, SyncError> {
        let config = &self.inner.config;
        let master = &session.master;
        self.set_phase(SyncPhase::FetchingHeaders);
        let skeleton = fetch_skeleton(
            &session.ctx,
            master,
            from.number,
            to,
            config.header_batch_size,
        )
        .await?;
        if to == master.info.head_number
            && skeleton.last().map(BlockHeader::hash) != Some(master.info.head_hash)
        {
            return Err(SyncError::PeerFault {
                peer: master.id(),
                category: DataCategory::Headers,
                range: FetchRange::new(to, 1),
                reason: "target header does not match the advertised head".to_string(),
            });
        }
        let mut fill = HeaderFill::new(
            session.id,
            from,
            skeleton,
            master.id(),
            self.inner.engine.clone(),
            config.skeleton_mismatch_limit,
            self.inner.progress.clone(),
        );
        run_fetch(&mut fill, &session.ctx).await?;
        Ok(fill.into_headers().into())
    }

    async fn import_segment(
        &self,
        session: &mut Session,
        headers: Arc<[BlockHeader]>,
    ) -> Result<(), SyncError> {
        match session.mode {
            SyncMode::Light => {
                let batch = headers.clone();
                self.commit(session, DataCategory::Headers, &headers, &[], move |chain| {
                    chain.insert_header_chain(&batch)
                })
                .await
            }
            SyncMode::Full => self.import_full(session, headers).await,
            SyncMode::Snap => {
                let pivot = session.pivot.unwrap_or(session.target);
                let split = headers.partition_point(|header| header.number <= pivot);
                if split > 0 {
                    let below: Arc<[BlockHeader]> = headers[..split].into();
                    self.import_fast(session, below).await?;
                    if headers[split - 1].number == pivot {
                        self.fetch_state(session, &headers[split - 1]).await?;
                    }
                }
                if split < headers.len() {
                    self.import_full(session, headers[split..].into()).await?;
                }
                Ok(())
            }
        }
    }

    /// Fetches bodies and executes the blocks.
    async fn import_full(
        &self,
        session: &Session,
        headers: Arc<[BlockHeader]>,
    ) -> Result<(), SyncError> {
        self.set_phase(SyncPhase::FetchingBodiesAndReceipts);
        let mut bodies = BodiesTask::new(
            session.id,
            headers.clone(),
            self.inner.config.max_block_bodies,
            self.inner.progress.clone(),
        );
        run_fetch(&mut bodies, &session.ctx).await?;
        let BlockDataOutput {
            items,
            delivered_by,
        } = bodies.into_output();
        let blocks = assemble_blocks(&headers, items);
        self.commit(session, DataCategory::Bodies, &headers, &delivered_by, move |chain| {
            chain.insert_chain(&blocks)
        })
        .await
    }

    /// Fetches bodies and receipts concurrently and stores the blocks without
    /// executing them.
    async fn import_fast(
        &self,
        session: &Session,
        headers: Arc<[BlockHeader]>,
    ) -> Result<(), SyncError> {
        self.set_phase(SyncPhase::FetchingBodiesAndReceipts);
        let config = &self.inner.config;
        let progress = &self.inner.progress;
        let mut bodies = BodiesTask::new(
            session.id,
            headers.clone(),
            config.max_block_bodies,
            progress.clone(),
        );
        let mut receipts = ReceiptsTask::new(
            session.id,
            headers.clone(),
            config.max_receipts,
            progress.clone(),
        );
        tokio::try_join!(
            run_fetch(&mut bodies, &session.ctx),
            run_fetch(&mut receipts, &session.ctx)
        )?;
        let bodies = bodies.into_output();
        let receipts = receipts.into_output();
        // Either delivery may be the bad one, blame the body first.
        let delivered_by: Vec<Option<PeerId>> = bodies
            .delivered_by
            .iter()
            .zip(&receipts.delivered_by)
            .map(|(body, receipt)| body.or(*receipt))
            .collect();
        let blocks = assemble_blocks(&headers, bodies.items);
        let receipts: Vec<Vec<Receipt>> = receipts.items;
        self.commit(session, DataCategory::Receipts, &headers, &delivered_by, move |chain| {
            chain.insert_receipt_chain(&blocks, &receipts)
        })
        .await
    }

    /// Downloads the state trie at the pivot. Gives up after
    /// `max_state_fetch` and continues in full mode.
    async fn fetch_state(&self, session: &mut Session, pivot: &BlockHeader) -> Result<(), SyncError> {
        let Some(store) = self.inner.state.clone() else {
            session.mode = SyncMode::Full;
            return Ok(());
        };
        let config = &self.inner.config;
        if session.ctx.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.set_phase(SyncPhase::FetchingState);
        info!(pivot = pivot.number, root = %pivot.state_root, "[SYNCING] Fetching pivot state");
        let mut state = StateSync::new(
            session.id,
            pivot.state_root,
            store,
            config.state_commit_batch,
            self.inner.progress.clone(),
        )?;
        match tokio::time::timeout(config.max_state_fetch, run_fetch(&mut state, &session.ctx)).await
        {
            Ok(result) => {
                result?;
                info!(root = %state.root(), "[SYNCING] Pivot state downloaded");
            }
            Err(_) => {
                self.inner.metrics.state_fetch_fallbacks.inc();
                warn!(
                    pending = state.pending(),
                    "[SYNCING] State download took too long, continuing with full sync"
                );
                session.mode = SyncMode::Full;
                self.inner
                    .progress
                    .update(|progress| progress.mode = SyncMode::Full);
            }
        }
        Ok(())
    }

    /// Hands a validated batch to the chain sink from a blocking task.
    /// `delivered_by` maps positions of `headers` to the peer that served the
    /// data, so a rejected block can be blamed on it.
    async fn commit<F>(
        &self,
        session: &Session,
        category: DataCategory,
        headers: &[BlockHeader],
        delivered_by: &[Option<PeerId>],
        insert: F,
    ) -> Result<(), SyncError>
    where
        F: FnOnce(&dyn ChainSink) -> Result<(), InsertError> + Send + 'static,
    {
        let (Some(first), Some(last)) = (headers.first(), headers.last()) else {
            return Ok(());
        };
        let chain = self.inner.chain.clone();
        let insertion = {
            // Held by `cancel` too: a commit is handed off before it or not at all.
            let _cancel = self.lock_cancel();
            if session.ctx.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            self.set_phase(SyncPhase::Committing);
            tokio::task::spawn_blocking(move || insert(chain.as_ref()))
        };
        let result = insertion.await?;
        if let Err(InsertError { index, error }) = result {
            if let ChainError::Store(_) = error {
                return Err(SyncError::Chain(error));
            }
            let number = headers.get(index).map_or(first.number, |header| header.number);
            let peer = delivered_by.get(index).copied().flatten();
            if let Some(peer) = peer {
                self.inner.peers.blacklist(&peer, &error.to_string());
            }
            return Err(SyncError::ValidationFailure {
                category,
                range: FetchRange::new(number, 1),
                peer,
                reason: error.to_string(),
            });
        }

        let head = ChainHeadEvent {
            number: last.number,
            hash: last.hash(),
        };
        self.inner
            .progress
            .update(|progress| progress.current = head.number);
        self.inner.peers.set_fork_head(head.number);
        self.inner.chain_head.publish(head);
        info!(
            from = first.number,
            to = last.number,
            %category,
            "[SYNCING] Committed batch"
        );
        Ok(())
    }

    /// When syncing to the advertised head, our total difficulty must reach
    /// the advertised one, otherwise the peer lied about its chain.
    fn check_total_difficulty(&self, session: &Session) -> Result<(), SyncError> {
        let master = &session.master;
        if session.target != master.info.head_number {
            return Ok(());
        }
        let local = self
            .inner
            .chain
            .total_difficulty(master.info.head_hash)?
            .ok_or(SyncError::UnknownBlock(master.info.head_hash))?;
        if local < master.info.total_difficulty {
            return Err(SyncError::PeerFault {
                peer: master.id(),
                category: DataCategory::Headers,
                range: FetchRange::new(session.target, 1),
                reason: format!(
                    "advertised total difficulty {} but the chain only reaches {local}",
                    master.info.total_difficulty
                ),
            });
        }
        Ok(())
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.inner.progress.update(|progress| progress.phase = phase);
    }

    fn lock_cancel(&self) -> MutexGuard<'_, CancellationToken> {
        self.inner
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn assemble_blocks(headers: &[BlockHeader], bodies: Vec<BlockBody>) -> Vec<Block> {
    headers
        .iter()
        .cloned()
        .zip(bodies)
        .map(|(header, body)| Block::new(header, body))
        .collect()
}
