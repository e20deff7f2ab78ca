//! Registry of the peers that can serve sync requests.
//!
//! The set is the only owner of per-peer sync state: advertised head, in-flight
//! request counts, throughput and round trip estimates. Fetchers ask it for
//! idle peers, reserve request slots through [`PeerSet::begin_request`] and
//! report the outcome of every request back.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use ethsync_common::{
    H256, U256,
    types::{ForkFilter, ForkId, ForkIdError},
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::SyncConfig,
    events::{EventBus, Subscription},
    peer::{PeerConnection, PeerId},
    types::DataCategory,
};

/// Weight of a new measurement in the throughput and round trip averages.
pub const MEASUREMENT_IMPACT: f64 = 0.1;

const CATEGORIES: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerSetError {
    #[error("Peer {0:#x} is already registered")]
    DuplicateId(PeerId),
    #[error("Peer {0:#x} is not registered")]
    NotRegistered(PeerId),
    #[error("Peer {0:#x} is blacklisted")]
    Blacklisted(PeerId),
    #[error("Peer {peer:#x} is on an incompatible fork: {reason}")]
    IncompatibleFork { peer: PeerId, reason: ForkIdError },
    #[error("Peer {0:#x} was dropped")]
    PeerDropped(PeerId),
    #[error("Peer {peer:#x} has no free {category} request slot")]
    PeerBusy {
        peer: PeerId,
        category: DataCategory,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Busy,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Registered(PeerId),
    Unregistered(PeerId),
    Dropped(PeerId),
}

impl PeerEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            PeerEvent::Registered(id) | PeerEvent::Unregistered(id) | PeerEvent::Dropped(id) => {
                *id
            }
        }
    }
}

/// What a peer announced during the handshake.
#[derive(Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    pub version: u32,
    pub head_hash: H256,
    pub head_number: u64,
    pub total_difficulty: U256,
    pub fork_id: Option<ForkId>,
    pub connection: Arc<dyn PeerConnection>,
}

impl fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerInfo")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("head_number", &self.head_number)
            .field("total_difficulty", &self.total_difficulty)
            .finish()
    }
}

/// Snapshot of a registered peer.
#[derive(Debug, Clone)]
pub struct SyncPeer {
    pub info: PeerInfo,
    pub state: PeerState,
    pub in_flight: [usize; CATEGORIES],
    /// Items per second, per category
    pub throughput: [f64; CATEGORIES],
    pub rtt: Option<Duration>,
    pub consecutive_timeouts: u32,
}

impl SyncPeer {
    pub fn id(&self) -> PeerId {
        self.info.id
    }

    pub fn connection(&self) -> Arc<dyn PeerConnection> {
        self.info.connection.clone()
    }

    pub fn throughput(&self, category: DataCategory) -> f64 {
        self.throughput[category.index()]
    }

    pub fn in_flight(&self, category: DataCategory) -> usize {
        self.in_flight[category.index()]
    }
}

#[derive(Debug)]
struct Limits {
    max_items: [u64; CATEGORIES],
    max_in_flight: usize,
    target_rtt: Duration,
    min_timeout: Duration,
    max_timeout: Duration,
    max_timeouts: u32,
}

impl Limits {
    fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_items: [
                config.header_batch_size,
                config.max_block_bodies,
                config.max_receipts,
                config.max_state_nodes,
            ],
            max_in_flight: config.max_in_flight_per_peer,
            target_rtt: config.target_rtt,
            min_timeout: config.min_request_timeout,
            max_timeout: config.max_request_timeout,
            max_timeouts: config.max_peer_timeouts,
        }
    }

    /// Throughput at which a peer serves a full request within the target round trip.
    fn initial_throughput(&self, category: DataCategory) -> f64 {
        self.max_items[category.index()] as f64 / self.target_rtt.as_secs_f64()
    }
}

#[derive(Debug)]
struct Inner {
    peers: HashMap<PeerId, SyncPeer>,
    blacklist: HashSet<PeerId>,
    fork_filter: Option<ForkFilter>,
    limits: Limits,
}

impl Inner {
    fn refresh_state(peer: &mut SyncPeer) {
        if peer.state == PeerState::Dropped {
            return;
        }
        peer.state = if peer.in_flight.iter().any(|n| *n > 0) {
            PeerState::Busy
        } else {
            PeerState::Idle
        };
    }

    fn is_idle(&self, peer: &SyncPeer, category: DataCategory) -> bool {
        peer.state != PeerState::Dropped && peer.in_flight(category) < self.limits.max_in_flight
    }

    fn mean_throughput(&self, category: DataCategory) -> Option<f64> {
        let live: Vec<f64> = self
            .peers
            .values()
            .filter(|peer| peer.state != PeerState::Dropped)
            .map(|peer| peer.throughput(category))
            .collect();
        if live.is_empty() {
            return None;
        }
        Some(live.iter().sum::<f64>() / live.len() as f64)
    }

    /// Marks the peer as dropped, returns whether its state changed.
    fn mark_dropped(&mut self, id: &PeerId) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) if peer.state != PeerState::Dropped => {
                peer.state = PeerState::Dropped;
                true
            }
            _ => false,
        }
    }
}

/// Cheaply cloneable handle to the shared peer registry.
#[derive(Debug, Clone)]
pub struct PeerSet {
    inner: Arc<Mutex<Inner>>,
    events: Arc<EventBus<PeerEvent>>,
}

impl PeerSet {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                peers: HashMap::new(),
                blacklist: HashSet::new(),
                fork_filter: None,
                limits: Limits::from_config(config),
            })),
            events: Arc::new(EventBus::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    pub fn register(&self, info: PeerInfo) -> Result<(), PeerSetError> {
        let id = info.id;
        {
            let mut inner = self.lock();
            if inner.blacklist.contains(&id) {
                return Err(PeerSetError::Blacklisted(id));
            }
            if inner.peers.contains_key(&id) {
                return Err(PeerSetError::DuplicateId(id));
            }
            if let (Some(filter), Some(fork_id)) = (&inner.fork_filter, info.fork_id) {
                filter
                    .validate(fork_id)
                    .map_err(|reason| PeerSetError::IncompatibleFork { peer: id, reason })?;
            }
            let mut throughput = [0.0; CATEGORIES];
            for category in DataCategory::all() {
                throughput[category.index()] = inner
                    .mean_throughput(*category)
                    .unwrap_or_else(|| inner.limits.initial_throughput(*category));
            }
            info!(peer = %id, head = info.head_number, td = %info.total_difficulty, "Registered sync peer");
            inner.peers.insert(
                id,
                SyncPeer {
                    info,
                    state: PeerState::Idle,
                    in_flight: [0; CATEGORIES],
                    throughput,
                    rtt: None,
                    consecutive_timeouts: 0,
                },
            );
        }
        self.events.publish(PeerEvent::Registered(id));
        Ok(())
    }

    /// Removes a peer. Unknown ids are ignored.
    pub fn unregister(&self, id: &PeerId) {
        let removed = self.lock().peers.remove(id).is_some();
        if removed {
            debug!(peer = %id, "Unregistered sync peer");
            self.events.publish(PeerEvent::Unregistered(*id));
        }
    }

    /// Marks the peer as unusable without removing it. Its in-flight requests
    /// are treated as failed by every fetcher.
    pub fn drop_peer(&self, id: &PeerId, reason: &str) {
        let dropped = self.lock().mark_dropped(id);
        if dropped {
            warn!(peer = %id, reason, "Dropping sync peer");
            self.events.publish(PeerEvent::Dropped(*id));
        }
    }

    /// Drops the peer and refuses to register it again.
    pub fn blacklist(&self, id: &PeerId, reason: &str) {
        let dropped = {
            let mut inner = self.lock();
            inner.blacklist.insert(*id);
            inner.mark_dropped(id)
        };
        warn!(peer = %id, reason, "Blacklisted peer");
        if dropped {
            self.events.publish(PeerEvent::Dropped(*id));
        }
    }

    pub fn is_blacklisted(&self, id: &PeerId) -> bool {
        self.lock().blacklist.contains(id)
    }

    pub fn update_head(
        &self,
        id: &PeerId,
        head_hash: H256,
        head_number: u64,
        total_difficulty: U256,
    ) -> Result<(), PeerSetError> {
        let mut inner = self.lock();
        let peer = inner
            .peers
            .get_mut(id)
            .ok_or(PeerSetError::NotRegistered(*id))?;
        peer.info.head_hash = head_hash;
        peer.info.head_number = head_number;
        peer.info.total_difficulty = total_difficulty;
        Ok(())
    }

    /// Peer with the highest total difficulty. Ties go to the lowest round
    /// trip, peers without a measured round trip come last.
    pub fn best_peer(&self) -> Option<SyncPeer> {
        let inner = self.lock();
        inner
            .peers
            .values()
            .filter(|peer| peer.state != PeerState::Dropped)
            .max_by(|a, b| {
                a.info
                    .total_difficulty
                    .cmp(&b.info.total_difficulty)
                    .then_with(|| match (a.rtt, b.rtt) {
                        (Some(a), Some(b)) => b.cmp(&a),
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (None, None) => std::cmp::Ordering::Equal,
                    })
                    .then_with(|| b.info.id.cmp(&a.info.id))
            })
            .cloned()
    }

    /// Up to `count` peers able to take a `category` request, fastest first.
    pub fn peers_for_category(&self, category: DataCategory, count: usize) -> Vec<SyncPeer> {
        let inner = self.lock();
        let mut idle: Vec<SyncPeer> = inner
            .peers
            .values()
            .filter(|peer| inner.is_idle(peer, category))
            .cloned()
            .collect();
        idle.sort_by(|a, b| {
            b.throughput(category)
                .total_cmp(&a.throughput(category))
                .then_with(|| a.info.id.cmp(&b.info.id))
        });
        idle.truncate(count);
        idle
    }

    /// Reserves one in-flight slot. The slot is released when the returned
    /// guard is dropped.
    pub fn begin_request(
        &self,
        id: &PeerId,
        category: DataCategory,
    ) -> Result<RequestSlot, PeerSetError> {
        let mut inner = self.lock();
        let max_in_flight = inner.limits.max_in_flight;
        let peer = inner
            .peers
            .get_mut(id)
            .ok_or(PeerSetError::NotRegistered(*id))?;
        if peer.state == PeerState::Dropped {
            return Err(PeerSetError::PeerDropped(*id));
        }
        if peer.in_flight(category) >= max_in_flight {
            return Err(PeerSetError::PeerBusy {
                peer: *id,
                category,
            });
        }
        peer.in_flight[category.index()] += 1;
        Inner::refresh_state(peer);
        Ok(RequestSlot {
            set: Arc::downgrade(&self.inner),
            peer: *id,
            category,
        })
    }

    /// Folds a completed request into the peer's estimates.
    pub fn record_delivery(
        &self,
        id: &PeerId,
        category: DataCategory,
        items: usize,
        elapsed: Duration,
    ) {
        let mut inner = self.lock();
        let Some(peer) = inner.peers.get_mut(id) else {
            return;
        };
        let elapsed = elapsed.max(Duration::from_millis(1));
        let measured = items as f64 / elapsed.as_secs_f64();
        let estimate = &mut peer.throughput[category.index()];
        *estimate = (1.0 - MEASUREMENT_IMPACT) * *estimate + MEASUREMENT_IMPACT * measured;
        peer.rtt = Some(match peer.rtt {
            Some(rtt) => rtt.mul_f64(1.0 - MEASUREMENT_IMPACT) + elapsed.mul_f64(MEASUREMENT_IMPACT),
            None => elapsed,
        });
        peer.consecutive_timeouts = 0;
    }

    /// Penalises a timed out request. Returns true if the peer got dropped
    /// for timing out too many times in a row.
    pub fn record_timeout(&self, id: &PeerId, category: DataCategory) -> bool {
        let dropped = {
            let mut inner = self.lock();
            let max_timeouts = inner.limits.max_timeouts;
            let Some(peer) = inner.peers.get_mut(id) else {
                return false;
            };
            peer.throughput[category.index()] /= 2.0;
            peer.consecutive_timeouts += 1;
            peer.consecutive_timeouts >= max_timeouts && inner.mark_dropped(id)
        };
        if dropped {
            warn!(peer = %id, %category, "Dropping sync peer after repeated timeouts");
            self.events.publish(PeerEvent::Dropped(*id));
        }
        dropped
    }

    /// Number of items to ask the peer for so the request completes within
    /// the target round trip.
    pub fn capacity(&self, id: &PeerId, category: DataCategory) -> u64 {
        let inner = self.lock();
        let max = inner.limits.max_items[category.index()];
        let Some(peer) = inner.peers.get(id) else {
            return 1;
        };
        let items = peer.throughput(category) * inner.limits.target_rtt.as_secs_f64();
        (items as u64).clamp(1, max)
    }

    pub fn request_timeout(&self, id: &PeerId) -> Duration {
        let inner = self.lock();
        let limits = &inner.limits;
        inner
            .peers
            .get(id)
            .and_then(|peer| peer.rtt)
            .map(|rtt| rtt * 3)
            .unwrap_or(limits.max_timeout)
            .clamp(limits.min_timeout, limits.max_timeout)
    }

    pub fn subscribe(&self) -> Subscription<PeerEvent> {
        self.events.subscribe()
    }

    /// Installs the filter checked against the fork id of registering peers.
    pub fn set_fork_filter(&self, filter: Option<ForkFilter>) {
        self.lock().fork_filter = filter;
    }

    /// Advances the head of the installed fork filter.
    pub fn set_fork_head(&self, head: u64) {
        if let Some(filter) = self.lock().fork_filter.as_mut() {
            filter.set_head(head);
        }
    }

    pub fn is_fork_compatible(&self, peer: &SyncPeer) -> bool {
        let inner = self.lock();
        match (&inner.fork_filter, peer.info.fork_id) {
            (Some(filter), Some(fork_id)) => filter.validate(fork_id).is_ok(),
            _ => true,
        }
    }

    /// Registered peers that were not dropped.
    pub fn len(&self) -> usize {
        self.lock()
            .peers
            .values()
            .filter(|peer| peer.state != PeerState::Dropped)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.lock().peers.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Ids of the peers that were not dropped.
    pub fn active_peer_ids(&self) -> HashSet<PeerId> {
        self.lock()
            .peers
            .values()
            .filter(|peer| peer.state != PeerState::Dropped)
            .map(SyncPeer::id)
            .collect()
    }

    pub fn get(&self, id: &PeerId) -> Option<SyncPeer> {
        self.lock().peers.get(id).cloned()
    }
}

/// A reserved in-flight request slot.
#[derive(Debug)]
pub struct RequestSlot {
    set: Weak<Mutex<Inner>>,
    peer: PeerId,
    category: DataCategory,
}

impl RequestSlot {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn category(&self) -> DataCategory {
        self.category
    }
}

impl Drop for RequestSlot {
    fn drop(&mut self) {
        let Some(set) = self.set.upgrade() else {
            return;
        };
        let mut inner = lock(&set);
        if let Some(peer) = inner.peers.get_mut(&self.peer) {
            let slot = &mut peer.in_flight[self.category.index()];
            *slot = slot.saturating_sub(1);
            Inner::refresh_state(peer);
        }
    }
}

// Peer state stays consistent even if a holder panicked mid-update.
fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
