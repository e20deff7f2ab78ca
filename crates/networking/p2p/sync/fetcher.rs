//! Concurrent fetch driver.
//!
//! One driver runs per data category. It hands work to idle peers, spawns one
//! task per request, and feeds responses, timeouts and peer departures back
//! into the [`FetchTask`] until the task reports completion. Every request
//! carries its own deadline, derived from the peer's round trip estimate.

use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use tokio::{sync::mpsc, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    metrics::SyncMetrics,
    peer::{PeerConnection, PeerConnectionError, PeerId},
    peer_set::{PeerEvent, PeerSet},
    types::{DataCategory, FetchRange, RequestId},
};

use super::SyncError;

/// Outcome of handing a response to a [`FetchTask`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// `items` were accepted. Fewer than requested means the rest was put back.
    Accepted { items: usize },
    /// Answer to a request that is no longer in flight.
    Stale { items: usize },
    /// The answer contradicts data from another peer and it is not yet known
    /// who is lying. The batch is put back for someone else, the peer stays.
    Disputed { items: usize, reason: String },
    /// The peer sent invalid data. Any valid prefix was kept.
    Rejected {
        accepted: usize,
        dropped: usize,
        reason: String,
    },
}

/// Work unit handed to a peer.
#[derive(Debug)]
pub(crate) struct Assignment<R> {
    pub id: RequestId,
    pub range: FetchRange,
    pub request: R,
}

pub(crate) trait FetchTask: Send {
    type Request: Send + 'static;
    type Response: Send + 'static;

    fn category(&self) -> DataCategory;

    fn is_done(&self) -> bool;

    /// Next piece of work for `peer`, at most `capacity` items.
    fn reserve(
        &mut self,
        peer: PeerId,
        capacity: u64,
        live_peers: &HashSet<PeerId>,
    ) -> Option<Assignment<Self::Request>>;

    fn send(
        connection: Arc<dyn PeerConnection>,
        request: Self::Request,
    ) -> BoxFuture<'static, Result<Self::Response, PeerConnectionError>>;

    /// Validates and stores a response. Errors abort the whole fetch.
    fn deliver(
        &mut self,
        id: RequestId,
        peer: PeerId,
        response: Self::Response,
    ) -> Result<Delivery, SyncError>;

    /// Puts a lost request back. Returns false if it was no longer in flight.
    fn fail(&mut self, id: RequestId) -> bool;

    /// Puts back every request in flight to `peer`.
    fn fail_peer(&mut self, peer: PeerId) -> usize;
}

/// Shared handles a fetch needs.
#[derive(Debug, Clone)]
pub(crate) struct FetchContext {
    pub peers: PeerSet,
    pub metrics: Arc<SyncMetrics>,
    pub cancel: CancellationToken,
    pub peer_wait_timeout: Option<Duration>,
}

struct Outcome<R> {
    id: RequestId,
    peer: PeerId,
    range: FetchRange,
    elapsed: Duration,
    result: Result<R, RequestFailure>,
}

enum RequestFailure {
    Timeout,
    Peer(PeerConnectionError),
}

/// Runs `task` to completion.
pub(crate) async fn run_fetch<T: FetchTask>(
    task: &mut T,
    ctx: &FetchContext,
) -> Result<(), SyncError> {
    let category = task.category();
    let mut events = ctx.peers.subscribe();
    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<Outcome<T::Response>>();
    // Dropping the set aborts whatever is still running, releasing the slots.
    let mut requests = JoinSet::new();
    let mut in_flight = 0usize;
    let mut waiting_since: Option<Instant> = None;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if task.is_done() {
            return Ok(());
        }
        while requests.try_join_next().is_some() {}

        let live_peers = ctx.peers.active_peer_ids();
        for peer in ctx.peers.peers_for_category(category, usize::MAX) {
            let id = peer.id();
            let Ok(slot) = ctx.peers.begin_request(&id, category) else {
                continue;
            };
            let capacity = ctx.peers.capacity(&id, category);
            let timeout = ctx.peers.request_timeout(&id);
            let Some(assignment) = task.reserve(id, capacity, &live_peers) else {
                continue;
            };
            debug!(peer = %id, %category, range = %assignment.range, request = %assignment.id, "Requesting");
            let connection = peer.connection();
            let results = results_tx.clone();
            requests.spawn(async move {
                let started = Instant::now();
                let response =
                    tokio::time::timeout(timeout, T::send(connection, assignment.request)).await;
                drop(slot);
                let result = match response {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(err)) => Err(RequestFailure::Peer(err)),
                    Err(_) => Err(RequestFailure::Timeout),
                };
                // The driver may be gone already.
                let _ = results.send(Outcome {
                    id: assignment.id,
                    peer: id,
                    range: assignment.range,
                    elapsed: started.elapsed(),
                    result,
                });
            });
            in_flight += 1;
        }

        let deadline = if in_flight == 0 {
            let since = *waiting_since.get_or_insert_with(|| {
                ctx.metrics.throttle.inc();
                debug!(%category, "No idle peer can take a request, waiting");
                Instant::now()
            });
            ctx.peer_wait_timeout.map(|wait| since + wait)
        } else {
            waiting_since = None;
            None
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(SyncError::Cancelled),
            Some(outcome) = results_rx.recv() => {
                in_flight -= 1;
                handle_outcome(task, ctx, category, outcome)?;
            }
            Some(event) = events.recv() => match event {
                PeerEvent::Unregistered(peer) | PeerEvent::Dropped(peer) => {
                    let requeued = task.fail_peer(peer);
                    if requeued > 0 {
                        debug!(%peer, %category, requeued, "Peer left, reassigning its requests");
                    }
                }
                PeerEvent::Registered(_) => waiting_since = None,
            },
            _ = sleep_until(deadline), if deadline.is_some() => {
                warn!(%category, "Gave up waiting for peers");
                return Err(SyncError::NoUsablePeers);
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

fn handle_outcome<T: FetchTask>(
    task: &mut T,
    ctx: &FetchContext,
    category: DataCategory,
    outcome: Outcome<T::Response>,
) -> Result<(), SyncError> {
    let Outcome {
        id,
        peer,
        range,
        elapsed,
        result,
    } = outcome;
    match result {
        Ok(response) => match task.deliver(id, peer, response)? {
            Delivery::Accepted { items } => {
                ctx.metrics.record_inbound(category, items);
                ctx.metrics.record_latency(category, elapsed);
                if items == 0 {
                    debug!(%peer, %category, %range, "Peer returned nothing");
                    // Counts like a timeout so a peer lacking the data is eventually dropped.
                    ctx.peers.record_timeout(&peer, category);
                } else {
                    ctx.peers.record_delivery(&peer, category, items, elapsed);
                }
            }
            Delivery::Stale { items } => {
                debug!(%peer, %category, %range, request = %id, "Discarding stale response");
                ctx.metrics.record_dropped(category, items);
            }
            Delivery::Disputed { items, reason } => {
                debug!(%peer, %category, %range, %reason, "Disputed response");
                ctx.metrics.record_dropped(category, items);
            }
            Delivery::Rejected {
                accepted,
                dropped,
                reason,
            } => {
                warn!(%peer, %category, %range, %reason, "Invalid response");
                ctx.metrics.record_inbound(category, accepted);
                ctx.metrics.record_dropped(category, dropped);
                ctx.peers.drop_peer(&peer, &reason);
            }
        },
        Err(RequestFailure::Timeout) => {
            ctx.metrics.record_timeout(category);
            if task.fail(id) {
                warn!(%peer, %category, %range, "Request timed out");
            }
            ctx.peers.record_timeout(&peer, category);
        }
        Err(RequestFailure::Peer(err)) => {
            task.fail(id);
            ctx.peers.drop_peer(&peer, &err.to_string());
        }
    }
    Ok(())
}
