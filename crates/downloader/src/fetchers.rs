//! Concurrent retrieval of one kind of chain data from every idle peer.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::B256;
use chain::Header;
use protocols::{Request, Response, ResponsePayload};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::error::DownloadError;
use crate::peer::{PeerConnection, PeerSet, ResponseSink};
use crate::queue::{FetchQueue, FetchRequest, Reservation};

/// Called with the headers of every body or receipt request before it is sent.
pub type FetchHook = Arc<dyn Fn(&[Header]) + Send + Sync>;

/// Consecutive failures after which a peer is no longer assigned work of a
/// kind during the current fetch.
const MAX_PEER_FAILS: usize = 3;

/// One kind of data retrievable through [`concurrent_fetch`].
pub trait TypedQueue: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Number of work items not yet reserved.
    fn pending(&self) -> usize;

    fn capacity(&self, peer: &PeerConnection, rtt: Duration) -> usize;

    fn update_capacity(&self, peer: &PeerConnection, items: usize, span: Duration);

    fn reserve(&self, peer: &PeerConnection, items: usize) -> Reservation;

    /// Release `peer`'s reservation back to the pool; returns its
    /// consecutive failure count.
    fn unreserve(&self, peer: &str) -> usize;

    fn fails(&self, peer: &str) -> usize;

    fn request(
        &self,
        peer: &PeerConnection,
        req: &FetchRequest,
        sink: ResponseSink,
    ) -> Result<Request, protocols::Error>;

    fn deliver(&self, peer: &PeerConnection, res: Response) -> Result<usize, DownloadError>;
}

fn log_unreserve(kind: &str, peer: &str, fails: usize) {
    if fails > 2 {
        trace!(peer, kind, fails, "delivery timed out");
    } else {
        debug!(peer, kind, fails, "delivery stalling");
    }
}

fn hashes(headers: &[Header]) -> Vec<B256> {
    headers.iter().map(Header::hash).collect()
}

pub struct HeaderQueue {
    queue: Arc<FetchQueue>,
}

impl HeaderQueue {
    pub fn new(queue: Arc<FetchQueue>) -> Self {
        Self { queue }
    }
}

impl TypedQueue for HeaderQueue {
    fn kind(&self) -> &'static str {
        "headers"
    }

    fn pending(&self) -> usize {
        self.queue.pending_headers()
    }

    fn capacity(&self, peer: &PeerConnection, rtt: Duration) -> usize {
        peer.header_capacity(rtt)
    }

    fn update_capacity(&self, peer: &PeerConnection, items: usize, span: Duration) {
        peer.update_header_rate(items, span);
    }

    fn reserve(&self, peer: &PeerConnection, items: usize) -> Reservation {
        self.queue.reserve_headers(peer, items)
    }

    fn unreserve(&self, peer: &str) -> usize {
        let fails = self.queue.expire_headers(peer);
        log_unreserve(self.kind(), peer, fails);
        fails
    }

    fn fails(&self, peer: &str) -> usize {
        self.queue.header_fails(peer)
    }

    fn request(
        &self,
        peer: &PeerConnection,
        req: &FetchRequest,
        sink: ResponseSink,
    ) -> Result<Request, protocols::Error> {
        trace!(peer = %peer.id(), from = req.from, count = req.count, "requesting header range");
        peer.peer()
            .request_headers_by_number(req.from, req.count as usize, 0, false, sink)
    }

    fn deliver(&self, peer: &PeerConnection, res: Response) -> Result<usize, DownloadError> {
        let ResponsePayload::Headers(headers) = res.payload else {
            self.queue.expire_headers(peer.id());
            return Err(DownloadError::InvalidHeader("unexpected response kind".into()));
        };
        let result = self.queue.deliver_headers(peer.id(), headers);
        match &result {
            Ok(accepted) => trace!(peer = %peer.id(), accepted, "delivered header range"),
            Err(err) => debug!(peer = %peer.id(), %err, "failed to deliver retrieved headers"),
        }
        result
    }
}

pub struct BodyQueue {
    queue: Arc<FetchQueue>,
    hook: Option<FetchHook>,
}

impl BodyQueue {
    pub fn new(queue: Arc<FetchQueue>, hook: Option<FetchHook>) -> Self {
        Self { queue, hook }
    }
}

impl TypedQueue for BodyQueue {
    fn kind(&self) -> &'static str {
        "bodies"
    }

    fn pending(&self) -> usize {
        self.queue.pending_bodies()
    }

    fn capacity(&self, peer: &PeerConnection, rtt: Duration) -> usize {
        peer.body_capacity(rtt)
    }

    fn update_capacity(&self, peer: &PeerConnection, items: usize, span: Duration) {
        peer.update_body_rate(items, span);
    }

    fn reserve(&self, peer: &PeerConnection, items: usize) -> Reservation {
        self.queue.reserve_bodies(peer, items)
    }

    fn unreserve(&self, peer: &str) -> usize {
        let fails = self.queue.expire_bodies(peer);
        log_unreserve(self.kind(), peer, fails);
        fails
    }

    fn fails(&self, peer: &str) -> usize {
        self.queue.body_fails(peer)
    }

    fn request(
        &self,
        peer: &PeerConnection,
        req: &FetchRequest,
        sink: ResponseSink,
    ) -> Result<Request, protocols::Error> {
        trace!(
            peer = %peer.id(),
            count = req.headers.len(),
            from = req.headers.first().map_or(0, |h| h.number),
            "requesting new batch of bodies"
        );
        if let Some(hook) = &self.hook {
            hook(&req.headers);
        }
        peer.peer().request_bodies(hashes(&req.headers), sink)
    }

    fn deliver(&self, peer: &PeerConnection, res: Response) -> Result<usize, DownloadError> {
        let ResponsePayload::Bodies(bodies) = res.payload else {
            self.queue.expire_bodies(peer.id());
            return Err(DownloadError::InvalidBody);
        };
        let count = bodies.len();
        let result = self.queue.deliver_bodies(peer, bodies);
        match &result {
            Ok(_) if count == 0 => trace!(peer = %peer.id(), "requested bodies delivered"),
            Ok(accepted) => trace!(peer = %peer.id(), count, accepted, "delivered new batch of bodies"),
            Err(err) => debug!(peer = %peer.id(), %err, "failed to deliver retrieved bodies"),
        }
        result
    }
}

pub struct ReceiptQueue {
    queue: Arc<FetchQueue>,
    hook: Option<FetchHook>,
}

impl ReceiptQueue {
    pub fn new(queue: Arc<FetchQueue>, hook: Option<FetchHook>) -> Self {
        Self { queue, hook }
    }
}

impl TypedQueue for ReceiptQueue {
    fn kind(&self) -> &'static str {
        "receipts"
    }

    fn pending(&self) -> usize {
        self.queue.pending_receipts()
    }

    fn capacity(&self, peer: &PeerConnection, rtt: Duration) -> usize {
        peer.receipt_capacity(rtt)
    }

    fn update_capacity(&self, peer: &PeerConnection, items: usize, span: Duration) {
        peer.update_receipt_rate(items, span);
    }

    fn reserve(&self, peer: &PeerConnection, items: usize) -> Reservation {
        self.queue.reserve_receipts(peer, items)
    }

    fn unreserve(&self, peer: &str) -> usize {
        let fails = self.queue.expire_receipts(peer);
        log_unreserve(self.kind(), peer, fails);
        fails
    }

    fn fails(&self, peer: &str) -> usize {
        self.queue.receipt_fails(peer)
    }

    fn request(
        &self,
        peer: &PeerConnection,
        req: &FetchRequest,
        sink: ResponseSink,
    ) -> Result<Request, protocols::Error> {
        trace!(
            peer = %peer.id(),
            count = req.headers.len(),
            from = req.headers.first().map_or(0, |h| h.number),
            "requesting new batch of receipts"
        );
        if let Some(hook) = &self.hook {
            hook(&req.headers);
        }
        peer.peer().request_receipts(hashes(&req.headers), sink)
    }

    fn deliver(&self, peer: &PeerConnection, res: Response) -> Result<usize, DownloadError> {
        let ResponsePayload::Receipts(receipts) = res.payload else {
            self.queue.expire_receipts(peer.id());
            return Err(DownloadError::InvalidReceipt);
        };
        let count = receipts.len();
        let result = self.queue.deliver_receipts(peer, receipts);
        match &result {
            Ok(accepted) => trace!(peer = %peer.id(), count, accepted, "delivered new batch of receipts"),
            Err(err) => debug!(peer = %peer.id(), %err, "failed to deliver retrieved receipts"),
        }
        result
    }
}

struct InFlight {
    request: Request,
    deadline: Instant,
}

/// Keep every idle peer busy with `queue` work until the pool is drained and
/// all requests are answered. Bad deliveries and timeouts release the work
/// for other peers; the fetch fails only when no peer can make progress or
/// the sync is cancelled.
pub async fn concurrent_fetch(
    queue: &dyn TypedQueue,
    peers: &PeerSet,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), DownloadError> {
    let (sink, mut responses) = mpsc::channel(peers.len().max(1) * 2);
    let mut peer_events = peers.subscribe_events();
    let mut in_flight: HashMap<String, InFlight> = HashMap::new();

    let result = loop {
        if *cancel.borrow() {
            break Err(DownloadError::Cancelled);
        }
        let rates = peers.rates();
        let rtt = rates.target_round_trip();
        let timeout = rates.target_timeout();

        let mut send_failed = false;
        if queue.pending() > 0 {
            let idles: Vec<Arc<PeerConnection>> = peers
                .all_peers()
                .into_iter()
                .filter(|p| !in_flight.contains_key(p.id()) && queue.fails(p.id()) < MAX_PEER_FAILS)
                .collect();
            let mut idles: Vec<_> = idles.into_iter().map(|p| (queue.capacity(&p, rtt), p)).collect();
            idles.sort_by_key(|(cap, p)| (Reverse(*cap), p.id().to_string()));

            for (cap, peer) in idles {
                if queue.pending() == 0 {
                    break;
                }
                let Some(req) = queue.reserve(&peer, cap).request else {
                    continue;
                };
                match queue.request(&peer, &req, sink.clone()) {
                    Ok(request) => {
                        in_flight.insert(
                            peer.id().to_string(),
                            InFlight {
                                request,
                                deadline: Instant::now() + timeout,
                            },
                        );
                    }
                    Err(err) => {
                        debug!(peer = %peer.id(), kind = queue.kind(), %err, "failed to send request");
                        queue.unreserve(peer.id());
                        send_failed = true;
                    }
                }
            }
        }
        if queue.pending() == 0 && in_flight.is_empty() {
            break Ok(());
        }
        if in_flight.is_empty() {
            // Failed sends count against the peer, so retrying ends once
            // every peer has used up its failures.
            if send_failed {
                continue;
            }
            warn!(kind = queue.kind(), pending = queue.pending(), peers = peers.len(), "no peers available for download");
            break Err(DownloadError::NoPeers);
        }

        let next_deadline = in_flight.values().map(|f| f.deadline).min();
        let wake = next_deadline.unwrap_or_else(Instant::now);

        tokio::select! {
            _ = cancel.changed() => break Err(DownloadError::Cancelled),
            Some(res) = responses.recv() => {
                let mut flight = match in_flight.remove(&res.peer) {
                    Some(flight) if flight.request.id == res.id => flight,
                    Some(flight) => {
                        trace!(peer = %res.peer, id = res.id, "dropping stale response");
                        in_flight.insert(res.peer.clone(), flight);
                        continue;
                    }
                    None => {
                        trace!(peer = %res.peer, id = res.id, "dropping unsolicited response");
                        continue;
                    }
                };
                let _ = flight.request.close();
                let Some(peer) = peers.peer(&res.peer) else {
                    continue;
                };
                queue.update_capacity(&peer, res.payload.len(), res.time);
                // deliver logs its own failures; the work is back in the pool
                let _ = queue.deliver(&peer, res);
            }
            Some(event) = peer_events.recv() => {
                if !event.join {
                    if let Some(mut flight) = in_flight.remove(event.peer.id()) {
                        let _ = flight.request.close();
                        queue.unreserve(event.peer.id());
                    }
                }
            }
            _ = time::sleep_until(wake), if next_deadline.is_some() => {
                let now = Instant::now();
                let expired: Vec<String> = in_flight
                    .iter()
                    .filter(|(_, f)| f.deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in expired {
                    if let Some(mut flight) = in_flight.remove(&id) {
                        let _ = flight.request.close();
                        if let Some(peer) = peers.peer(&id) {
                            queue.update_capacity(&peer, 0, timeout);
                        }
                        queue.unreserve(&id);
                    }
                }
                rates.tune();
            }
        }
    };

    for (id, mut flight) in in_flight {
        let _ = flight.request.close();
        queue.unreserve(&id);
    }
    result
}
