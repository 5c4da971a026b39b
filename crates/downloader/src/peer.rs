//! The active peer set of the downloader: throughput tracking and lacking
//! items per peer, lifecycle events for the set.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{B256, U256};
use event::{Feed, Subscription};
use parking_lot::{Mutex, RwLock};
use protocols::constants::{MAX_BLOCK_FETCH, MAX_HEADER_FETCH, MAX_RECEIPT_FETCH};
use protocols::eth::{BLOCK_BODIES_MSG, BLOCK_HEADERS_MSG, RECEIPTS_MSG};
use protocols::{Request, Response};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::DownloadError;
use crate::msgrate::{Tracker, Trackers};

/// Maximum number of entries allowed on the list of lacking items.
pub const MAX_LACKING_HASHES: usize = 4096;

/// Channel a peer delivers responses on.
pub type ResponseSink = mpsc::Sender<Response>;

/// Methods required to synchronise headers with a remote peer.
pub trait LightPeer: Send + Sync {
    /// Head hash and total difficulty announced by the peer.
    fn head(&self) -> (B256, U256);

    fn request_headers_by_hash(
        &self,
        origin: B256,
        amount: usize,
        skip: usize,
        reverse: bool,
        sink: ResponseSink,
    ) -> Result<Request, protocols::Error>;

    fn request_headers_by_number(
        &self,
        origin: u64,
        amount: usize,
        skip: usize,
        reverse: bool,
        sink: ResponseSink,
    ) -> Result<Request, protocols::Error>;
}

/// Methods required to synchronise with a remote full peer.
pub trait Peer: LightPeer {
    fn request_bodies(&self, hashes: Vec<B256>, sink: ResponseSink) -> Result<Request, protocols::Error>;

    fn request_receipts(&self, hashes: Vec<B256>, sink: ResponseSink) -> Result<Request, protocols::Error>;
}

/// Adapts a [`LightPeer`] to [`Peer`]. Body and receipt retrieval is a
/// programming error in light mode and panics.
pub struct LightPeerWrapper {
    peer: Arc<dyn LightPeer>,
}

impl LightPeerWrapper {
    pub fn new(peer: Arc<dyn LightPeer>) -> Self {
        Self { peer }
    }
}

impl LightPeer for LightPeerWrapper {
    fn head(&self) -> (B256, U256) {
        self.peer.head()
    }

    fn request_headers_by_hash(
        &self,
        origin: B256,
        amount: usize,
        skip: usize,
        reverse: bool,
        sink: ResponseSink,
    ) -> Result<Request, protocols::Error> {
        self.peer.request_headers_by_hash(origin, amount, skip, reverse, sink)
    }

    fn request_headers_by_number(
        &self,
        origin: u64,
        amount: usize,
        skip: usize,
        reverse: bool,
        sink: ResponseSink,
    ) -> Result<Request, protocols::Error> {
        self.peer.request_headers_by_number(origin, amount, skip, reverse, sink)
    }
}

impl Peer for LightPeerWrapper {
    fn request_bodies(&self, _: Vec<B256>, _: ResponseSink) -> Result<Request, protocols::Error> {
        panic!("request_bodies not supported in light client mode sync")
    }

    fn request_receipts(&self, _: Vec<B256>, _: ResponseSink) -> Result<Request, protocols::Error> {
        panic!("request_receipts not supported in light client mode sync")
    }
}

/// Hashes a peer is known not to have, evicted oldest first.
#[derive(Default)]
struct Lacking {
    set: HashSet<B256>,
    order: VecDeque<B256>,
}

/// An active peer from which headers, bodies and receipts are retrieved.
pub struct PeerConnection {
    id: String,
    version: u32,
    peer: Arc<dyn Peer>,
    rates: Arc<Tracker>,
    lacking: Mutex<Lacking>,
}

impl PeerConnection {
    fn new(id: String, version: u32, peer: Arc<dyn Peer>, rates: Arc<Tracker>) -> Self {
        Self {
            id,
            version,
            peer,
            rates,
            lacking: Mutex::new(Lacking::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn peer(&self) -> &Arc<dyn Peer> {
        &self.peer
    }

    /// Clear the lacking set ahead of a new retrieval round.
    pub fn reset(&self) {
        *self.lacking.lock() = Lacking::default();
    }

    pub fn update_header_rate(&self, delivered: usize, elapsed: Duration) {
        self.rates.update(BLOCK_HEADERS_MSG, elapsed, delivered);
    }

    pub fn update_body_rate(&self, delivered: usize, elapsed: Duration) {
        self.rates.update(BLOCK_BODIES_MSG, elapsed, delivered);
    }

    pub fn update_receipt_rate(&self, delivered: usize, elapsed: Duration) {
        self.rates.update(RECEIPTS_MSG, elapsed, delivered);
    }

    pub fn header_capacity(&self, target_rtt: Duration) -> usize {
        self.rates.capacity(BLOCK_HEADERS_MSG, target_rtt).min(MAX_HEADER_FETCH)
    }

    pub fn body_capacity(&self, target_rtt: Duration) -> usize {
        self.rates.capacity(BLOCK_BODIES_MSG, target_rtt).min(MAX_BLOCK_FETCH)
    }

    pub fn receipt_capacity(&self, target_rtt: Duration) -> usize {
        self.rates.capacity(RECEIPTS_MSG, target_rtt).min(MAX_RECEIPT_FETCH)
    }

    /// Record that the peer does not have `hash`. The oldest entry is
    /// dropped once the set is full.
    pub fn mark_lacking(&self, hash: B256) {
        let mut lacking = self.lacking.lock();
        if lacking.set.contains(&hash) {
            return;
        }
        while lacking.set.len() >= MAX_LACKING_HASHES {
            match lacking.order.pop_front() {
                Some(drop) => {
                    lacking.set.remove(&drop);
                }
                None => break,
            }
        }
        lacking.set.insert(hash);
        lacking.order.push_back(hash);
    }

    pub fn lacks(&self, hash: &B256) -> bool {
        self.lacking.lock().set.contains(hash)
    }

    pub fn lacking_len(&self) -> usize {
        self.lacking.lock().set.len()
    }
}

/// Sent on the peer event feed when a peer joins or leaves the set.
#[derive(Clone)]
pub struct PeeringEvent {
    pub peer: Arc<PeerConnection>,
    pub join: bool,
}

/// The collection of peers participating in the chain download.
pub struct PeerSet {
    peers: RwLock<HashMap<String, Arc<PeerConnection>>>,
    rates: Trackers,
    events: Feed<PeeringEvent>,
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSet {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            rates: Trackers::new(),
            events: Feed::new(),
        }
    }

    pub fn subscribe_events(&self) -> Subscription<PeeringEvent> {
        self.events.subscribe()
    }

    pub fn rates(&self) -> &Trackers {
        &self.rates
    }

    /// Reset every known peer ahead of a new batch of retrievals.
    pub fn reset(&self) {
        for peer in self.peers.read().values() {
            peer.reset();
        }
    }

    /// Add a peer to the working set. Its throughput estimates start at the
    /// mean of the existing peers so it is used for retrievals right away.
    pub fn register(
        &self,
        id: impl Into<String>,
        version: u32,
        peer: Arc<dyn Peer>,
    ) -> Result<Arc<PeerConnection>, DownloadError> {
        let id = id.into();
        let conn = {
            let mut peers = self.peers.write();
            if peers.contains_key(&id) {
                return Err(DownloadError::AlreadyRegistered);
            }
            let rates = Arc::new(Tracker::new(
                self.rates.mean_capacities(),
                self.rates.median_round_trip(),
            ));
            self.rates.track(&id, rates.clone())?;
            let conn = Arc::new(PeerConnection::new(id.clone(), version, peer, rates));
            peers.insert(id, conn.clone());
            conn
        };
        debug!(peer = %conn.id(), version, "registered sync peer");
        self.events.send(PeeringEvent {
            peer: conn.clone(),
            join: true,
        });
        Ok(conn)
    }

    /// Remove a peer, disabling any further retrievals from it.
    pub fn unregister(&self, id: &str) -> Result<(), DownloadError> {
        let conn = {
            let mut peers = self.peers.write();
            let conn = peers.remove(id).ok_or(DownloadError::NotRegistered)?;
            self.rates.untrack(id)?;
            conn
        };
        trace!(peer = %id, "unregistered sync peer");
        self.events.send(PeeringEvent {
            peer: conn,
            join: false,
        });
        Ok(())
    }

    pub fn peer(&self, id: &str) -> Option<Arc<PeerConnection>> {
        self.peers.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.read().values().cloned().collect()
    }

    /// All peers ordered by `capacity`, highest first.
    pub fn peers_by_capacity<F>(&self, capacity: F) -> Vec<Arc<PeerConnection>>
    where
        F: Fn(&PeerConnection) -> usize,
    {
        let mut peers = self.all_peers();
        peers.sort_by_cached_key(|p| (Reverse(capacity(p)), p.id().to_string()));
        peers
    }
}
