use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy_primitives::{B256, U256};
use chain::{BlockChain, Header};
use event::TypeMux;
use parking_lot::Mutex;
use protocols::constants::MAX_HEADER_FETCH;
use protocols::{HashOrNumber, Response, ResponsePayload};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::DownloadError;
use crate::events::DownloaderEvent;
use crate::fetchers::{concurrent_fetch, BodyQueue, FetchHook, HeaderQueue, ReceiptQueue};
use crate::peer::{LightPeer, LightPeerWrapper, Peer, PeerConnection, PeerSet};
use crate::queue::{FetchQueue, FetchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Download and execute every block.
    #[default]
    Full,
    /// Download blocks with receipts and import them without execution.
    Snap,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Mode the node starts syncing in.
    pub mode: SyncMode,
    /// Block number of the trusted checkpoint; zero when there is none.
    pub checkpoint: u64,
    /// Blocks fetched and committed per cycle.
    pub blocks_per_cycle: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: SyncMode::Full,
            checkpoint: 0,
            blocks_per_cycle: 2048,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub starting_block: u64,
    pub current_block: u64,
    pub highest_block: u64,
}

/// Disconnects a misbehaving peer.
pub type DropPeerFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Clears the synchronising flag however the sync ends.
struct SyncFlag<'a>(&'a AtomicBool);

impl Drop for SyncFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Retrieves the chain from the best peer and imports it.
pub struct Downloader {
    config: Config,
    chain: Arc<dyn BlockChain>,
    mux: Arc<TypeMux<DownloaderEvent>>,
    peers: PeerSet,
    queue: Arc<FetchQueue>,
    drop_peer: Option<DropPeerFn>,
    body_hook: Option<FetchHook>,
    receipt_hook: Option<FetchHook>,

    synchronising: AtomicBool,
    terminated: AtomicBool,
    sync_peer: Mutex<Option<String>>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
    progress: Mutex<SyncProgress>,
    mode: Mutex<SyncMode>,
}

impl Downloader {
    pub fn new(
        config: Config,
        chain: Arc<dyn BlockChain>,
        mux: Arc<TypeMux<DownloaderEvent>>,
        drop_peer: Option<DropPeerFn>,
    ) -> Self {
        let mode = config.mode;
        Self {
            config,
            chain,
            mux,
            peers: PeerSet::new(),
            queue: Arc::new(FetchQueue::new()),
            drop_peer,
            body_hook: None,
            receipt_hook: None,
            synchronising: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            sync_peer: Mutex::new(None),
            cancel: Mutex::new(None),
            progress: Mutex::new(SyncProgress::default()),
            mode: Mutex::new(mode),
        }
    }

    /// Install callbacks observing every body and receipt request.
    pub fn with_fetch_hooks(mut self, bodies: Option<FetchHook>, receipts: Option<FetchHook>) -> Self {
        self.body_hook = bodies;
        self.receipt_hook = receipts;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn mux(&self) -> &Arc<TypeMux<DownloaderEvent>> {
        &self.mux
    }

    pub fn register_peer(&self, id: &str, version: u32, peer: Arc<dyn Peer>) -> Result<(), DownloadError> {
        trace!(peer = id, version, "registering sync peer");
        self.peers.register(id, version, peer).map(|_| ())
    }

    pub fn register_light_peer(
        &self,
        id: &str,
        version: u32,
        peer: Arc<dyn LightPeer>,
    ) -> Result<(), DownloadError> {
        self.register_peer(id, version, Arc::new(LightPeerWrapper::new(peer)))
    }

    /// Remove a peer. Losing the peer a sync runs against aborts that sync.
    pub fn unregister_peer(&self, id: &str) -> Result<(), DownloadError> {
        trace!(peer = id, "unregistering sync peer");
        self.peers.unregister(id)?;
        if self.sync_peer.lock().as_deref() == Some(id) {
            debug!(peer = id, "sync peer dropped, cancelling sync");
            self.cancel();
        }
        Ok(())
    }

    pub fn synchronising(&self) -> bool {
        self.synchronising.load(Ordering::Acquire)
    }

    /// Starting, current and highest block of the running or last sync.
    pub fn progress(&self) -> SyncProgress {
        let mut progress = *self.progress.lock();
        progress.current_block = match *self.mode.lock() {
            SyncMode::Full => self.chain.current_block().number(),
            SyncMode::Snap => self.chain.current_snap_block().number(),
        };
        progress
    }

    /// Abort the running sync, if any.
    pub fn cancel(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            let _ = cancel.send(true);
        }
    }

    /// Cancel the running sync and refuse any further one.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        self.queue.close();
        self.cancel();
    }

    /// Synchronise with `id`, whose head is `head` at total difficulty `td`.
    /// Peers at fault are dropped through the drop callback.
    pub async fn legacy_sync(
        &self,
        id: &str,
        head: B256,
        td: U256,
        ttd: Option<U256>,
        mode: SyncMode,
    ) -> Result<(), DownloadError> {
        let result = self.synchronise(id, head, td, ttd, mode).await;
        match &result {
            Ok(())
            | Err(DownloadError::Busy)
            | Err(DownloadError::Cancelled)
            | Err(DownloadError::MergeTransition) => {}
            Err(err) if err.is_peer_fault() => {
                warn!(peer = id, %err, "synchronisation failed, dropping peer");
                match &self.drop_peer {
                    Some(drop_peer) => drop_peer(id),
                    None => warn!(peer = id, "downloader wants to drop peer, but no drop function is set"),
                }
            }
            Err(err) => warn!(%err, "synchronisation failed, retrying"),
        }
        result
    }

    async fn synchronise(
        &self,
        id: &str,
        head: B256,
        td: U256,
        ttd: Option<U256>,
        mode: SyncMode,
    ) -> Result<(), DownloadError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(DownloadError::Cancelled);
        }
        if self.synchronising.swap(true, Ordering::AcqRel) {
            return Err(DownloadError::Busy);
        }
        let _flag = SyncFlag(&self.synchronising);

        self.peers.reset();
        self.queue.reset();
        let (cancel_tx, cancel) = watch::channel(false);
        *self.cancel.lock() = Some(cancel_tx);
        *self.sync_peer.lock() = Some(id.to_string());
        *self.mode.lock() = mode;

        let result = match self.peers.peer(id) {
            _ if self.terminated.load(Ordering::Acquire) => Err(DownloadError::Cancelled),
            Some(peer) => self.sync_with_peer(&peer, head, td, ttd, mode, cancel).await,
            None => Err(DownloadError::UnknownPeer(id.to_string())),
        };
        self.sync_peer.lock().take();
        self.cancel.lock().take();
        result
    }

    async fn sync_with_peer(
        &self,
        peer: &PeerConnection,
        head: B256,
        td: U256,
        ttd: Option<U256>,
        mode: SyncMode,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), DownloadError> {
        if let Err(err) = self.mux.post(DownloaderEvent::Start) {
            debug!(%err, "sync event mux stopped");
        }
        let result = self.fetch_and_commit(peer, head, td, ttd, mode, cancel).await;
        let event = match &result {
            Ok(()) => DownloaderEvent::Done(self.local_head(mode)),
            Err(err) => DownloaderEvent::Failed(err.to_string()),
        };
        if let Err(err) = self.mux.post(event) {
            debug!(%err, "sync event mux stopped");
        }
        result
    }

    fn local_head(&self, mode: SyncMode) -> Header {
        match mode {
            SyncMode::Full => self.chain.current_block().header().clone(),
            SyncMode::Snap => self.chain.current_snap_block().header().clone(),
        }
    }

    async fn fetch_and_commit(
        &self,
        peer: &PeerConnection,
        head: B256,
        td: U256,
        ttd: Option<U256>,
        mode: SyncMode,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), DownloadError> {
        debug!(peer = %peer.id(), version = peer.version(), %head, %td, ?mode, "synchronising with the network");
        let started = Instant::now();

        let remote = self.fetch_head(peer, head, &mut cancel).await?;
        let local = self.local_head(mode);
        let ancestor = self.find_ancestor(peer, &local, &remote, &mut cancel).await?;
        *self.progress.lock() = SyncProgress {
            starting_block: ancestor.number,
            current_block: local.number,
            highest_block: remote.number,
        };

        let mut parent_hash = ancestor.hash();
        let mut parent_td = self
            .chain
            .get_td(&parent_hash, ancestor.number)
            .ok_or_else(|| DownloadError::InvalidChain("ancestor total difficulty unknown".into()))?;
        if ttd.is_some_and(|ttd| parent_td >= ttd) {
            return Err(DownloadError::MergeTransition);
        }

        let cycle = self.config.blocks_per_cycle.max(1);
        let mut next = ancestor.number + 1;
        while next <= remote.number {
            let last = next.saturating_add(cycle - 1).min(remote.number);

            self.queue.reset();
            let tail = (last == remote.number).then_some(head);
            self.queue.schedule_headers(next, last, MAX_HEADER_FETCH as u64, parent_hash, tail);
            concurrent_fetch(&HeaderQueue::new(self.queue.clone()), &self.peers, cancel.clone()).await?;
            let mut headers = self.queue.take_headers();
            verify_linkage(&headers, parent_hash, next, last)?;

            // Legacy sync stops at the terminal block.
            let mut reached_ttd = false;
            if let Some(ttd) = ttd {
                let mut td = parent_td;
                if let Some(cut) = headers.iter().position(|h| {
                    let past = td >= ttd;
                    td += h.difficulty;
                    past
                }) {
                    headers.truncate(cut);
                    reached_ttd = true;
                }
            }
            let Some(tip) = headers.last().cloned() else {
                break;
            };
            parent_td = headers.iter().fold(parent_td, |td, h| td + h.difficulty);
            let count = headers.len();

            self.queue.schedule(headers, mode == SyncMode::Snap);
            let bodies = BodyQueue::new(self.queue.clone(), self.body_hook.clone());
            let receipts = ReceiptQueue::new(self.queue.clone(), self.receipt_hook.clone());
            tokio::try_join!(
                concurrent_fetch(&bodies, &self.peers, cancel.clone()),
                concurrent_fetch(&receipts, &self.peers, cancel.clone()),
            )?;

            let results = self.queue.results();
            if results.len() != count {
                return Err(DownloadError::InvalidChain(format!(
                    "assembled {} of {count} blocks",
                    results.len()
                )));
            }
            self.commit(results, mode)?;
            self.progress.lock().current_block = tip.number;
            parent_hash = tip.hash();

            if reached_ttd {
                info!(number = tip.number, "legacy sync reached merge threshold");
                return Err(DownloadError::MergeTransition);
            }
            next = last + 1;
        }
        info!(peer = %peer.id(), elapsed = ?started.elapsed(), head = remote.number, "synchronisation completed");
        Ok(())
    }

    fn commit(&self, results: Vec<FetchResult>, mode: SyncMode) -> Result<(), DownloadError> {
        let (Some(first), Some(last)) = (results.first(), results.last()) else {
            return Ok(());
        };
        debug!(
            count = results.len(),
            first = first.header.number,
            last = last.header.number,
            ?mode,
            "inserting downloaded chain"
        );
        match mode {
            SyncMode::Full => {
                let blocks = results.into_iter().map(|r| r.into_block().0).collect();
                self.chain.insert_chain(blocks)?;
            }
            SyncMode::Snap => {
                let (blocks, receipts): (Vec<_>, Vec<_>) = results.into_iter().map(FetchResult::into_block).unzip();
                self.chain.insert_receipt_chain(blocks, receipts)?;
            }
        }
        Ok(())
    }

    async fn fetch_head(
        &self,
        peer: &PeerConnection,
        head: B256,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Header, DownloadError> {
        debug!(peer = %peer.id(), %head, "retrieving remote chain head");
        let mut headers = self
            .request_headers(peer, HashOrNumber::Hash(head), 1, 0, false, cancel)
            .await?;
        if headers.len() != 1 {
            return Err(DownloadError::InvalidHeader(format!(
                "{} headers for head request",
                headers.len()
            )));
        }
        let header = headers.remove(0);
        if header.hash() != head {
            return Err(DownloadError::InvalidHeader("remote head hash mismatch".into()));
        }
        Ok(header)
    }

    /// Highest block both chains share: first a span of recent headers, then
    /// a binary search below it.
    async fn find_ancestor(
        &self,
        peer: &PeerConnection,
        local: &Header,
        remote: &Header,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Header, DownloadError> {
        let known = |h: &Header| self.chain.get_header(&h.hash(), h.number).is_some();

        let from = local.number.min(remote.number);
        let count = (from + 1).min(MAX_HEADER_FETCH as u64);
        let headers = self
            .request_headers(peer, HashOrNumber::Number(from), count as usize, 0, true, cancel)
            .await?;
        if headers.is_empty() {
            return Err(DownloadError::InvalidChain("empty ancestor header set".into()));
        }
        for (i, header) in headers.iter().enumerate() {
            if header.number != from - i as u64 {
                return Err(DownloadError::InvalidHeader("invalid ancestor search response".into()));
            }
            if known(header) {
                debug!(number = header.number, hash = %header.hash(), "found common ancestor");
                return Ok(header.clone());
            }
        }

        let floor = from + 1 - headers.len() as u64;
        if floor == 0 {
            return Err(DownloadError::InvalidChain("genesis mismatch".into()));
        }
        let mut ancestor = self.chain.genesis().header().clone();
        let (mut lo, mut hi) = (0u64, floor);
        while lo + 1 < hi {
            let mid = (lo + hi) / 2;
            let mut headers = self
                .request_headers(peer, HashOrNumber::Number(mid), 1, 0, false, cancel)
                .await?;
            if headers.len() != 1 || headers[0].number != mid {
                return Err(DownloadError::InvalidHeader("invalid ancestor search response".into()));
            }
            let header = headers.remove(0);
            if known(&header) {
                lo = mid;
                ancestor = header;
            } else {
                hi = mid;
            }
        }
        debug!(number = ancestor.number, hash = %ancestor.hash(), "found common ancestor by binary search");
        Ok(ancestor)
    }

    async fn request_headers(
        &self,
        peer: &PeerConnection,
        origin: HashOrNumber,
        amount: usize,
        skip: usize,
        reverse: bool,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Vec<Header>, DownloadError> {
        let (sink, mut responses) = mpsc::channel(1);
        let mut request = match origin {
            HashOrNumber::Hash(hash) => peer.peer().request_headers_by_hash(hash, amount, skip, reverse, sink)?,
            HashOrNumber::Number(number) => {
                peer.peer()
                    .request_headers_by_number(number, amount, skip, reverse, sink)?
            }
        };
        let timeout = self.peers.rates().target_timeout();
        let result = tokio::select! {
            _ = cancel.changed() => Err(DownloadError::Cancelled),
            _ = time::sleep(timeout) => {
                peer.update_header_rate(0, timeout);
                Err(DownloadError::Timeout)
            }
            res = responses.recv() => match res {
                Some(Response { payload: ResponsePayload::Headers(headers), time, .. }) => {
                    peer.update_header_rate(headers.len(), time);
                    Ok(headers)
                }
                Some(_) => Err(DownloadError::InvalidHeader("unexpected response kind".into())),
                None => Err(DownloadError::Request(protocols::Error::PeerClosed)),
            },
        };
        let _ = request.close();
        result
    }
}

/// The headers must be exactly `from..=to` and extend `parent`.
fn verify_linkage(headers: &[Header], parent: B256, from: u64, to: u64) -> Result<(), DownloadError> {
    if headers.len() as u64 != to - from + 1 {
        return Err(DownloadError::InvalidChain(format!(
            "want {} headers, got {}",
            to - from + 1,
            headers.len()
        )));
    }
    let mut expect = parent;
    for (i, header) in headers.iter().enumerate() {
        if header.number != from + i as u64 || header.parent_hash != expect {
            return Err(DownloadError::InvalidChain(format!("broken link at block {}", header.number)));
        }
        expect = header.hash();
    }
    Ok(())
}
