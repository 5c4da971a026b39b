//! Scheduling of block parts to fetch: header ranges, bodies and receipts.
//!
//! Work items sit in per-kind task pools until a peer reserves them. A
//! reservation is bound to one peer and either delivered, returning the
//! unsatisfied remainder to the pool, or expired by the fetcher.

use std::collections::{BTreeMap, HashMap};

use alloy_primitives::B256;
use chain::types::{compute_uncle_hash, empty_root_hash, empty_uncle_hash, receipts_root, transactions_root};
use chain::{Block, BlockBody, Header, Receipt};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::error::DownloadError;
use crate::peer::PeerConnection;

/// Items reserved for one peer.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub peer: String,
    /// First block of a header range request.
    pub from: u64,
    /// Number of headers requested from `from`.
    pub count: u64,
    /// Blocks whose bodies or receipts are requested.
    pub headers: Vec<Header>,
    pub time: Instant,
}

impl FetchRequest {
    pub fn len(&self) -> usize {
        if self.headers.is_empty() {
            self.count as usize
        } else {
            self.headers.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a reservation attempt.
#[derive(Debug)]
pub struct Reservation {
    pub request: Option<FetchRequest>,
    /// Whether unreserved work remains in the pool.
    pub more: bool,
}

impl Reservation {
    fn none(more: bool) -> Self {
        Self { request: None, more }
    }

    pub fn reserved(&self) -> bool {
        self.request.is_some()
    }
}

/// A block being assembled from its fetched parts.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub header: Header,
    pub body: BlockBody,
    pub receipts: Vec<Receipt>,
    need_body: bool,
    need_receipts: bool,
}

impl FetchResult {
    fn new(header: Header, fetch_receipts: bool) -> Self {
        let need_body = header.transactions_root != empty_root_hash() || header.uncle_hash != empty_uncle_hash();
        let need_receipts = fetch_receipts && header.receipts_root != empty_root_hash();
        Self {
            header,
            body: BlockBody::default(),
            receipts: Vec::new(),
            need_body,
            need_receipts,
        }
    }

    pub fn done(&self) -> bool {
        !self.need_body && !self.need_receipts
    }

    pub fn into_block(self) -> (Block, Vec<Receipt>) {
        (Block::from_parts(self.header, self.body), self.receipts)
    }
}

struct Pool<T> {
    tasks: BTreeMap<u64, T>,
    pend: HashMap<String, FetchRequest>,
    fails: HashMap<String, usize>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self {
            tasks: BTreeMap::new(),
            pend: HashMap::new(),
            fails: HashMap::new(),
        }
    }
}

impl<T> Pool<T> {
    fn fail(&mut self, peer: &str) -> usize {
        let fails = self.fails.entry(peer.to_string()).or_default();
        *fails += 1;
        *fails
    }

    fn fails(&self, peer: &str) -> usize {
        self.fails.get(peer).copied().unwrap_or(0)
    }
}

impl Pool<Header> {
    fn reserve(&mut self, peer: &PeerConnection, count: usize) -> Reservation {
        if count == 0 || self.tasks.is_empty() || self.pend.contains_key(peer.id()) {
            return Reservation::none(!self.tasks.is_empty());
        }
        let numbers: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, header)| !peer.lacks(&header.hash()))
            .take(count)
            .map(|(number, _)| *number)
            .collect();
        if numbers.is_empty() {
            return Reservation::none(true);
        }
        let headers: Vec<Header> = numbers.iter().filter_map(|n| self.tasks.remove(n)).collect();
        let request = FetchRequest {
            peer: peer.id().to_string(),
            from: 0,
            count: 0,
            headers,
            time: Instant::now(),
        };
        self.pend.insert(peer.id().to_string(), request.clone());
        Reservation {
            request: Some(request),
            more: !self.tasks.is_empty(),
        }
    }

    fn expire(&mut self, peer: &str) -> usize {
        let Some(request) = self.pend.remove(peer) else {
            error!(peer, "expired request does not exist");
            return 0;
        };
        for header in request.headers {
            self.tasks.insert(header.number, header);
        }
        self.fail(peer)
    }

    /// Return the undelivered part of a request. An honest short delivery
    /// means the peer lacks the remainder.
    fn requeue(&mut self, peer: &PeerConnection, rest: Vec<Header>, lacking: bool) {
        for header in rest {
            if lacking {
                peer.mark_lacking(header.hash());
            }
            self.tasks.insert(header.number, header);
        }
    }
}

/// A delivered header range and the peer that served it.
struct HeaderRange {
    peer: String,
    headers: Vec<Header>,
}

/// Hash the scheduled header ranges must chain from, and the block the
/// linked prefix has reached so far.
#[derive(Default)]
struct HeaderLink {
    parent: B256,
    next: u64,
    last: u64,
    tail: Option<B256>,
}

#[derive(Default)]
struct Inner {
    headers: Pool<u64>,
    header_results: BTreeMap<u64, HeaderRange>,
    header_link: HeaderLink,
    bodies: Pool<Header>,
    receipts: Pool<Header>,
    results: BTreeMap<u64, FetchResult>,
    closed: bool,
}

/// Shared work queue of the downloader. Safe for concurrent reservation and
/// delivery from every peer's fetch stream.
#[derive(Default)]
pub struct FetchQueue {
    inner: Mutex<Inner>,
}

impl FetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every task, reservation and result.
    pub fn reset(&self) {
        *self.inner.lock() = Inner::default();
    }

    /// Stop handing out work. Outstanding deliveries are still accepted.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Schedule header retrieval for blocks `from..=to` in ranges of at most
    /// `batch` headers. The first range must descend from `parent`, and the
    /// last one must end at `tail` when given.
    pub fn schedule_headers(&self, from: u64, to: u64, batch: u64, parent: B256, tail: Option<B256>) {
        let mut inner = self.inner.lock();
        inner.header_link = HeaderLink {
            parent,
            next: from,
            last: to,
            tail,
        };
        let batch = batch.max(1);
        let mut start = from;
        while start <= to {
            let count = batch.min(to - start + 1);
            inner.headers.tasks.insert(start, count);
            start += count;
        }
    }

    /// Schedule body (and in snap mode receipt) retrieval for `headers`.
    /// Blocks with nothing to fetch complete immediately.
    pub fn schedule(&self, headers: Vec<Header>, fetch_receipts: bool) {
        let mut inner = self.inner.lock();
        for header in headers {
            let result = FetchResult::new(header.clone(), fetch_receipts);
            if result.need_body {
                inner.bodies.tasks.insert(header.number, header.clone());
            }
            if result.need_receipts {
                inner.receipts.tasks.insert(header.number, header.clone());
            }
            inner.results.insert(header.number, result);
        }
    }

    pub fn pending_headers(&self) -> usize {
        self.inner.lock().headers.tasks.len()
    }

    pub fn pending_bodies(&self) -> usize {
        self.inner.lock().bodies.tasks.len()
    }

    pub fn pending_receipts(&self) -> usize {
        self.inner.lock().receipts.tasks.len()
    }

    pub fn in_flight(&self) -> bool {
        let inner = self.inner.lock();
        !inner.headers.pend.is_empty() || !inner.bodies.pend.is_empty() || !inner.receipts.pend.is_empty()
    }

    /// Reserve the lowest pending header range for `peer`. Ranges are not
    /// split, so `count` only gates whether the peer takes work at all.
    pub fn reserve_headers(&self, peer: &PeerConnection, count: usize) -> Reservation {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let pool = &mut inner.headers;
        if inner.closed || count == 0 || pool.pend.contains_key(peer.id()) {
            return Reservation::none(!pool.tasks.is_empty());
        }
        let Some((from, count)) = pool.tasks.pop_first() else {
            return Reservation::none(false);
        };
        let request = FetchRequest {
            peer: peer.id().to_string(),
            from,
            count,
            headers: Vec::new(),
            time: Instant::now(),
        };
        pool.pend.insert(peer.id().to_string(), request.clone());
        Reservation {
            request: Some(request),
            more: !pool.tasks.is_empty(),
        }
    }

    pub fn reserve_bodies(&self, peer: &PeerConnection, count: usize) -> Reservation {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Reservation::none(false);
        }
        inner.bodies.reserve(peer, count)
    }

    pub fn reserve_receipts(&self, peer: &PeerConnection, count: usize) -> Reservation {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Reservation::none(false);
        }
        inner.receipts.reserve(peer, count)
    }

    /// Return a timed out header request to the pool; returns the peer's
    /// consecutive failure count.
    pub fn expire_headers(&self, peer: &str) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let pool = &mut inner.headers;
        let Some(request) = pool.pend.remove(peer) else {
            error!(peer, "expired request does not exist");
            return 0;
        };
        pool.tasks.insert(request.from, request.count);
        pool.fail(peer)
    }

    pub fn expire_bodies(&self, peer: &str) -> usize {
        self.inner.lock().bodies.expire(peer)
    }

    pub fn expire_receipts(&self, peer: &str) -> usize {
        self.inner.lock().receipts.expire(peer)
    }

    pub fn header_fails(&self, peer: &str) -> usize {
        self.inner.lock().headers.fails(peer)
    }

    pub fn body_fails(&self, peer: &str) -> usize {
        self.inner.lock().bodies.fails(peer)
    }

    pub fn receipt_fails(&self, peer: &str) -> usize {
        self.inner.lock().receipts.fails(peer)
    }

    /// Accept a header range. The range must be complete, numbered and
    /// internally linked. Once its predecessor is in, it must also chain onto
    /// it; a range that breaks the chain is blamed on the peer that served it.
    pub fn deliver_headers(&self, peer: &str, headers: Vec<Header>) -> Result<usize, DownloadError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let pool = &mut inner.headers;
        let request = pool.pend.remove(peer).ok_or(DownloadError::NoFetchesPending)?;

        let check = || {
            if headers.len() as u64 != request.count {
                return Err(format!("want {} headers, got {}", request.count, headers.len()));
            }
            for (i, header) in headers.iter().enumerate() {
                if header.number != request.from + i as u64 {
                    return Err(format!("want number {}, got {}", request.from + i as u64, header.number));
                }
                if i > 0 && header.parent_hash != headers[i - 1].hash() {
                    return Err(format!("broken link at {}", header.number));
                }
            }
            Ok(())
        };
        let (tail, end) = (inner.header_link.tail, inner.header_link.last);
        let check_tail = || match (tail, headers.last()) {
            (Some(tail), Some(last)) if last.number == end && last.hash() != tail => {
                Err("range does not end at the announced head".to_string())
            }
            _ => Ok(()),
        };
        if let Err(reason) = check().and_then(|()| check_tail()) {
            pool.tasks.insert(request.from, request.count);
            pool.fail(peer);
            return Err(DownloadError::InvalidHeader(reason));
        }
        let delivered = headers.len();
        inner.header_results.insert(
            request.from,
            HeaderRange {
                peer: peer.to_string(),
                headers,
            },
        );
        match inner.link_headers() {
            Some(rejected) if rejected == peer => {
                Err(DownloadError::InvalidHeader("range does not link to its parent".into()))
            }
            _ => {
                inner.headers.fails.remove(peer);
                Ok(delivered)
            }
        }
    }

    /// Accept block bodies matching the reserved headers in order.
    pub fn deliver_bodies(&self, peer: &PeerConnection, bodies: Vec<BlockBody>) -> Result<usize, DownloadError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let request = inner
            .bodies
            .pend
            .remove(peer.id())
            .ok_or(DownloadError::NoFetchesPending)?;

        let delivered = bodies.len();
        let mut headers = request.headers.into_iter();
        let mut accepted = 0;
        let mut failure = None;
        for body in bodies {
            let Some(header) = headers.next() else {
                break;
            };
            if transactions_root(&body.transactions) != header.transactions_root
                || compute_uncle_hash(&body.uncles) != header.uncle_hash
            {
                inner.bodies.tasks.insert(header.number, header);
                failure = Some(DownloadError::InvalidBody);
                break;
            }
            if let Some(result) = inner.results.get_mut(&header.number) {
                result.body = body;
                result.need_body = false;
            }
            accepted += 1;
        }
        let rest: Vec<Header> = headers.collect();
        inner.bodies.requeue(peer, rest, failure.is_none());
        finish(&mut inner.bodies, peer.id(), accepted, delivered, failure)
    }

    /// Accept receipts matching the reserved headers in order.
    pub fn deliver_receipts(
        &self,
        peer: &PeerConnection,
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<usize, DownloadError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let request = inner
            .receipts
            .pend
            .remove(peer.id())
            .ok_or(DownloadError::NoFetchesPending)?;

        let delivered = receipts.len();
        let mut headers = request.headers.into_iter();
        let mut accepted = 0;
        let mut failure = None;
        for list in receipts {
            let Some(header) = headers.next() else {
                break;
            };
            if receipts_root(&list) != header.receipts_root {
                inner.receipts.tasks.insert(header.number, header);
                failure = Some(DownloadError::InvalidReceipt);
                break;
            }
            if let Some(result) = inner.results.get_mut(&header.number) {
                result.receipts = list;
                result.need_receipts = false;
            }
            accepted += 1;
        }
        let rest: Vec<Header> = headers.collect();
        inner.receipts.requeue(peer, rest, failure.is_none());
        finish(&mut inner.receipts, peer.id(), accepted, delivered, failure)
    }

    /// Take all delivered header ranges in block order.
    pub fn take_headers(&self) -> Vec<Header> {
        let mut inner = self.inner.lock();
        std::mem::take(&mut inner.header_results)
            .into_values()
            .flat_map(|range| range.headers)
            .collect()
    }

    /// Drain the completed results at the front of the queue, in block order.
    pub fn results(&self) -> Vec<FetchResult> {
        let mut inner = self.inner.lock();
        let mut done = Vec::new();
        while let Some(entry) = inner.results.first_entry() {
            if !entry.get().done() {
                break;
            }
            done.push(entry.remove());
        }
        done
    }

    /// Number of blocks still waiting for bodies or receipts.
    pub fn incomplete(&self) -> usize {
        self.inner.lock().results.values().filter(|r| !r.done()).count()
    }
}

impl Inner {
    /// Extend the linked prefix over delivered ranges. A range not chaining
    /// onto the prefix goes back to the pool and counts against its
    /// deliverer, whose id is returned.
    fn link_headers(&mut self) -> Option<String> {
        let link = &mut self.header_link;
        while let Some(range) = self.header_results.get(&link.next) {
            let (Some(first), Some(last)) = (range.headers.first(), range.headers.last()) else {
                return None;
            };
            if first.parent_hash != link.parent {
                let from = link.next;
                let range = self.header_results.remove(&from)?;
                self.headers.tasks.insert(from, range.headers.len() as u64);
                let fails = self.headers.fail(&range.peer);
                debug!(peer = %range.peer, from, fails, "header range does not link to its parent");
                return Some(range.peer);
            }
            link.parent = last.hash();
            link.next = last.number + 1;
        }
        None
    }
}

fn finish(
    pool: &mut Pool<Header>,
    peer: &str,
    accepted: usize,
    delivered: usize,
    failure: Option<DownloadError>,
) -> Result<usize, DownloadError> {
    if let Some(err) = failure {
        pool.fail(peer);
        return Err(err);
    }
    if accepted == 0 {
        let fails = pool.fail(peer);
        trace!(peer, delivered, fails, "peer delivered nothing");
        return Ok(0);
    }
    pool.fails.remove(peer);
    Ok(accepted)
}
