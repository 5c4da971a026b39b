//! In-process event plumbing shared by the chain, the downloader and the miner.
//!
//! A [`Feed`] fans values out to any number of subscribers, each with its own
//! unbounded queue, so every subscriber observes every value in send order.
//! A [`TypeMux`] adds a terminal `stop` on top: once stopped, posting fails and
//! every subscription observes end-of-stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MuxError {
    #[error("event: posted to a stopped mux")]
    Stopped,
}

struct FeedInner<T> {
    subs: Mutex<Vec<(u64, mpsc::UnboundedSender<T>)>>,
    next_id: AtomicU64,
}

/// One-to-many event fan-out with per-subscriber ordering.
pub struct Feed<T> {
    inner: Arc<FeedInner<T>>,
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Feed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Feed<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FeedInner {
                subs: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a new subscriber. Values sent before this call are not seen.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subs.lock().push((id, tx));
        Subscription {
            id,
            rx,
            feed: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `value` to every live subscriber and return how many received it.
    pub fn send(&self, value: T) -> usize {
        let mut subs = self.inner.subs.lock();
        subs.retain(|(_, tx)| !tx.is_closed());
        let mut delivered = 0;
        for (_, tx) in subs.iter() {
            if tx.send(value.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.inner.subs.lock();
        subs.retain(|(_, tx)| !tx.is_closed());
        subs.len()
    }

    /// Drop every subscriber; pending values are still drained by receivers.
    fn close_all(&self) {
        self.inner.subs.lock().clear();
    }
}

/// Receiving end of a [`Feed`] or [`TypeMux`] subscription.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    feed: Weak<FeedInner<T>>,
}

impl<T> Subscription<T> {
    /// Wait for the next value. `None` means the source was stopped or this
    /// subscription was unsubscribed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Detach from the source. Queued values are discarded.
    pub fn unsubscribe(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.subs.lock().retain(|(id, _)| *id != self.id);
        }
        self.feed = Weak::new();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    /// Whether the source can still deliver to this subscription.
    pub fn is_closed(&self) -> bool {
        match self.feed.upgrade() {
            Some(feed) => !feed.subs.lock().iter().any(|(id, _)| *id == self.id),
            None => true,
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.subs.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Stoppable event multiplexer: the downloader posts sync lifecycle events on
/// it and independent consumers (the miner, the sync status API) subscribe.
pub struct TypeMux<T> {
    feed: Feed<T>,
    stopped: AtomicBool,
}

impl<T: Clone + Send + 'static> Default for TypeMux<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> TypeMux<T> {
    pub fn new() -> Self {
        Self {
            feed: Feed::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Subscribe to future events. Subscribing to a stopped mux yields an
    /// already closed subscription.
    pub fn subscribe(&self) -> Subscription<T> {
        let mut sub = self.feed.subscribe();
        if self.stopped.load(Ordering::Acquire) {
            sub.unsubscribe();
        }
        sub
    }

    /// Post an event to all current subscribers, in order.
    pub fn post(&self, event: T) -> Result<(), MuxError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(MuxError::Stopped);
        }
        self.feed.send(event);
        Ok(())
    }

    /// Close every subscription. Further posts fail with [`MuxError::Stopped`].
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.feed.close_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
