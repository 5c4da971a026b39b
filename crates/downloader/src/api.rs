//! Sync status notifications for RPC style subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use event::{Subscription, TypeMux};
use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::downloader::{Downloader, SyncProgress};
use crate::events::DownloaderEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncingResult {
    pub syncing: bool,
    pub status: SyncProgress,
}

/// Either the progress of a running sync or `false` once it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Syncing(SyncingResult),
    Done,
}

impl Serialize for SyncStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Syncing(result) => result.serialize(serializer),
            Self::Done => serializer.serialize_bool(false),
        }
    }
}

struct Install {
    id: u64,
    statuses: mpsc::Sender<SyncStatus>,
}

struct Uninstall {
    id: u64,
    done: oneshot::Sender<()>,
}

/// Relays downloader lifecycle events to sync status subscribers.
pub struct DownloaderApi {
    install: mpsc::UnboundedSender<Install>,
    uninstall: mpsc::UnboundedSender<Uninstall>,
    next_id: AtomicU64,
}

impl DownloaderApi {
    /// Start the relay on the current runtime. It ends when the mux stops.
    pub fn new(downloader: Arc<Downloader>, mux: Arc<TypeMux<DownloaderEvent>>) -> Self {
        let (install, install_rx) = mpsc::unbounded_channel();
        let (uninstall, uninstall_rx) = mpsc::unbounded_channel();
        tokio::spawn(event_loop(downloader, mux.subscribe(), install_rx, uninstall_rx));
        Self {
            install,
            uninstall,
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribe to sync status changes.
    pub fn subscribe_sync_status(&self) -> SyncStatusSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (statuses, rx) = mpsc::channel(1);
        // A closed relay simply never reports anything.
        let _ = self.install.send(Install { id, statuses });
        SyncStatusSubscription {
            id,
            statuses: rx,
            uninstall: self.uninstall.clone(),
        }
    }
}

async fn event_loop(
    downloader: Arc<Downloader>,
    mut events: Subscription<DownloaderEvent>,
    mut install: mpsc::UnboundedReceiver<Install>,
    mut uninstall: mpsc::UnboundedReceiver<Uninstall>,
) {
    let mut subs: HashMap<u64, mpsc::Sender<SyncStatus>> = HashMap::new();

    loop {
        tokio::select! {
            Some(req) = install.recv() => {
                subs.insert(req.id, req.statuses);
            }
            Some(req) = uninstall.recv() => {
                subs.remove(&req.id);
                let _ = req.done.send(());
            }
            event = events.recv() => {
                let Some(event) = event else {
                    trace!("downloader event mux stopped, closing sync status relay");
                    return;
                };
                let status = match event {
                    DownloaderEvent::Start => SyncStatus::Syncing(SyncingResult {
                        syncing: true,
                        status: downloader.progress(),
                    }),
                    DownloaderEvent::Done(_) | DownloaderEvent::Failed(_) => SyncStatus::Done,
                };
                let mut gone = Vec::new();
                for (id, statuses) in &subs {
                    // A subscriber that is unsubscribing keeps draining, so this cannot stall.
                    if statuses.send(status).await.is_err() {
                        gone.push(*id);
                    }
                }
                for id in gone {
                    subs.remove(&id);
                }
            }
        }
    }
}

pub struct SyncStatusSubscription {
    id: u64,
    statuses: mpsc::Receiver<SyncStatus>,
    uninstall: mpsc::UnboundedSender<Uninstall>,
}

impl SyncStatusSubscription {
    /// Next status change; `None` once the relay shut down.
    pub async fn recv(&mut self) -> Option<SyncStatus> {
        self.statuses.recv().await
    }

    /// Detach from the relay, draining statuses it is still pushing.
    pub async fn unsubscribe(mut self) {
        let (done, mut confirmed) = oneshot::channel();
        if self.uninstall.send(Uninstall { id: self.id, done }).is_err() {
            return;
        }
        loop {
            tokio::select! {
                _ = &mut confirmed => return,
                status = self.statuses.recv() => {
                    if status.is_none() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_serializes_as_false() {
        assert_eq!(serde_json::to_string(&SyncStatus::Done).unwrap(), "false");
    }

    #[test]
    fn syncing_serializes_progress() {
        let status = SyncStatus::Syncing(SyncingResult {
            syncing: true,
            status: SyncProgress {
                starting_block: 1,
                current_block: 5,
                highest_block: 9,
            },
        });
        assert_eq!(
            serde_json::to_string(&status).unwrap(),
            r#"{"syncing":true,"status":{"startingBlock":1,"currentBlock":5,"highestBlock":9}}"#
        );
    }
}
