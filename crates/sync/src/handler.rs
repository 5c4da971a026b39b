use std::sync::Arc;

use alloy_primitives::U256;
use chain::Block;
use downloader::{DownloadError, Downloader, LightPeer, PeeringEvent};
use event::Subscription;
use tracing::trace;

use crate::{ChainSyncOp, PeerHead, SyncBackend};

/// Propagates a block to connected peers.
pub type BroadcastFn = Arc<dyn Fn(&Block) + Send + Sync>;

/// [`SyncBackend`] over the downloader's own peer set.
pub struct DownloaderBackend {
    downloader: Arc<Downloader>,
    broadcast: Option<BroadcastFn>,
}

impl DownloaderBackend {
    pub fn new(downloader: Arc<Downloader>, broadcast: Option<BroadcastFn>) -> Self {
        Self { downloader, broadcast }
    }
}

impl SyncBackend for DownloaderBackend {
    fn peers(&self) -> Vec<PeerHead> {
        self.downloader
            .peers()
            .all_peers()
            .into_iter()
            .map(|p| {
                let (head, td) = p.peer().head();
                PeerHead {
                    id: p.id().to_string(),
                    head,
                    td,
                }
            })
            .collect()
    }

    async fn legacy_sync(&self, op: &ChainSyncOp, ttd: Option<U256>) -> Result<(), DownloadError> {
        self.downloader
            .legacy_sync(&op.peer, op.head, op.td, ttd, op.mode)
            .await
    }

    fn terminate(&self) {
        self.downloader.terminate();
    }

    fn broadcast_block(&self, block: Arc<Block>) {
        match &self.broadcast {
            Some(broadcast) => broadcast(&block),
            None => trace!(number = block.number(), "no peers to announce synced head to"),
        }
    }

    fn subscribe_peer_events(&self) -> Option<Subscription<PeeringEvent>> {
        Some(self.downloader.peers().subscribe_events())
    }
}
