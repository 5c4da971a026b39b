use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{B256, U256};
use chain::{Block, BlockChain, ChainError, Genesis, Header, MemoryChain};
use downloader::{
    Config, DownloadError, Downloader, DownloaderEvent, LightPeer, Peer, ResponseSink, SyncMode,
};
use event::TypeMux;
use forks::ChainConfig;
use parking_lot::Mutex;
use protocols::Request;
use sync::{ChainSyncOp, ChainSyncer, DownloaderBackend, PeerHead, SyncBackend, SyncConfig};
use tokio::sync::Notify;

struct RecordingBackend {
    chain: Arc<MemoryChain>,
    peers: Mutex<Vec<PeerHead>>,
    ops: Mutex<Vec<ChainSyncOp>>,
    log: Arc<Mutex<Vec<&'static str>>>,
    /// When set, syncs hang until the backend is terminated.
    hang: bool,
    released: Notify,
}

impl RecordingBackend {
    fn new(chain: Arc<MemoryChain>, hang: bool) -> Arc<Self> {
        Arc::new(Self {
            chain,
            peers: Mutex::new(Vec::new()),
            ops: Mutex::new(Vec::new()),
            log: Arc::new(Mutex::new(Vec::new())),
            hang,
            released: Notify::new(),
        })
    }

    fn add_peer(&self, id: &str, td: u64) {
        self.peers.lock().push(PeerHead {
            id: id.to_string(),
            head: B256::repeat_byte(0x42),
            td: U256::from(td),
        });
    }

    fn op_count(&self) -> usize {
        self.ops.lock().len()
    }
}

impl SyncBackend for RecordingBackend {
    fn peers(&self) -> Vec<PeerHead> {
        self.peers.lock().clone()
    }

    async fn legacy_sync(&self, op: &ChainSyncOp, _: Option<U256>) -> Result<(), DownloadError> {
        self.ops.lock().push(op.clone());
        if self.hang {
            self.released.notified().await;
            self.log.lock().push("sync returned");
            return Err(DownloadError::Cancelled);
        }
        Ok(())
    }

    fn terminate(&self) {
        // A child of genesis must already be refused when the downloader goes down.
        let genesis = self.chain.genesis();
        let child = Block::new(
            Header {
                parent_hash: genesis.hash(),
                number: 1,
                difficulty: genesis.header().difficulty,
                gas_limit: genesis.header().gas_limit,
                state_root: genesis.header().state_root,
                timestamp: 10,
                ..Default::default()
            },
            Vec::new(),
            Vec::new(),
            &[],
        );
        if let Err(ChainError::InsertStopped) = self.chain.insert_chain(vec![child]) {
            self.log.lock().push("insert stopped");
        }
        self.log.lock().push("terminate");
        self.released.notify_one();
    }

    fn broadcast_block(&self, _: Arc<Block>) {}
}

fn chain(td: u64) -> Arc<MemoryChain> {
    let genesis = Genesis {
        difficulty: U256::from(td),
        ..Genesis::default()
    };
    Arc::new(MemoryChain::new(Arc::new(ChainConfig::default()), &genesis))
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn force_timer_lowers_peer_threshold() {
    let chain = chain(20);
    let backend = RecordingBackend::new(chain.clone(), false);
    backend.add_peer("lonely", 50);
    let handle = ChainSyncer::new(SyncConfig::default(), chain, backend.clone()).spawn();

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(backend.op_count(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(backend.op_count(), 1);
    assert_eq!(backend.ops.lock()[0].mode, SyncMode::Full);

    // the timer is re-armed once the cycle ends
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(backend.op_count(), 2);

    handle.stop().await;
}

#[tokio::test]
async fn peer_event_starts_sync_when_threshold_met() {
    let chain = chain(20);
    let backend = RecordingBackend::new(chain.clone(), false);
    let config = SyncConfig {
        min_sync_peers: 2,
        ..SyncConfig::default()
    };
    let handle = ChainSyncer::new(config, chain, backend.clone()).spawn();

    backend.add_peer("a", 30);
    handle.notify_peer_event();
    settle().await;
    assert_eq!(backend.op_count(), 0);

    backend.add_peer("b", 90);
    handle.notify_peer_event();
    settle().await;
    let ops = backend.ops.lock().clone();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].peer, "b");
    assert_eq!(ops[0].td, U256::from(90));

    handle.stop().await;
}

#[tokio::test]
async fn shutdown_stops_inserts_before_terminating() {
    let chain = chain(20);
    let backend = RecordingBackend::new(chain.clone(), true);
    backend.add_peer("slow", 50);
    let config = SyncConfig {
        min_sync_peers: 1,
        ..SyncConfig::default()
    };
    let handle = ChainSyncer::new(config, chain, backend.clone()).spawn();
    while backend.op_count() == 0 {
        tokio::task::yield_now().await;
    }

    handle.stop().await;
    assert_eq!(*backend.log.lock(), vec!["insert stopped", "terminate", "sync returned"]);
}

/// Announces a heavy head but cannot serve anything.
struct UnreachablePeer;

impl LightPeer for UnreachablePeer {
    fn head(&self) -> (B256, U256) {
        (B256::repeat_byte(0x42), U256::from(u64::MAX))
    }

    fn request_headers_by_hash(
        &self,
        _: B256,
        _: usize,
        _: usize,
        _: bool,
        _: ResponseSink,
    ) -> Result<Request, protocols::Error> {
        Err(protocols::Error::PeerClosed)
    }

    fn request_headers_by_number(
        &self,
        _: u64,
        _: usize,
        _: usize,
        _: bool,
        _: ResponseSink,
    ) -> Result<Request, protocols::Error> {
        Err(protocols::Error::PeerClosed)
    }
}

impl Peer for UnreachablePeer {
    fn request_bodies(&self, _: Vec<B256>, _: ResponseSink) -> Result<Request, protocols::Error> {
        Err(protocols::Error::PeerClosed)
    }

    fn request_receipts(&self, _: Vec<B256>, _: ResponseSink) -> Result<Request, protocols::Error> {
        Err(protocols::Error::PeerClosed)
    }
}

#[tokio::test(start_paused = true)]
async fn registered_peer_starts_sync_before_force_timer() {
    let chain = chain(20);
    let mux = Arc::new(TypeMux::new());
    let mut events = mux.subscribe();
    let downloader = Arc::new(Downloader::new(Config::default(), chain.clone(), mux.clone(), None));
    let config = SyncConfig {
        min_sync_peers: 1,
        ..SyncConfig::default()
    };
    let backend = Arc::new(DownloaderBackend::new(downloader.clone(), None));
    let handle = ChainSyncer::new(config, chain, backend).spawn();
    settle().await;

    downloader.register_peer("fresh", 68, Arc::new(UnreachablePeer)).unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no sync started on peer registration")
        .unwrap();
    assert!(matches!(event, DownloaderEvent::Start));

    handle.stop().await;
}
