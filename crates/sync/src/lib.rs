//! Chain sync decision loop: decides when to sync and against which peer, and
//! runs one legacy sync cycle at a time through the downloader.

mod handler;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy_primitives::{B256, U256};
use chain::{Block, BlockChain};
use downloader::{DownloadError, PeeringEvent, SyncMode};
use event::Subscription;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

pub use handler::{BroadcastFn, DownloaderBackend};

/// Peers needed before a sync starts on its own.
pub const DEFAULT_MIN_SYNC_PEERS: usize = 5;
/// Interval after which a sync is forced even with few peers.
pub const FORCE_SYNC_CYCLE: Duration = Duration::from_secs(10);
/// Transactions are accepted once the head is at most this old.
pub const ACCEPT_TXS_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const MERGE_WARN_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_peers: usize,
    pub min_sync_peers: usize,
    pub force_sync_cycle: Duration,
    /// Block number the head must reach before network transactions are accepted.
    pub checkpoint: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_peers: 50,
            min_sync_peers: DEFAULT_MIN_SYNC_PEERS,
            force_sync_cycle: FORCE_SYNC_CYCLE,
            checkpoint: 0,
        }
    }
}

/// Head announced by a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHead {
    pub id: String,
    pub head: B256,
    pub td: U256,
}

/// A single sync cycle: which peer, up to which head, in which mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSyncOp {
    pub mode: SyncMode,
    pub peer: String,
    pub td: U256,
    pub head: B256,
}

/// What the chain syncer needs from the protocol handler.
pub trait SyncBackend: Send + Sync + 'static {
    /// Connected peers with their announced heads.
    fn peers(&self) -> Vec<PeerHead>;

    fn legacy_sync(
        &self,
        op: &ChainSyncOp,
        ttd: Option<U256>,
    ) -> impl Future<Output = Result<(), DownloadError>> + Send;

    /// Abort the running sync and refuse new ones.
    fn terminate(&self);

    /// Announce a freshly synced head to peers.
    fn broadcast_block(&self, block: Arc<Block>);

    /// Joins and departures of peers. Without a feed the loop only wakes on
    /// [`SyncHandle::notify_peer_event`].
    fn subscribe_peer_events(&self) -> Option<Subscription<PeeringEvent>> {
        None
    }
}

struct Shared<B> {
    chain: Arc<dyn BlockChain>,
    backend: Arc<B>,
    snap_sync: AtomicBool,
    accept_txs: AtomicBool,
    checkpoint: u64,
}

impl<B: SyncBackend> Shared<B> {
    async fn do_sync(&self, op: ChainSyncOp) -> Result<(), DownloadError> {
        let config = self.chain.config();
        let ttd = if config.terminal_total_difficulty_passed {
            None
        } else {
            config.terminal_total_difficulty
        };
        self.backend.legacy_sync(&op, ttd).await?;

        if self.snap_sync.swap(false, Ordering::AcqRel) {
            info!("snap sync complete, auto disabling");
        }
        let head = self.chain.current_block();
        if head.number() >= self.checkpoint {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            let horizon = now.saturating_sub(ACCEPT_TXS_WINDOW).as_secs();
            if head.header().timestamp >= horizon {
                self.accept_txs.store(true, Ordering::Release);
            }
        }
        if head.number() > 0 {
            if let Some(block) = self.chain.get_block(&head.hash(), head.number()) {
                self.backend.broadcast_block(block);
            }
        }
        Ok(())
    }
}

/// Starts sync cycles when peers join, when the force timer fires and when
/// a previous cycle ends.
pub struct ChainSyncer<B> {
    config: SyncConfig,
    shared: Arc<Shared<B>>,
    forced: bool,
    running: bool,
    warned: Option<Instant>,
}

impl<B: SyncBackend> ChainSyncer<B> {
    pub fn new(config: SyncConfig, chain: Arc<dyn BlockChain>, backend: Arc<B>) -> Self {
        let checkpoint = config.checkpoint;
        Self {
            config,
            shared: Arc::new(Shared {
                chain,
                backend,
                snap_sync: AtomicBool::new(false),
                accept_txs: AtomicBool::new(false),
                checkpoint,
            }),
            forced: false,
            running: false,
            warned: None,
        }
    }

    /// Start in snap mode until the first successful cycle.
    pub fn with_snap_sync(self, enabled: bool) -> Self {
        self.shared.snap_sync.store(enabled, Ordering::Release);
        self
    }

    pub fn snap_syncing(&self) -> bool {
        self.shared.snap_sync.load(Ordering::Acquire)
    }

    pub fn accepts_txs(&self) -> bool {
        self.shared.accept_txs.load(Ordering::Acquire)
    }

    /// Mark that the force timer fired since the last cycle.
    pub fn set_forced(&mut self, forced: bool) {
        self.forced = forced;
    }

    /// Decide whether a sync cycle should start now.
    pub fn next_sync_op(&mut self) -> Option<ChainSyncOp> {
        if self.running {
            return None;
        }
        // Once past the merge, the legacy sync path stays disabled.
        if self.shared.chain.config().terminal_total_difficulty_passed {
            return None;
        }
        let min_peers = if self.forced {
            1
        } else {
            self.config.min_sync_peers.min(self.config.max_peers)
        };
        let peers = self.shared.backend.peers();
        if peers.len() < min_peers {
            return None;
        }
        let best = peers.into_iter().reduce(|best, p| if p.td > best.td { p } else { best })?;

        let (mode, our_td) = self.mode_and_local_td();
        if best.td <= our_td {
            let ttd = self.shared.chain.config().terminal_total_difficulty;
            if ttd.is_some_and(|ttd| our_td >= ttd) {
                self.warn_post_merge();
            }
            return None;
        }
        Some(ChainSyncOp {
            mode,
            peer: best.id,
            td: best.td,
            head: best.head,
        })
    }

    fn mode_and_local_td(&self) -> (SyncMode, U256) {
        let chain = &self.shared.chain;
        let snap_td = || {
            let block = chain.current_snap_block();
            chain.get_td(&block.hash(), block.number()).unwrap_or_default()
        };
        if self.shared.snap_sync.load(Ordering::Acquire) {
            return (SyncMode::Snap, snap_td());
        }
        let head = chain.current_block();
        if chain.last_pivot_number().is_some_and(|pivot| head.number() < pivot) {
            return (SyncMode::Snap, snap_td());
        }
        if chain.state_at(head.header().state_root).is_err() {
            info!("reenabled snap sync as chain is stateless");
            return (SyncMode::Snap, snap_td());
        }
        (
            SyncMode::Full,
            chain.get_td(&head.hash(), head.number()).unwrap_or_default(),
        )
    }

    fn warn_post_merge(&mut self) {
        if self.warned.is_some_and(|at| at.elapsed() <= MERGE_WARN_INTERVAL) {
            return;
        }
        warn!("local chain is post-merge, waiting for beacon client sync switch-over");
        self.warned = Some(Instant::now());
    }

    /// Run the decision loop on the current runtime.
    pub fn spawn(self) -> SyncHandle<B> {
        let (events_tx, events) = mpsc::channel(1);
        let (quit_tx, quit) = oneshot::channel();
        let shared = self.shared.clone();
        let peering = shared.backend.subscribe_peer_events();
        let task = tokio::spawn(self.run(events, peering, quit));
        SyncHandle {
            peer_events: events_tx,
            quit: Some(quit_tx),
            task: Some(task),
            shared,
        }
    }

    async fn run(
        mut self,
        mut peer_events: mpsc::Receiver<()>,
        mut peering: Option<Subscription<PeeringEvent>>,
        mut quit: oneshot::Receiver<()>,
    ) {
        let (done_tx, mut done) = mpsc::channel::<Result<(), DownloadError>>(1);
        let force = time::sleep(self.config.force_sync_cycle);
        tokio::pin!(force);

        loop {
            if let Some(op) = self.next_sync_op() {
                self.start_sync(op, done_tx.clone());
            }
            tokio::select! {
                Some(()) = peer_events.recv() => {}
                Some(event) = next_peering(&mut peering) => {
                    trace!(peer = %event.peer.id(), join = event.join, "peer set changed");
                }
                Some(result) = done.recv() => {
                    self.running = false;
                    self.forced = false;
                    force.as_mut().reset(Instant::now() + self.config.force_sync_cycle);
                    if matches!(result, Err(DownloadError::MergeTransition)) {
                        self.warn_post_merge();
                    }
                }
                () = &mut force, if !self.forced => {
                    self.forced = true;
                }
                _ = &mut quit => {
                    // Chain inserts must stop before the downloader terminates,
                    // since termination waits for in-flight inserts.
                    self.shared.chain.stop_insert();
                    self.shared.backend.terminate();
                    if self.running {
                        done.recv().await;
                    }
                    debug!("chain syncer stopped");
                    return;
                }
            }
        }
    }

    fn start_sync(&mut self, op: ChainSyncOp, done: mpsc::Sender<Result<(), DownloadError>>) {
        debug!(peer = %op.peer, td = %op.td, head = %op.head, mode = ?op.mode, "starting sync cycle");
        self.running = true;
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = shared.do_sync(op).await;
            let _ = done.send(result).await;
        });
    }
}

async fn next_peering(peering: &mut Option<Subscription<PeeringEvent>>) -> Option<PeeringEvent> {
    match peering {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

/// Control handle of a running [`ChainSyncer`].
pub struct SyncHandle<B> {
    peer_events: mpsc::Sender<()>,
    quit: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    shared: Arc<Shared<B>>,
}

impl<B: SyncBackend> SyncHandle<B> {
    /// Wake the loop after a peer joined, left or announced a new head.
    pub fn notify_peer_event(&self) {
        // A full channel already holds a pending wake-up.
        let _ = self.peer_events.try_send(());
    }

    pub fn snap_syncing(&self) -> bool {
        self.shared.snap_sync.load(Ordering::Acquire)
    }

    pub fn accepts_txs(&self) -> bool {
        self.shared.accept_txs.load(Ordering::Acquire)
    }

    /// Stop the loop, waiting for a running cycle to wind down.
    pub async fn stop(mut self) {
        if let Some(quit) = self.quit.take() {
            let _ = quit.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(%err, "chain syncer task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain::{Genesis, MemoryChain};
    use forks::ChainConfig;
    use parking_lot::Mutex;

    pub(crate) struct FakeBackend {
        pub peers: Mutex<Vec<PeerHead>>,
        pub ops: Mutex<Vec<ChainSyncOp>>,
    }

    impl FakeBackend {
        fn with_tds(tds: &[u64]) -> Arc<Self> {
            let peers = tds
                .iter()
                .enumerate()
                .map(|(i, td)| PeerHead {
                    id: format!("peer-{i}"),
                    head: B256::repeat_byte(i as u8 + 1),
                    td: U256::from(*td),
                })
                .collect();
            Arc::new(Self {
                peers: Mutex::new(peers),
                ops: Mutex::new(Vec::new()),
            })
        }
    }

    impl SyncBackend for FakeBackend {
        fn peers(&self) -> Vec<PeerHead> {
            self.peers.lock().clone()
        }

        async fn legacy_sync(&self, op: &ChainSyncOp, _: Option<U256>) -> Result<(), DownloadError> {
            self.ops.lock().push(op.clone());
            Ok(())
        }

        fn terminate(&self) {}

        fn broadcast_block(&self, _: Arc<Block>) {}
    }

    fn chain_with_td(td: u64, config: ChainConfig) -> Arc<MemoryChain> {
        let genesis = Genesis {
            difficulty: U256::from(td),
            ..Genesis::default()
        };
        Arc::new(MemoryChain::new(Arc::new(config), &genesis))
    }

    fn syncer(local_td: u64, tds: &[u64], min_peers: usize) -> ChainSyncer<FakeBackend> {
        let config = SyncConfig {
            min_sync_peers: min_peers,
            ..SyncConfig::default()
        };
        ChainSyncer::new(config, chain_with_td(local_td, ChainConfig::default()), FakeBackend::with_tds(tds))
    }

    #[test]
    fn selects_peer_with_highest_td() {
        let mut cs = syncer(20, &[10, 50, 30], 3);
        let op = cs.next_sync_op().unwrap();
        assert_eq!(op.peer, "peer-1");
        assert_eq!(op.td, U256::from(50));
        assert_eq!(op.head, B256::repeat_byte(2));
        assert_eq!(op.mode, SyncMode::Full);
    }

    #[test]
    fn no_op_when_ahead_of_every_peer() {
        let mut cs = syncer(60, &[10, 50, 30], 3);
        assert!(cs.next_sync_op().is_none());
    }

    #[test]
    fn equal_td_is_in_sync() {
        let mut cs = syncer(50, &[50], 1);
        assert!(cs.next_sync_op().is_none());
    }

    #[test]
    fn too_few_peers_wait_until_forced() {
        let mut cs = syncer(20, &[10, 50, 30], DEFAULT_MIN_SYNC_PEERS);
        assert!(cs.next_sync_op().is_none());
        cs.set_forced(true);
        assert_eq!(cs.next_sync_op().unwrap().peer, "peer-1");
    }

    #[test]
    fn threshold_is_capped_by_max_peers() {
        let config = SyncConfig {
            max_peers: 2,
            ..SyncConfig::default()
        };
        let mut cs = ChainSyncer::new(
            config,
            chain_with_td(20, ChainConfig::default()),
            FakeBackend::with_tds(&[10, 50]),
        );
        assert!(cs.next_sync_op().is_some());
    }

    #[test]
    fn running_cycle_blocks_new_ops() {
        let mut cs = syncer(20, &[50], 1);
        cs.running = true;
        assert!(cs.next_sync_op().is_none());
    }

    #[test]
    fn passed_terminal_difficulty_disables_legacy_sync() {
        let config = ChainConfig {
            terminal_total_difficulty: Some(U256::from(100)),
            terminal_total_difficulty_passed: true,
            ..ChainConfig::default()
        };
        let mut cs = ChainSyncer::new(
            SyncConfig::default(),
            chain_with_td(20, config),
            FakeBackend::with_tds(&[500]),
        );
        cs.set_forced(true);
        assert!(cs.next_sync_op().is_none());
    }

    #[test]
    fn snap_flag_selects_snap_mode() {
        let mut cs = syncer(20, &[50], 1).with_snap_sync(true);
        assert_eq!(cs.next_sync_op().unwrap().mode, SyncMode::Snap);
    }

    #[test]
    fn head_below_pivot_selects_snap_mode() {
        let chain = chain_with_td(20, ChainConfig::default());
        chain.set_last_pivot_number(Some(64));
        let mut cs = ChainSyncer::new(
            SyncConfig {
                min_sync_peers: 1,
                ..SyncConfig::default()
            },
            chain,
            FakeBackend::with_tds(&[50]),
        );
        assert_eq!(cs.next_sync_op().unwrap().mode, SyncMode::Snap);
    }

    #[tokio::test]
    async fn successful_cycle_disables_snap_and_accepts_txs() {
        let backend = FakeBackend::with_tds(&[50]);
        let chain = chain_with_td(20, ChainConfig::default());
        let mut cs = ChainSyncer::new(
            SyncConfig {
                min_sync_peers: 1,
                ..SyncConfig::default()
            },
            chain,
            backend.clone(),
        )
        .with_snap_sync(true);

        let op = cs.next_sync_op().unwrap();
        cs.shared.do_sync(op).await.unwrap();

        assert!(!cs.snap_syncing());
        // genesis timestamp 0 is far older than the acceptance window
        assert!(!cs.accepts_txs());
        assert_eq!(backend.ops.lock().len(), 1);
    }
}
