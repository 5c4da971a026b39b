use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use chain::{BlockChain, Genesis, Header, MemoryChain};
use consensus::{Ethash, RewardSchedule};
use downloader::DownloaderEvent;
use event::TypeMux;
use forks::ChainConfig;
use miner::{Backend, Config, Miner, MinerError};
use txpool::{MemoryPool, PoolConfig, TxPool};

const ETHERBASE: Address = Address::new([0x12; 20]);

struct TestBackend {
    chain: Arc<MemoryChain>,
    pool: Arc<MemoryPool>,
}

impl Backend for TestBackend {
    fn block_chain(&self) -> Arc<dyn BlockChain> {
        self.chain.clone()
    }

    fn tx_pool(&self) -> Arc<dyn TxPool> {
        self.pool.clone()
    }
}

struct Harness {
    miner: Miner,
    mux: Arc<TypeMux<DownloaderEvent>>,
    backend: TestBackend,
}

fn create_miner() -> Harness {
    let config = Arc::new(ChainConfig::default());
    let chain = Arc::new(MemoryChain::new(config.clone(), &Genesis::default()));
    let pool = Arc::new(MemoryPool::new(PoolConfig::default(), chain.clone()));
    let backend = TestBackend { chain, pool };
    let mux = Arc::new(TypeMux::new());
    // Seals never arrive, so the chain stays put while mining is toggled.
    let engine = Arc::new(Ethash::new_fake_delayer(
        RewardSchedule::default(),
        Duration::from_secs(3600),
    ));
    let miner = Miner::new(
        &backend,
        Config {
            etherbase: ETHERBASE,
            ..Config::default()
        },
        config,
        &mux,
        engine,
        None,
    );
    Harness { miner, mux, backend }
}

fn head() -> Header {
    Header::default()
}

async fn wait_for_mining_state(miner: &Miner, mining: bool) {
    for _ in 0..100 {
        if miner.mining() == mining {
            // Give the update loop a chance to act on anything still queued.
            tokio::time::sleep(Duration::from_millis(20)).await;
            if miner.mining() == mining {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("mining state never became {mining}");
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_done_releases_the_gate_for_good() {
    let Harness { miner, mux, .. } = create_miner();
    miner.start();
    wait_for_mining_state(&miner, true).await;

    mux.post(DownloaderEvent::Start).unwrap();
    wait_for_mining_state(&miner, false).await;
    mux.post(DownloaderEvent::Done(head())).unwrap();
    wait_for_mining_state(&miner, true).await;

    // After a successful sync, downloader events no longer stop mining.
    mux.post(DownloaderEvent::Start).unwrap();
    wait_for_mining_state(&miner, true).await;
    mux.post(DownloaderEvent::Failed("timeout".into())).unwrap();
    wait_for_mining_state(&miner, true).await;
    miner.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_sync_keeps_the_gate_armed() {
    let Harness { miner, mux, .. } = create_miner();
    miner.start();
    wait_for_mining_state(&miner, true).await;

    mux.post(DownloaderEvent::Start).unwrap();
    wait_for_mining_state(&miner, false).await;
    mux.post(DownloaderEvent::Failed("stalled".into())).unwrap();
    wait_for_mining_state(&miner, true).await;

    // A failure does not disarm the gate; the next start suspends again.
    mux.post(DownloaderEvent::Start).unwrap();
    wait_for_mining_state(&miner, false).await;
    mux.post(DownloaderEvent::Done(head())).unwrap();
    wait_for_mining_state(&miner, true).await;

    mux.post(DownloaderEvent::Start).unwrap();
    wait_for_mining_state(&miner, true).await;
    miner.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_during_sync_is_honoured_after_sync() {
    let Harness { miner, mux, .. } = create_miner();
    miner.start();
    wait_for_mining_state(&miner, true).await;

    mux.post(DownloaderEvent::Start).unwrap();
    wait_for_mining_state(&miner, false).await;
    miner.stop();
    mux.post(DownloaderEvent::Done(head())).unwrap();
    wait_for_mining_state(&miner, false).await;

    miner.start();
    wait_for_mining_state(&miner, true).await;
    miner.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn start_while_downloading_waits_for_sync() {
    let Harness { miner, mux, .. } = create_miner();
    mux.post(DownloaderEvent::Start).unwrap();
    // Let the update loop see the sync before asking to mine.
    tokio::time::sleep(Duration::from_millis(50)).await;
    miner.start();
    wait_for_mining_state(&miner, false).await;

    mux.post(DownloaderEvent::Done(head())).unwrap();
    wait_for_mining_state(&miner, true).await;
    miner.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn start_stop_and_close() {
    let Harness { miner, .. } = create_miner();
    miner.start();
    wait_for_mining_state(&miner, true).await;
    miner.stop();
    wait_for_mining_state(&miner, false).await;

    miner.start();
    wait_for_mining_state(&miner, true).await;
    miner.close().await;
    assert!(!miner.mining());
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_block_uses_configured_etherbase_and_extra() {
    let Harness { miner, backend, .. } = create_miner();
    assert!(matches!(
        miner.set_extra(vec![0u8; 33]),
        Err(MinerError::ExtraTooLong { len: 33, max: 32 })
    ));
    miner.set_extra(b"r5".to_vec()).unwrap();
    let other = Address::new([0x34; 20]);
    miner.set_etherbase(other);
    miner.start();

    let mut pending = None;
    for _ in 0..100 {
        pending = miner.pending_block().filter(|b| b.header().coinbase == other);
        if pending.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let pending = pending.expect("pending block with new etherbase");
    assert_eq!(pending.header().extra_data, b"r5".to_vec());
    assert_eq!(pending.number(), backend.chain.current_block().number() + 1);
    assert!(pending.header().difficulty > U256::ZERO);
    miner.close().await;
}
