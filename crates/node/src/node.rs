use std::future::Future;
use std::sync::Arc;

use alloy_primitives::U256;
use chain::{BlockChain, Genesis, MemoryChain};
use consensus::{Ethash, RewardSchedule};
use downloader::{Downloader, DownloaderApi, DownloaderEvent, SyncStatus, SyncStatusSubscription};
use event::TypeMux;
use miner::Miner;
use sync::{ChainSyncer, DownloaderBackend, SyncHandle};
use tracing::{debug, info};
use txpool::{MemoryPool, PoolConfig, TxPool};

use crate::config::RuntimeConfig;

/// Balance given to every prefunded genesis account: one million coins.
const PREFUND_BALANCE: u128 = 1_000_000 * 1_000_000_000_000_000_000;

struct DevBackend {
    chain: Arc<MemoryChain>,
    pool: Arc<MemoryPool>,
}

impl miner::Backend for DevBackend {
    fn block_chain(&self) -> Arc<dyn BlockChain> {
        self.chain.clone()
    }

    fn tx_pool(&self) -> Arc<dyn TxPool> {
        self.pool.clone()
    }
}

/// Running node: an in-memory chain sealed by an instant fake engine, with
/// the chain syncer standing by for peers.
pub struct Node {
    chain: Arc<MemoryChain>,
    mux: Arc<TypeMux<DownloaderEvent>>,
    miner: Miner,
    syncer: SyncHandle<DownloaderBackend>,
    sync_status: SyncStatusSubscription,
}

impl Node {
    /// Wire every subsystem on the current runtime.
    pub fn start(config: &RuntimeConfig) -> Self {
        let chain_config = Arc::new(config.chain.clone());
        let engine = Arc::new(Ethash::new_faker(RewardSchedule::default()));

        let genesis = config
            .prefund
            .iter()
            .fold(Genesis::default(), |g, addr| g.with_account(*addr, U256::from(PREFUND_BALANCE)));
        let chain = Arc::new(MemoryChain::new(chain_config.clone(), &genesis).with_finalizer(engine.finalizer()));
        let pool = Arc::new(MemoryPool::new(PoolConfig::default(), chain.clone()));
        let backend = DevBackend {
            chain: chain.clone(),
            pool,
        };

        let mux = Arc::new(TypeMux::new());
        let downloader = Arc::new(Downloader::new(
            downloader::Config::default(),
            chain.clone(),
            mux.clone(),
            None,
        ));
        let api = DownloaderApi::new(downloader.clone(), mux.clone());
        let sync_status = api.subscribe_sync_status();
        let syncer = ChainSyncer::new(
            config.sync.clone(),
            chain.clone(),
            Arc::new(DownloaderBackend::new(downloader, None)),
        )
        .spawn();

        let miner = Miner::new(&backend, config.miner.clone(), chain_config, &mux, engine, None);
        if config.mine {
            miner.start();
        }
        info!(
            chain_id = config.chain.chain_id,
            genesis = %chain.genesis().hash(),
            mine = config.mine,
            etherbase = %config.miner.etherbase,
            "node initialized"
        );
        Self {
            chain,
            mux,
            miner,
            syncer,
            sync_status,
        }
    }

    #[cfg(test)]
    pub fn chain(&self) -> &Arc<MemoryChain> {
        &self.chain
    }

    #[cfg(test)]
    pub fn miner(&self) -> &Miner {
        &self.miner
    }

    /// Report chain and sync progress until `shutdown` resolves, then stop.
    pub async fn run_until<F: Future<Output = ()>>(mut self, shutdown: F) {
        let mut heads = self.chain.subscribe_chain_head_event();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                Some(ev) = heads.recv() => {
                    debug!(number = ev.block.number(), hash = %ev.block.hash(), "chain head updated");
                }
                Some(status) = self.sync_status.recv() => match status {
                    SyncStatus::Syncing(progress) => info!(
                        current = progress.status.current_block,
                        highest = progress.status.highest_block,
                        "syncing"
                    ),
                    SyncStatus::Done => info!("sync finished"),
                },
                () = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }
        self.stop().await;
    }

    /// Chain inserts halt before the downloader terminates (both inside the
    /// syncer stop), then block production ends and the event mux closes.
    async fn stop(self) {
        self.syncer.stop().await;
        self.miner.close().await;
        self.sync_status.unsubscribe().await;
        self.mux.stop();
        info!("node stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alloy_primitives::Address;
    use forks::ChainConfig;
    use sync::SyncConfig;

    use super::*;

    fn config(mine: bool) -> RuntimeConfig {
        RuntimeConfig {
            mine,
            miner: miner::Config {
                etherbase: Address::repeat_byte(0x12),
                ..miner::Config::default()
            },
            chain: ChainConfig::default(),
            sync: SyncConfig::default(),
            prefund: vec![Address::repeat_byte(0x34)],
            log_level: "info".to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mines_on_top_of_prefunded_genesis_and_shuts_down() {
        let node = Node::start(&config(true));
        let chain = node.chain().clone();
        assert_eq!(
            chain.state_at(chain.genesis().header().state_root).unwrap().balance(&Address::repeat_byte(0x34)),
            U256::from(PREFUND_BALANCE)
        );

        let mut heads = chain.subscribe_chain_head_event();
        let head = tokio::time::timeout(Duration::from_secs(10), heads.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.block.header().coinbase, Address::repeat_byte(0x12));

        let miner_running = node.miner().mining();
        assert!(miner_running);
        tokio::time::timeout(Duration::from_secs(10), node.run_until(async {}))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_node_stays_at_genesis() {
        let node = Node::start(&config(false));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!node.miner().mining());
        assert_eq!(node.chain().current_block().number(), 0);
        node.run_until(async {}).await;
    }
}
