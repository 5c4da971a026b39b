//! Block production: the sealing worker and the miner facade that pauses it
//! while the node is catching up with the network.

pub mod config;
pub mod environment;
pub mod error;
pub mod payload;
pub mod unconfirmed;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use chain::{Block, NewMinedBlockEvent, PendingLogsEvent, Receipt, StateDb};
use consensus::Engine;
use downloader::DownloaderEvent;
use event::{Subscription, TypeMux};
use forks::params::MAXIMUM_EXTRA_DATA_SIZE;
use forks::ChainConfig;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

pub use config::Config;
pub use environment::{Environment, Task};
pub use error::MinerError;
pub use payload::{BuildPayloadArgs, Payload, PayloadId};
pub use unconfirmed::{ChainRetriever, UnconfirmedBlocks};
pub use worker::{Backend, BuildInterrupt, GenerateParams, IsLocalBlockFn, UncleError, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
}

/// Front of the block production subsystem.
///
/// Mining is suspended while the downloader syncs. It resumes after a sync
/// completes or fails, but only until the first successful sync: from then on
/// downloader events are ignored, so a peer cannot stall mining forever by
/// repeatedly triggering syncs that never finish.
pub struct Miner {
    worker: Arc<Worker>,
    engine: Arc<dyn Engine>,
    commands: mpsc::UnboundedSender<Command>,
    exit: watch::Sender<bool>,
    update: Mutex<Option<JoinHandle<()>>>,
}

impl Miner {
    pub fn new(
        backend: &dyn Backend,
        config: Config,
        chain_config: Arc<ChainConfig>,
        mux: &TypeMux<DownloaderEvent>,
        engine: Arc<dyn Engine>,
        is_local_block: Option<IsLocalBlockFn>,
    ) -> Self {
        let worker = Arc::new(Worker::new(
            config,
            chain_config,
            engine.clone(),
            backend,
            is_local_block,
            true,
        ));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (exit, exit_rx) = watch::channel(false);
        let update = tokio::spawn(update_loop(worker.clone(), mux.subscribe(), commands_rx, exit_rx));
        Self {
            worker,
            engine,
            commands,
            exit,
            update: Mutex::new(Some(update)),
        }
    }

    /// Start mining, now or as soon as a running sync ends.
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Shut down the update loop and the worker.
    pub async fn close(&self) {
        self.exit.send_replace(true);
        let update = self.update.lock().take();
        if let Some(update) = update {
            let _ = update.await;
        }
    }

    pub fn mining(&self) -> bool {
        self.worker.is_running()
    }

    pub fn hashrate(&self) -> u64 {
        self.engine.hashrate() as u64
    }

    pub fn set_extra(&self, extra: Vec<u8>) -> Result<(), MinerError> {
        if extra.len() > MAXIMUM_EXTRA_DATA_SIZE {
            return Err(MinerError::ExtraTooLong {
                len: extra.len(),
                max: MAXIMUM_EXTRA_DATA_SIZE,
            });
        }
        self.worker.set_extra(extra);
        Ok(())
    }

    pub fn set_recommit_interval(&self, interval: Duration) {
        self.worker.set_recommit_interval(interval);
    }

    pub fn pending(&self) -> Option<(Arc<Block>, StateDb)> {
        self.worker.pending()
    }

    pub fn pending_block(&self) -> Option<Arc<Block>> {
        self.worker.pending_block()
    }

    pub fn pending_block_and_receipts(&self) -> Option<(Arc<Block>, Vec<Receipt>)> {
        self.worker.pending_block_and_receipts()
    }

    pub fn set_etherbase(&self, addr: Address) {
        self.worker.set_etherbase(addr);
    }

    pub fn set_gas_ceil(&self, ceil: u64) {
        self.worker.set_gas_ceil(ceil);
    }

    pub fn enable_preseal(&self) {
        self.worker.enable_preseal();
    }

    /// Stop sealing an empty block ahead of the filled one.
    pub fn disable_preseal(&self) {
        self.worker.disable_preseal();
    }

    pub fn subscribe_pending_logs(&self) -> Subscription<PendingLogsEvent> {
        self.worker.subscribe_pending_logs()
    }

    pub fn subscribe_mined_blocks(&self) -> Subscription<NewMinedBlockEvent> {
        self.worker.subscribe_mined_blocks()
    }

    pub async fn build_payload(&self, args: BuildPayloadArgs) -> Result<Arc<Payload>, MinerError> {
        self.worker.build_payload(args).await
    }
}

async fn update_loop(
    worker: Arc<Worker>,
    events: Subscription<DownloaderEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut exit: watch::Receiver<bool>,
) {
    let mut events = Some(events);
    let mut should_start = false;
    let mut can_start = true;

    loop {
        let next_event = async {
            match events.as_mut() {
                Some(events) => events.recv().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            event = next_event => {
                let Some(event) = event else {
                    events = None;
                    continue;
                };
                match event {
                    DownloaderEvent::Start => {
                        let was_mining = worker.is_running();
                        worker.stop();
                        can_start = false;
                        if was_mining {
                            should_start = true;
                            info!("mining aborted due to sync");
                        }
                    }
                    DownloaderEvent::Failed(_) => {
                        can_start = true;
                        if should_start {
                            worker.start();
                        }
                    }
                    DownloaderEvent::Done(_) => {
                        can_start = true;
                        if should_start {
                            worker.start();
                        }
                        // Later syncs no longer gate mining.
                        events = None;
                    }
                }
            }
            Some(command) = commands.recv() => match command {
                Command::Start => {
                    if can_start {
                        worker.start();
                    }
                    should_start = true;
                }
                Command::Stop => {
                    should_start = false;
                    worker.stop();
                }
            },
            _ = exit.changed() => {
                worker.close().await;
                return;
            }
        }
    }
}
