//! The block production worker.
//!
//! Four loops share one [`Shared`] core:
//! * the [`Scheduler`] decides when to rebuild the sealing block (start, new
//!   head, recommit timer) and tunes the recommit interval.
//! * the [`MainLoop`] owns the live [`Environment`], fills it and hands copies to
//!   the sealer. It also serves on-demand sealing requests.
//! * `task_loop` submits tasks to the consensus engine, suppressing duplicates.
//! * `result_loop` writes sealed blocks to the chain.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy_primitives::{Address, B256, U256};
use chain::gas::{calc_base_fee, calc_gas_limit};
use chain::{
    ApplyError, Block, BlockChain, ChainHeadEvent, ChainSideEvent, Header, NewMinedBlockEvent,
    NewTxsEvent, PendingLogsEvent, Receipt, StateDb, Transaction,
};
use consensus::Engine;
use event::{Feed, Subscription};
use forks::params::{MAX_UNCLES, TX_GAS};
use forks::ChainConfig;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, Sleep};
use tracing::{debug, error, info, trace, warn};
use txpool::{TransactionsByPriceAndNonce, TxPool};

use crate::config::Config;
use crate::environment::{Environment, Task};
use crate::error::MinerError;
use crate::unconfirmed::UnconfirmedBlocks;

/// Sealing results buffered between the engine and the result loop.
const RESULT_QUEUE_SIZE: usize = 10;
const RESUBMIT_ADJUST_CHAN_SIZE: usize = 10;
/// Confirmations after which a mined block's fate is logged.
const SEALING_LOG_AT_DEPTH: u64 = 7;
pub const MIN_RECOMMIT_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_RECOMMIT_INTERVAL: Duration = Duration::from_secs(15);
/// Weight of a new sample in the recommit interval average.
const INTERVAL_ADJUST_RATIO: f64 = 0.1;
/// Nanoseconds added to (or taken from) the adjustment target.
const INTERVAL_ADJUST_BIAS: f64 = 200_000_000.0;
/// Uncles and pending tasks this many blocks behind the head are dropped.
const STALE_THRESHOLD: u64 = 7;
const CLEAN_INTERVAL: Duration = Duration::from_secs(10);
const LOW_PAYLOAD_TIMEOUT: Duration = Duration::from_millis(100);

/// Why filling a block with transactions stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BuildInterrupt {
    #[error("building interrupted by new head")]
    NewHead,
    #[error("building interrupted by recommit")]
    Recommit,
    #[error("building interrupted by timeout")]
    Timeout,
}

impl BuildInterrupt {
    const NONE: u8 = 0;

    fn signal(self) -> u8 {
        match self {
            Self::NewHead => 1,
            Self::Recommit => 2,
            Self::Timeout => 3,
        }
    }

    fn from_signal(signal: u8) -> Option<Self> {
        match signal {
            1 => Some(Self::NewHead),
            2 => Some(Self::Recommit),
            3 => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// Reasons a side block cannot be referenced as an uncle of the sealing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UncleError {
    #[error("ignore uncle for beacon block")]
    BeaconBlock,
    #[error("uncle not unique")]
    NotUnique,
    #[error("uncle is sibling")]
    Sibling,
    #[error("uncle's parent unknown")]
    ParentUnknown,
    #[error("uncle already included")]
    AlreadyIncluded,
}

/// Chain and pool the worker builds on.
pub trait Backend: Send + Sync {
    fn block_chain(&self) -> Arc<dyn BlockChain>;
    fn tx_pool(&self) -> Arc<dyn TxPool>;
}

/// Decides whether a side block was produced by this node.
pub type IsLocalBlockFn = Arc<dyn Fn(&Header) -> bool + Send + Sync>;

/// Test instrumentation points.
#[derive(Default, Clone)]
pub(crate) struct Hooks {
    pub new_task: Option<Arc<dyn Fn(&Task) + Send + Sync>>,
    pub skip_seal: Option<Arc<dyn Fn(&Task) -> bool + Send + Sync>>,
    pub full_task: Option<Arc<dyn Fn() + Send + Sync>>,
    pub resubmit: Option<Arc<dyn Fn(Duration, Duration) + Send + Sync>>,
    pub committed_tx: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Parameters of one block build.
#[derive(Debug, Clone, Default)]
pub struct GenerateParams {
    pub timestamp: u64,
    /// Reject, rather than bump, a timestamp not past the parent's.
    pub force_time: bool,
    /// `None` builds on the current head.
    pub parent_hash: Option<B256>,
    pub coinbase: Address,
    pub random: B256,
    pub no_uncle: bool,
    pub no_txs: bool,
}

struct NewWorkReq {
    interrupt: Arc<AtomicU8>,
    timestamp: u64,
}

struct GetWorkReq {
    params: GenerateParams,
    result: oneshot::Sender<Result<(Block, U256), MinerError>>,
}

#[derive(Debug, Clone, Copy)]
struct IntervalAdjust {
    ratio: f64,
    inc: bool,
}

struct Settings {
    etherbase: Address,
    extra: Vec<u8>,
    gas_ceil: u64,
    /// Minimum tip of remote transactions, in wei.
    gas_price: u64,
}

struct Snapshot {
    block: Arc<Block>,
    receipts: Vec<Receipt>,
    state: StateDb,
}

struct Shared {
    settings: RwLock<Settings>,
    chain_config: Arc<ChainConfig>,
    engine: Arc<dyn Engine>,
    chain: Arc<dyn BlockChain>,
    pool: Arc<dyn TxPool>,
    running: AtomicBool,
    /// Transactions seen since the last commit.
    new_txs: AtomicUsize,
    /// Skip the empty pre-seal block.
    noempty: AtomicBool,
    pending_tasks: Mutex<HashMap<B256, Arc<Task>>>,
    snapshot: RwLock<Option<Snapshot>>,
    pending_logs: Feed<PendingLogsEvent>,
    mined: Feed<NewMinedBlockEvent>,
    unconfirmed: UnconfirmedBlocks,
    new_payload_timeout: Duration,
    is_local_block: Option<IsLocalBlockFn>,
    hooks: Hooks,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the parent of `header` already reached the terminal difficulty.
    fn is_ttd_reached(&self, header: &Header) -> bool {
        if header.number == 0 || self.chain_config.terminal_total_difficulty.is_none() {
            return false;
        }
        self.chain
            .get_td(&header.parent_hash, header.number - 1)
            .is_some_and(|td| self.chain_config.reached_ttd(td))
    }

    fn clear_pending(&self, number: u64) {
        self.pending_tasks
            .lock()
            .retain(|_, task| task.block.number() + STALE_THRESHOLD > number);
    }

    fn update_snapshot(&self, env: &Environment) {
        let block = Block::new(env.header.clone(), env.txs.clone(), env.uncle_list(), &env.receipts);
        *self.snapshot.write() = Some(Snapshot {
            block: Arc::new(block),
            receipts: env.receipts.clone(),
            state: env.state.copy(),
        });
    }

    /// Apply transactions in price and nonce order until gas runs out, the
    /// set is exhausted, the best tip drops below `min_tip` or `interrupt` fires.
    fn commit_transactions(
        &self,
        env: &mut Environment,
        txs: &mut TransactionsByPriceAndNonce,
        min_tip: Option<U256>,
        interrupt: Option<&AtomicU8>,
    ) -> Result<(), BuildInterrupt> {
        let mut coalesced_logs = Vec::new();
        loop {
            if let Some(signal) = interrupt.and_then(|i| BuildInterrupt::from_signal(i.load(Ordering::SeqCst))) {
                return Err(signal);
            }
            let gas_left = env.gas_pool.map_or(env.header.gas_limit, |pool| pool.gas());
            if gas_left < TX_GAS {
                trace!(have = gas_left, want = TX_GAS, "not enough gas for further transactions");
                break;
            }
            let Some(tx) = txs.peek().cloned() else { break };
            if let Some(min_tip) = min_tip {
                let tip = tx.effective_gas_tip(env.header.base_fee).unwrap_or_default();
                // The iterator yields the best tip first, so the rest pay less.
                if tip < min_tip {
                    trace!(hash = %tx.hash(), %tip, %min_tip, "remaining transactions underpriced");
                    break;
                }
            }
            if tx.protected() && !self.chain_config.is_eip155(env.header.number) {
                trace!(hash = %tx.hash(), "ignoring replay protected transaction");
                txs.pop();
                continue;
            }
            env.state.set_tx_context(tx.hash(), env.tcount as u64);
            match env.commit_transaction(&tx) {
                Ok(logs) => {
                    coalesced_logs.extend(logs);
                    env.tcount += 1;
                    txs.shift();
                    if let Some(hook) = &self.hooks.committed_tx {
                        hook();
                    }
                }
                Err(ApplyError::NonceTooLow { .. }) => {
                    trace!(sender = %tx.from, nonce = tx.nonce, "skipping transaction with low nonce");
                    txs.shift();
                }
                Err(err) => {
                    debug!(hash = %tx.hash(), %err, "transaction failed, account skipped");
                    txs.pop();
                }
            }
        }
        // Sealing rebuilds constantly, so logs are only pushed while idle.
        if !self.is_running() && !coalesced_logs.is_empty() {
            self.pending_logs.send(PendingLogsEvent { logs: coalesced_logs });
        }
        Ok(())
    }

    /// Fill `env` from the pool, local accounts first. Only remote
    /// transactions are held to the configured gas price.
    fn fill_transactions(&self, env: &mut Environment, interrupt: Option<&AtomicU8>) -> Result<(), BuildInterrupt> {
        let min_tip = U256::from(self.settings.read().gas_price);
        let mut remote = self.pool.pending(true);
        let mut local = BTreeMap::new();
        for account in self.pool.locals() {
            if let Some(txs) = remote.remove(&account) {
                if !txs.is_empty() {
                    local.insert(account, txs);
                }
            }
        }
        if !local.is_empty() {
            let mut txs = TransactionsByPriceAndNonce::new(local, env.header.base_fee);
            self.commit_transactions(env, &mut txs, None, interrupt)?;
        }
        if !remote.is_empty() {
            let mut txs = TransactionsByPriceAndNonce::new(remote, env.header.base_fee);
            self.commit_transactions(env, &mut txs, Some(min_tip), interrupt)?;
        }
        Ok(())
    }
}

/// Fill `env` on the blocking pool, so interrupts raised by other tasks land
/// mid-fill whatever the runtime flavour.
async fn fill_detached(
    shared: Arc<Shared>,
    mut env: Environment,
    interrupt: Option<Arc<AtomicU8>>,
) -> Result<(Environment, Result<(), BuildInterrupt>), JoinError> {
    tokio::task::spawn_blocking(move || {
        let filled = shared.fill_transactions(&mut env, interrupt.as_deref());
        (env, filled)
    })
    .await
}

/// Miner reward of a block: every transaction's gas used times its effective tip.
pub fn total_fees(block: &Block, receipts: &[Receipt]) -> U256 {
    block
        .transactions()
        .iter()
        .zip(receipts)
        .map(|(tx, receipt)| {
            let tip = tx.effective_gas_tip(block.base_fee()).unwrap_or_default();
            tip * U256::from(receipt.gas_used)
        })
        .fold(U256::ZERO, |acc, fee| acc + fee)
}

/// Exponential smoothing of the recommit interval towards `target`
/// nanoseconds, bounded by `min_recommit` below and the maximum above.
pub fn recalc_recommit(min_recommit: Duration, prev: Duration, target: f64, inc: bool) -> Duration {
    let prev = prev.as_nanos() as f64;
    let next = if inc {
        let next = prev * (1.0 - INTERVAL_ADJUST_RATIO)
            + INTERVAL_ADJUST_RATIO * (target + INTERVAL_ADJUST_BIAS);
        next.min(MAX_RECOMMIT_INTERVAL.as_nanos() as f64)
    } else {
        let next = prev * (1.0 - INTERVAL_ADJUST_RATIO)
            + INTERVAL_ADJUST_RATIO * (target - INTERVAL_ADJUST_BIAS);
        next.max(min_recommit.as_nanos() as f64)
    };
    Duration::from_nanos(next as u64)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn sanitize_recommit(interval: Duration) -> Duration {
    if interval < MIN_RECOMMIT_INTERVAL {
        warn!(provided = ?interval, updated = ?MIN_RECOMMIT_INTERVAL, "sanitizing miner recommit interval");
        return MIN_RECOMMIT_INTERVAL;
    }
    interval
}

/// Handle for requesting sealing blocks from the main loop.
#[derive(Clone)]
pub(crate) struct SealingClient {
    get_work: mpsc::Sender<GetWorkReq>,
    exit: watch::Receiver<bool>,
}

impl SealingClient {
    pub(crate) async fn get_sealing_block(&mut self, params: GenerateParams) -> Result<(Block, U256), MinerError> {
        if *self.exit.borrow() {
            return Err(MinerError::MinerClosed);
        }
        let (result, rx) = oneshot::channel();
        tokio::select! {
            sent = self.get_work.send(GetWorkReq { params, result }) => {
                if sent.is_err() {
                    return Err(MinerError::MinerClosed);
                }
            }
            _ = self.exit.changed() => return Err(MinerError::MinerClosed),
        }
        rx.await.map_err(|_| MinerError::MinerClosed)?
    }
}

/// Block producer running four cooperating loops on the current runtime.
pub struct Worker {
    shared: Arc<Shared>,
    recommit: Duration,
    start: mpsc::Sender<()>,
    get_work: mpsc::Sender<GetWorkReq>,
    resubmit_interval: mpsc::UnboundedSender<Duration>,
    #[cfg_attr(not(test), allow(dead_code))]
    resubmit_adjust: mpsc::Sender<IntervalAdjust>,
    exit: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn the worker. With `init` a first pending block is built right away.
    pub fn new(
        config: Config,
        chain_config: Arc<ChainConfig>,
        engine: Arc<dyn Engine>,
        backend: &dyn Backend,
        is_local_block: Option<IsLocalBlockFn>,
        init: bool,
    ) -> Self {
        Self::with_hooks(config, chain_config, engine, backend, is_local_block, init, Hooks::default())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn with_hooks(
        config: Config,
        chain_config: Arc<ChainConfig>,
        engine: Arc<dyn Engine>,
        backend: &dyn Backend,
        is_local_block: Option<IsLocalBlockFn>,
        init: bool,
        hooks: Hooks,
    ) -> Self {
        let chain = backend.block_chain();
        let pool = backend.tx_pool();

        let recommit = sanitize_recommit(config.recommit);
        let mut new_payload_timeout = config.new_payload_timeout;
        if new_payload_timeout.is_zero() {
            warn!("sanitizing new payload timeout to default");
            new_payload_timeout = Config::default().new_payload_timeout;
        }
        if new_payload_timeout < LOW_PAYLOAD_TIMEOUT {
            warn!(
                timeout = ?new_payload_timeout,
                "low payload timeout may cause high amount of non-full blocks"
            );
        }

        let shared = Arc::new(Shared {
            settings: RwLock::new(Settings {
                etherbase: config.etherbase,
                extra: config.extra_data,
                gas_ceil: config.gas_ceil,
                gas_price: config.gas_price,
            }),
            chain_config,
            engine,
            unconfirmed: UnconfirmedBlocks::new(Box::new(chain.clone()), SEALING_LOG_AT_DEPTH),
            chain,
            pool,
            running: AtomicBool::new(false),
            new_txs: AtomicUsize::new(0),
            noempty: AtomicBool::new(false),
            pending_tasks: Mutex::new(HashMap::new()),
            snapshot: RwLock::new(None),
            pending_logs: Feed::new(),
            mined: Feed::new(),
            new_payload_timeout,
            is_local_block,
            hooks,
        });

        let (start, start_rx) = mpsc::channel(1);
        let (new_work, new_work_rx) = mpsc::channel(1);
        let (get_work, get_work_rx) = mpsc::channel(1);
        let (task_tx, task_rx) = mpsc::channel(1);
        let (result_tx, result_rx) = mpsc::channel(RESULT_QUEUE_SIZE);
        let (resubmit_interval, interval_rx) = mpsc::unbounded_channel();
        let (resubmit_adjust, adjust_rx) = mpsc::channel(RESUBMIT_ADJUST_CHAN_SIZE);
        let (exit, _) = watch::channel(false);

        // Subscribe before spawning so no event between here and the first poll is lost.
        let heads = shared.chain.subscribe_chain_head_event();
        let sides = shared.chain.subscribe_chain_side_event();
        let txs = shared.pool.subscribe_new_txs_event();

        let scheduler = Scheduler {
            shared: shared.clone(),
            new_work,
            exit: exit.subscribe(),
            interrupt: None,
            timestamp: 0,
            min_recommit: recommit,
            recommit,
        };
        let builder = MainLoop {
            shared: shared.clone(),
            current: None,
            local_uncles: HashMap::new(),
            remote_uncles: HashMap::new(),
            tasks: task_tx,
            adjust: resubmit_adjust.clone(),
            exit: exit.subscribe(),
        };
        let handles = vec![
            tokio::spawn(builder.run(new_work_rx, get_work_rx, sides, txs)),
            tokio::spawn(scheduler.run(start_rx, heads, interval_rx, adjust_rx)),
            tokio::spawn(result_loop(shared.clone(), result_rx, exit.subscribe())),
            tokio::spawn(task_loop(shared.clone(), task_rx, result_tx, exit.subscribe())),
        ];

        if init {
            let _ = start.try_send(());
        }

        Self {
            shared,
            recommit,
            start,
            get_work,
            resubmit_interval,
            resubmit_adjust,
            exit,
            handles: Mutex::new(handles),
        }
    }

    pub fn start(&self) {
        self.shared.running.store(true, Ordering::SeqCst);
        // A full channel already holds a pending start.
        let _ = self.start.try_send(());
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Stop every loop and wait for them to finish.
    pub async fn close(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.exit.send_replace(true);
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn etherbase(&self) -> Address {
        self.shared.settings.read().etherbase
    }

    pub fn set_etherbase(&self, addr: Address) {
        self.shared.settings.write().etherbase = addr;
    }

    pub fn set_gas_ceil(&self, ceil: u64) {
        self.shared.settings.write().gas_ceil = ceil;
    }

    pub fn set_extra(&self, extra: Vec<u8>) {
        self.shared.settings.write().extra = extra;
    }

    pub fn set_recommit_interval(&self, interval: Duration) {
        let _ = self.resubmit_interval.send(interval);
    }

    pub fn enable_preseal(&self) {
        self.shared.noempty.store(false, Ordering::SeqCst);
    }

    pub fn disable_preseal(&self) {
        self.shared.noempty.store(true, Ordering::SeqCst);
    }

    /// Pending block and a copy of its state.
    pub fn pending(&self) -> Option<(Arc<Block>, StateDb)> {
        self.shared
            .snapshot
            .read()
            .as_ref()
            .map(|s| (s.block.clone(), s.state.copy()))
    }

    pub fn pending_block(&self) -> Option<Arc<Block>> {
        self.shared.snapshot.read().as_ref().map(|s| s.block.clone())
    }

    pub fn pending_block_and_receipts(&self) -> Option<(Arc<Block>, Vec<Receipt>)> {
        self.shared
            .snapshot
            .read()
            .as_ref()
            .map(|s| (s.block.clone(), s.receipts.clone()))
    }

    /// Logs of the pending block, published while the worker is not sealing.
    pub fn subscribe_pending_logs(&self) -> Subscription<PendingLogsEvent> {
        self.shared.pending_logs.subscribe()
    }

    /// Blocks sealed locally and written to the chain.
    pub fn subscribe_mined_blocks(&self) -> Subscription<NewMinedBlockEvent> {
        self.shared.mined.subscribe()
    }

    /// Base interval between payload rebuilds.
    pub(crate) fn recommit(&self) -> Duration {
        self.recommit
    }

    pub(crate) fn sealing_client(&self) -> SealingClient {
        SealingClient {
            get_work: self.get_work.clone(),
            exit: self.exit.subscribe(),
        }
    }

    /// Build a block on request of an external caller, outside the sealing cycle.
    pub async fn get_sealing_block(&self, params: GenerateParams) -> Result<(Block, U256), MinerError> {
        self.sealing_client().get_sealing_block(params).await
    }
}

/// State of the loop deciding when new sealing work is due.
struct Scheduler {
    shared: Arc<Shared>,
    new_work: mpsc::Sender<NewWorkReq>,
    exit: watch::Receiver<bool>,
    interrupt: Option<Arc<AtomicU8>>,
    timestamp: u64,
    /// Interval set by the user; the adaptive one never drops below it.
    min_recommit: Duration,
    recommit: Duration,
}

impl Scheduler {
    async fn run(
        mut self,
        mut start: mpsc::Receiver<()>,
        mut heads: Subscription<ChainHeadEvent>,
        mut intervals: mpsc::UnboundedReceiver<Duration>,
        mut adjusts: mpsc::Receiver<IntervalAdjust>,
    ) {
        let timer = time::sleep(self.recommit);
        tokio::pin!(timer);
        let mut armed = false;

        loop {
            tokio::select! {
                Some(()) = start.recv() => {
                    self.shared.clear_pending(self.shared.chain.current_block().number());
                    self.timestamp = unix_now();
                    if !self.commit(BuildInterrupt::NewHead, timer.as_mut()).await {
                        return;
                    }
                    armed = true;
                }
                head = heads.recv() => {
                    let Some(head) = head else { return };
                    self.shared.clear_pending(head.block.number());
                    self.timestamp = unix_now();
                    if !self.commit(BuildInterrupt::NewHead, timer.as_mut()).await {
                        return;
                    }
                    armed = true;
                }
                () = &mut timer, if armed => {
                    armed = false;
                    if self.shared.is_running() && self.shared.chain_config.resubmits_on_period() {
                        if self.shared.new_txs.load(Ordering::SeqCst) == 0 {
                            timer.as_mut().reset(Instant::now() + self.recommit);
                            armed = true;
                            continue;
                        }
                        if !self.commit(BuildInterrupt::Recommit, timer.as_mut()).await {
                            return;
                        }
                        armed = true;
                    }
                }
                Some(interval) = intervals.recv() => {
                    let interval = sanitize_recommit(interval);
                    info!(from = ?self.min_recommit, to = ?interval, "miner recommit interval update");
                    self.min_recommit = interval;
                    self.recommit = interval;
                    self.resubmit_hook();
                }
                Some(adjust) = adjusts.recv() => {
                    let before = self.recommit;
                    if adjust.inc {
                        let target = self.recommit.as_nanos() as f64 / adjust.ratio;
                        self.recommit = recalc_recommit(self.min_recommit, self.recommit, target, true);
                        trace!(from = ?before, to = ?self.recommit, "increase miner recommit interval");
                    } else {
                        let target = self.min_recommit.as_nanos() as f64;
                        self.recommit = recalc_recommit(self.min_recommit, self.recommit, target, false);
                        trace!(from = ?before, to = ?self.recommit, "decrease miner recommit interval");
                    }
                    self.resubmit_hook();
                }
                _ = self.exit.changed() => return,
            }
        }
    }

    /// Abort the in-flight build with `signal` and request a new one.
    /// Returns false once the worker is exiting.
    async fn commit(&mut self, signal: BuildInterrupt, timer: std::pin::Pin<&mut Sleep>) -> bool {
        if let Some(prev) = &self.interrupt {
            prev.store(signal.signal(), Ordering::SeqCst);
        }
        let interrupt = Arc::new(AtomicU8::new(BuildInterrupt::NONE));
        self.interrupt = Some(interrupt.clone());
        let req = NewWorkReq {
            interrupt,
            timestamp: self.timestamp,
        };
        tokio::select! {
            sent = self.new_work.send(req) => {
                if sent.is_err() {
                    return false;
                }
            }
            _ = self.exit.changed() => return false,
        }
        timer.reset(Instant::now() + self.recommit);
        self.shared.new_txs.store(0, Ordering::SeqCst);
        true
    }

    fn resubmit_hook(&self) {
        if let Some(hook) = &self.shared.hooks.resubmit {
            hook(self.min_recommit, self.recommit);
        }
    }
}

/// Sole owner of the live sealing environment.
struct MainLoop {
    shared: Arc<Shared>,
    current: Option<Environment>,
    local_uncles: HashMap<B256, Arc<Block>>,
    remote_uncles: HashMap<B256, Arc<Block>>,
    tasks: mpsc::Sender<Task>,
    adjust: mpsc::Sender<IntervalAdjust>,
    exit: watch::Receiver<bool>,
}

impl MainLoop {
    async fn run(
        mut self,
        mut new_work: mpsc::Receiver<NewWorkReq>,
        mut get_work: mpsc::Receiver<GetWorkReq>,
        mut sides: Subscription<ChainSideEvent>,
        mut txs: Subscription<NewTxsEvent>,
    ) {
        let mut clean = time::interval_at(Instant::now() + CLEAN_INTERVAL, CLEAN_INTERVAL);
        loop {
            tokio::select! {
                Some(req) = new_work.recv() => {
                    self.commit_work(Some(req.interrupt), req.timestamp).await;
                }
                Some(req) = get_work.recv() => {
                    let _ = req.result.send(self.generate_work(&req.params).await);
                }
                ev = sides.recv() => {
                    let Some(ev) = ev else { break };
                    self.on_side_block(ev.block).await;
                }
                _ = clean.tick() => self.clean_stale_uncles(),
                ev = txs.recv() => {
                    let Some(ev) = ev else { break };
                    self.on_new_txs(ev).await;
                }
                _ = self.exit.changed() => break,
            }
        }
        if let Some(current) = self.current.as_mut() {
            current.discard();
        }
    }

    async fn on_side_block(&mut self, block: Arc<Block>) {
        let hash = block.hash();
        if self.local_uncles.contains_key(&hash) || self.remote_uncles.contains_key(&hash) {
            return;
        }
        let local = self
            .shared
            .is_local_block
            .as_ref()
            .is_some_and(|is_local| is_local(block.header()));
        let header = block.header().clone();
        if local {
            self.local_uncles.insert(hash, block);
        } else {
            self.remote_uncles.insert(hash, block);
        }
        // A sealing block with room for another uncle is worth resubmitting.
        if !self.shared.is_running() {
            return;
        }
        let start = Instant::now();
        let shared = self.shared.clone();
        let Some(current) = self.current.as_mut() else { return };
        if current.uncles.len() >= MAX_UNCLES {
            return;
        }
        let beacon = shared.is_ttd_reached(&current.header);
        if current.commit_uncle(&header, beacon).is_ok() {
            let env = current.copy();
            self.commit(&env, false, true, start).await;
        }
    }

    fn clean_stale_uncles(&mut self) {
        let head = self.shared.chain.current_block().number();
        let fresh = |_: &B256, uncle: &mut Arc<Block>| uncle.number() + STALE_THRESHOLD > head;
        self.local_uncles.retain(fresh);
        self.remote_uncles.retain(fresh);
    }

    async fn on_new_txs(&mut self, ev: NewTxsEvent) {
        let shared = self.shared.clone();
        if !shared.is_running() && self.current.is_some() {
            let Some(current) = self.current.as_mut() else { return };
            if current.gas_pool.is_some_and(|pool| pool.gas() < TX_GAS) {
                return;
            }
            let mut by_sender: BTreeMap<Address, Vec<Arc<Transaction>>> = BTreeMap::new();
            for tx in &ev.txs {
                by_sender.entry(tx.from).or_default().push(tx.clone());
            }
            let mut txs = TransactionsByPriceAndNonce::new(by_sender, current.header.base_fee);
            let tcount = current.tcount;
            let _ = shared.commit_transactions(current, &mut txs, None, None);
            if tcount != current.tcount {
                shared.update_snapshot(current);
            }
        } else if shared.chain_config.seals_on_demand() {
            // Empty blocks are pointless without a period, so seal now.
            self.commit_work(None, unix_now()).await;
        }
        shared.new_txs.fetch_add(ev.txs.len(), Ordering::SeqCst);
    }

    /// Construct the sealing environment for `params`.
    fn prepare_work(&self, params: &GenerateParams) -> Result<Environment, MinerError> {
        let shared = &self.shared;
        let chain = &shared.chain;
        let config = &shared.chain_config;
        let (extra, gas_ceil) = {
            let settings = shared.settings.read();
            (settings.extra.clone(), settings.gas_ceil)
        };

        let parent = match params.parent_hash {
            None => chain.current_block(),
            Some(hash) => chain
                .get_block_by_hash(&hash)
                .ok_or(MinerError::MissingParent(hash))?,
        };
        let parent = parent.header();

        let mut timestamp = params.timestamp;
        if parent.timestamp >= timestamp {
            if params.force_time {
                return Err(MinerError::InvalidTimestamp {
                    parent: parent.timestamp,
                    given: timestamp,
                });
            }
            timestamp = parent.timestamp + 1;
        }

        let mut header = Header {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            gas_limit: calc_gas_limit(parent.gas_limit, gas_ceil),
            timestamp,
            coinbase: params.coinbase,
            ..Header::default()
        };
        if !extra.is_empty() {
            header.extra_data = extra;
        }
        if params.random != B256::ZERO {
            header.mix_hash = params.random;
        }
        if config.is_london(header.number) {
            header.base_fee = Some(calc_base_fee(config, parent));
            if !config.is_london(parent.number) {
                let parent_gas_limit = parent.gas_limit * config.elasticity_multiplier;
                header.gas_limit = calc_gas_limit(parent_gas_limit, gas_ceil);
            }
        }
        if let Err(err) = shared.engine.prepare(&**chain, &mut header) {
            error!(%err, "failed to prepare header for sealing");
            return Err(err.into());
        }

        let state = chain.state_at(parent.state_root).inspect_err(|err| {
            error!(%err, "failed to create sealing context");
        })?;
        let mut env = Environment::new(&**chain, parent, state, header, params.coinbase);

        if !params.no_uncle {
            let beacon = shared.is_ttd_reached(&env.header);
            // Locally mined uncles go first.
            for uncles in [&self.local_uncles, &self.remote_uncles] {
                for (hash, uncle) in uncles {
                    if env.uncles.len() == MAX_UNCLES {
                        break;
                    }
                    match env.commit_uncle(uncle.header(), beacon) {
                        Ok(()) => debug!(%hash, "committing new uncle to block"),
                        Err(reason) => trace!(%hash, %reason, "possible uncle rejected"),
                    }
                }
            }
        }
        Ok(env)
    }

    /// Build a block for an on-demand request. Filling is bounded by the
    /// payload timeout.
    async fn generate_work(&self, params: &GenerateParams) -> Result<(Block, U256), MinerError> {
        let mut work = self.prepare_work(params)?;
        if !params.no_txs {
            let interrupt = Arc::new(AtomicU8::new(BuildInterrupt::NONE));
            let timeout = self.shared.new_payload_timeout;
            let timer = {
                let interrupt = interrupt.clone();
                tokio::spawn(async move {
                    time::sleep(timeout).await;
                    interrupt.store(BuildInterrupt::Timeout.signal(), Ordering::SeqCst);
                })
            };
            let filled = fill_detached(self.shared.clone(), work, Some(interrupt)).await;
            timer.abort();
            let (filled, result) = filled?;
            if let Err(BuildInterrupt::Timeout) = result {
                warn!(allowance = ?timeout, "block building is interrupted");
            }
            work = filled;
        }
        let uncles = work.uncle_list();
        let assembled = self.shared.engine.finalize_and_assemble(
            &*self.shared.chain,
            work.header.clone(),
            &mut work.state,
            work.txs.clone(),
            uncles,
            &work.receipts,
        );
        work.discard();
        let block = assembled?;
        let fees = total_fees(&block, &work.receipts);
        Ok((block, fees))
    }

    /// Build new sealing work on the current head: an empty pre-seal block
    /// first, then one filled from the pool.
    async fn commit_work(&mut self, interrupt: Option<Arc<AtomicU8>>, timestamp: u64) {
        let start = Instant::now();
        let mut coinbase = Address::ZERO;
        if self.shared.is_running() {
            coinbase = self.shared.settings.read().etherbase;
            if coinbase == Address::ZERO {
                error!("refusing to mine without etherbase");
                return;
            }
        }
        let params = GenerateParams {
            timestamp,
            coinbase,
            ..GenerateParams::default()
        };
        let Ok(work) = self.prepare_work(&params) else { return };

        if !self.shared.noempty.load(Ordering::SeqCst) {
            let empty = work.copy();
            self.commit(&empty, false, false, start).await;
        }

        let (mut work, filled) = match fill_detached(self.shared.clone(), work, interrupt).await {
            Ok(done) => done,
            Err(err) => {
                error!(%err, "transaction filling task failed");
                return;
            }
        };
        match filled {
            Ok(()) => {
                // Filled completely: drift the interval back to the user setting.
                let _ = self.adjust.try_send(IntervalAdjust { ratio: 0.0, inc: false });
            }
            Err(BuildInterrupt::Recommit) => {
                let limit = work.header.gas_limit.max(1);
                let left = work.gas_pool.map_or(limit, |pool| pool.gas());
                let ratio = ((limit - left.min(limit)) as f64 / limit as f64).max(0.1);
                let _ = self.adjust.try_send(IntervalAdjust { ratio, inc: true });
            }
            Err(BuildInterrupt::NewHead) => {
                // Sealing on the old head would only raise the uncle rate.
                work.discard();
                return;
            }
            Err(BuildInterrupt::Timeout) => {}
        }

        self.commit(&work, true, true, start).await;
        if let Some(mut previous) = self.current.replace(work) {
            previous.discard();
        }
    }

    /// Finalize a copy of `env` and hand it to the sealer, then refresh the
    /// pending snapshot if `update` is set.
    async fn commit(&mut self, env: &Environment, full: bool, update: bool, start: Instant) {
        if self.shared.is_running() {
            if full {
                if let Some(hook) = &self.shared.hooks.full_task {
                    hook();
                }
            }
            let mut sealing = env.copy();
            let uncles = sealing.uncle_list();
            let assembled = self.shared.engine.finalize_and_assemble(
                &*self.shared.chain,
                sealing.header.clone(),
                &mut sealing.state,
                sealing.txs.clone(),
                uncles,
                &sealing.receipts,
            );
            let block = match assembled {
                Ok(block) => block,
                Err(err) => {
                    warn!(%err, "failed to assemble sealing block");
                    return;
                }
            };
            if !self.shared.is_ttd_reached(block.header()) {
                let number = block.number();
                let sealhash = self.shared.engine.seal_hash(block.header());
                let fees = total_fees(&block, &sealing.receipts);
                let gas = block.gas_used();
                let task = Task {
                    receipts: sealing.receipts,
                    state: sealing.state,
                    block,
                    created_at: std::time::Instant::now(),
                };
                tokio::select! {
                    sent = self.tasks.send(task) => {
                        if sent.is_ok() {
                            self.shared.unconfirmed.shift(number.saturating_sub(1));
                            info!(
                                number,
                                %sealhash,
                                uncles = sealing.uncles.len(),
                                txs = sealing.tcount,
                                gas,
                                %fees,
                                elapsed = ?start.elapsed(),
                                "commit new sealing work"
                            );
                        }
                    }
                    _ = self.exit.changed() => info!("worker has exited"),
                }
            }
        }
        if update {
            self.shared.update_snapshot(env);
        }
    }
}

/// Submit sealing tasks to the engine, aborting the previous one.
async fn task_loop(
    shared: Arc<Shared>,
    mut tasks: mpsc::Receiver<Task>,
    results: mpsc::Sender<Block>,
    mut exit: watch::Receiver<bool>,
) {
    let mut stop: Option<oneshot::Sender<()>> = None;
    let mut prev = B256::ZERO;
    loop {
        tokio::select! {
            Some(task) = tasks.recv() => {
                if let Some(hook) = &shared.hooks.new_task {
                    hook(&task);
                }
                // Resubmits of an unchanged block are dropped.
                let sealhash = shared.engine.seal_hash(task.block.header());
                if sealhash == prev {
                    continue;
                }
                if let Some(stop) = stop.take() {
                    let _ = stop.send(());
                }
                let (stop_tx, stop_rx) = oneshot::channel();
                stop = Some(stop_tx);
                prev = sealhash;

                if shared.hooks.skip_seal.as_ref().is_some_and(|skip| skip(&task)) {
                    continue;
                }
                let block = task.block.clone();
                shared.pending_tasks.lock().insert(sealhash, Arc::new(task));
                if let Err(err) = shared.engine.seal(&*shared.chain, block, results.clone(), stop_rx) {
                    warn!(%err, "block sealing failed");
                    shared.pending_tasks.lock().remove(&sealhash);
                }
            }
            _ = exit.changed() => {
                if let Some(stop) = stop.take() {
                    let _ = stop.send(());
                }
                return;
            }
        }
    }
}

/// Write sealed blocks to the chain and announce them.
async fn result_loop(shared: Arc<Shared>, mut results: mpsc::Receiver<Block>, mut exit: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            Some(block) = results.recv() => {
                let (hash, number) = (block.hash(), block.number());
                // Resubmitted work can be sealed twice.
                if shared.chain.has_block(&hash, number) {
                    continue;
                }
                let sealhash = shared.engine.seal_hash(block.header());
                let Some(task) = shared.pending_tasks.lock().get(&sealhash).cloned() else {
                    error!(number, %sealhash, %hash, "block found but no relative pending task");
                    continue;
                };
                let mut logs = Vec::new();
                let receipts: Vec<Receipt> = task
                    .receipts
                    .iter()
                    .enumerate()
                    .map(|(i, receipt)| {
                        let mut receipt = receipt.clone();
                        receipt.block_hash = hash;
                        receipt.block_number = number;
                        receipt.transaction_index = i as u64;
                        for log in &mut receipt.logs {
                            log.block_hash = hash;
                            log.block_number = number;
                        }
                        logs.extend(receipt.logs.iter().cloned());
                        receipt
                    })
                    .collect();
                if let Err(err) = shared
                    .chain
                    .write_block_and_set_head(block.clone(), receipts, logs, task.state.copy(), true)
                {
                    error!(%err, "failed writing block to chain");
                    continue;
                }
                info!(number, %sealhash, %hash, elapsed = ?task.created_at.elapsed(), "successfully sealed new block");
                shared.mined.send(NewMinedBlockEvent { block: Arc::new(block) });
                shared.unconfirmed.insert(number, hash);
            }
            _ = exit.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use chain::{Genesis, MemoryChain};
    use consensus::{Ethash, RewardSchedule};
    use txpool::{MemoryPool, PoolConfig};

    use super::*;

    const ETHERBASE: Address = Address::new([0xee; 20]);
    const FUNDED: Address = Address::new([0x11; 20]);

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

    fn backend() -> TestBackend {
        let genesis = Genesis::default().with_account(FUNDED, U256::from(10u64).pow(U256::from(20u64)));
        let chain = Arc::new(MemoryChain::new(Arc::new(ChainConfig::default()), &genesis));
        let pool = Arc::new(MemoryPool::new(PoolConfig::default(), chain.clone()));
        TestBackend { chain, pool }
    }

    fn transfer(nonce: u64) -> Transaction {
        Transaction {
            chain_id: Some(ChainConfig::default().chain_id),
            nonce,
            gas_price: U256::from(2_000_000_000u64),
            gas_tip_cap: None,
            gas: TX_GAS,
            to: Some(Address::new([0x22; 20])),
            value: U256::from(1_000u64),
            data: Vec::new(),
            from: FUNDED,
        }
    }

    fn config() -> Config {
        Config {
            etherbase: ETHERBASE,
            recommit: Duration::from_secs(1),
            ..Config::default()
        }
    }

    fn engine(delay: Duration) -> Arc<dyn Engine> {
        Arc::new(Ethash::new_fake_delayer(RewardSchedule::default(), delay))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[test]
    fn recommit_grows_towards_target_and_shrinks_to_minimum() {
        let min = Duration::from_secs(3);
        let origin = min.as_nanos() as f64;

        let up = recalc_recommit(min, min, origin / 0.8, true);
        let want = origin * 0.9 + 0.1 * (origin / 0.8 + INTERVAL_ADJUST_BIAS);
        assert_eq!(up, Duration::from_nanos(want as u64));

        let down = recalc_recommit(min, up, origin, false);
        let want = (up.as_nanos() as f64 * 0.9 + 0.1 * (origin - INTERVAL_ADJUST_BIAS)).max(origin);
        assert_eq!(down, Duration::from_nanos(want as u64));
    }

    #[test]
    fn recommit_stays_within_bounds() {
        let min = Duration::from_secs(1);
        let up = recalc_recommit(min, MAX_RECOMMIT_INTERVAL, 1e12, true);
        assert_eq!(up, MAX_RECOMMIT_INTERVAL);
        let down = recalc_recommit(min, min, 0.0, false);
        assert_eq!(down, min);
    }

    #[test]
    fn interrupt_signals_map_back() {
        for interrupt in [BuildInterrupt::NewHead, BuildInterrupt::Recommit, BuildInterrupt::Timeout] {
            assert_eq!(BuildInterrupt::from_signal(interrupt.signal()), Some(interrupt));
        }
        assert_eq!(BuildInterrupt::from_signal(BuildInterrupt::NONE), None);
    }

    #[test]
    fn total_fees_sums_tips() {
        let tx = Arc::new(transfer(0));
        let block = Block::new(Header::default(), vec![tx.clone(), tx], Vec::new(), &[]);
        let receipts = vec![
            Receipt {
                gas_used: 21_000,
                ..Receipt::default()
            },
            Receipt {
                gas_used: 10,
                ..Receipt::default()
            },
        ];
        assert_eq!(
            total_fees(&block, &receipts),
            U256::from(21_010u64) * U256::from(2_000_000_000u64)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_state_is_built_on_init_and_follows_pool() {
        let backend = backend();
        let worker = Worker::new(config(), Arc::new(ChainConfig::default()), engine(Duration::from_secs(3600)), &backend, None, true);
        assert!(wait_until(|| worker.pending_block().is_some()).await);
        assert_eq!(worker.pending_block().unwrap().number(), 1);

        let mut logs = worker.subscribe_pending_logs();
        backend.pool.add_local(transfer(0)).unwrap();
        assert!(wait_until(|| worker.pending_block().is_some_and(|b| b.transactions().len() == 1)).await);
        let (block, receipts) = worker.pending_block_and_receipts().unwrap();
        assert_eq!(block.gas_used(), TX_GAS);
        assert_eq!(receipts.len(), 1);
        // Transfers to an account emit no logs.
        assert!(logs.try_recv().is_none());

        let (_, state) = worker.pending().unwrap();
        assert_eq!(state.nonce(&FUNDED), 1);
        worker.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sealed_blocks_are_written_and_announced() {
        let backend = backend();
        backend.pool.add_local(transfer(0)).unwrap();
        let worker = Worker::new(config(), Arc::new(ChainConfig::default()), engine(Duration::from_millis(20)), &backend, None, false);
        let mut mined = worker.subscribe_mined_blocks();
        worker.start();

        let ev = time::timeout(Duration::from_secs(5), mined.recv()).await.unwrap().unwrap();
        assert_eq!(ev.block.header().coinbase, ETHERBASE);
        assert!(backend.chain.get_block_by_hash(&ev.block.hash()).is_some());
        let receipts = backend.chain.get_receipts_by_hash(&ev.block.hash()).unwrap();
        assert!(receipts.iter().all(|r| r.block_hash == ev.block.hash()));
        worker.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refuses_to_seal_without_etherbase() {
        let backend = backend();
        let tasks = Arc::new(StdMutex::new(0usize));
        let hooks = Hooks {
            new_task: Some({
                let tasks = tasks.clone();
                Arc::new(move |_: &Task| *tasks.lock().unwrap() += 1)
            }),
            ..Hooks::default()
        };
        let config = Config {
            etherbase: Address::ZERO,
            ..config()
        };
        let worker = Worker::with_hooks(config, Arc::new(ChainConfig::default()), engine(Duration::from_secs(3600)), &backend, None, false, hooks);
        worker.start();
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*tasks.lock().unwrap(), 0);

        worker.set_etherbase(ETHERBASE);
        worker.start();
        assert!(wait_until(|| *tasks.lock().unwrap() > 0).await);
        worker.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_preseal_precedes_full_block() {
        let backend = backend();
        backend.pool.add_local(transfer(0)).unwrap();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let hooks = Hooks {
            new_task: Some({
                let seen = seen.clone();
                Arc::new(move |task: &Task| seen.lock().unwrap().push(task.block.transactions().len()))
            }),
            skip_seal: Some(Arc::new(|_: &Task| true)),
            ..Hooks::default()
        };
        let worker = Worker::with_hooks(config(), Arc::new(ChainConfig::default()), engine(Duration::from_secs(3600)), &backend, None, false, hooks);
        worker.start();
        assert!(wait_until(|| seen.lock().unwrap().len() >= 2).await);
        assert_eq!(seen.lock().unwrap()[..2], [0, 1]);
        worker.close().await;

        let backend = self::backend();
        backend.pool.add_local(transfer(0)).unwrap();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let hooks = Hooks {
            new_task: Some({
                let seen = seen.clone();
                Arc::new(move |task: &Task| seen.lock().unwrap().push(task.block.transactions().len()))
            }),
            skip_seal: Some(Arc::new(|_: &Task| true)),
            ..Hooks::default()
        };
        let worker = Worker::with_hooks(config(), Arc::new(ChainConfig::default()), engine(Duration::from_secs(3600)), &backend, None, false, hooks);
        worker.disable_preseal();
        worker.start();
        assert!(wait_until(|| !seen.lock().unwrap().is_empty()).await);
        assert_eq!(seen.lock().unwrap()[0], 1);
        worker.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recommit_interval_follows_user_and_feedback() {
        let backend = backend();
        let updates = Arc::new(StdMutex::new(Vec::new()));
        let hooks = Hooks {
            resubmit: Some({
                let updates = updates.clone();
                Arc::new(move |min, recommit| updates.lock().unwrap().push((min, recommit)))
            }),
            ..Hooks::default()
        };
        let worker = Worker::with_hooks(config(), Arc::new(ChainConfig::default()), engine(Duration::from_secs(3600)), &backend, None, false, hooks);
        let three = Duration::from_secs(3);

        worker.set_recommit_interval(three);
        assert!(wait_until(|| updates.lock().unwrap().len() == 1).await);
        assert_eq!(updates.lock().unwrap()[0], (three, three));

        worker.resubmit_adjust.send(IntervalAdjust { ratio: 0.8, inc: true }).await.unwrap();
        assert!(wait_until(|| updates.lock().unwrap().len() == 2).await);
        let grown = recalc_recommit(three, three, three.as_nanos() as f64 / 0.8, true);
        assert_eq!(updates.lock().unwrap()[1], (three, grown));

        worker.resubmit_adjust.send(IntervalAdjust { ratio: 0.0, inc: false }).await.unwrap();
        assert!(wait_until(|| updates.lock().unwrap().len() == 3).await);
        let shrunk = recalc_recommit(three, grown, three.as_nanos() as f64, false);
        assert_eq!(updates.lock().unwrap()[2], (three, shrunk));

        worker.set_recommit_interval(Duration::from_millis(500));
        assert!(wait_until(|| updates.lock().unwrap().len() == 4).await);
        assert_eq!(updates.lock().unwrap()[3], (MIN_RECOMMIT_INTERVAL, MIN_RECOMMIT_INTERVAL));
        worker.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sealing_block_on_request_respects_parent_and_timestamp() {
        let backend = backend();
        backend.pool.add_local(transfer(0)).unwrap();
        let worker = Worker::new(config(), Arc::new(ChainConfig::default()), engine(Duration::from_secs(3600)), &backend, None, false);
        let genesis = backend.chain.genesis();

        let params = GenerateParams {
            timestamp: genesis.header().timestamp + 10,
            force_time: true,
            parent_hash: Some(genesis.hash()),
            coinbase: ETHERBASE,
            no_uncle: true,
            ..GenerateParams::default()
        };
        let (block, fees) = worker.get_sealing_block(params.clone()).await.unwrap();
        assert_eq!(block.number(), 1);
        assert_eq!(block.transactions().len(), 1);
        assert_eq!(fees, U256::from(TX_GAS) * U256::from(2_000_000_000u64));

        let empty = GenerateParams { no_txs: true, ..params.clone() };
        let (block, fees) = worker.get_sealing_block(empty).await.unwrap();
        assert!(block.transactions().is_empty());
        assert_eq!(fees, U256::ZERO);

        let stale = GenerateParams { timestamp: genesis.header().timestamp, ..params.clone() };
        assert!(matches!(
            worker.get_sealing_block(stale).await,
            Err(MinerError::InvalidTimestamp { .. })
        ));

        let orphan = GenerateParams { parent_hash: Some(B256::repeat_byte(7)), ..params.clone() };
        assert!(matches!(
            worker.get_sealing_block(orphan).await,
            Err(MinerError::MissingParent(_))
        ));

        worker.close().await;
        assert!(matches!(worker.get_sealing_block(params).await, Err(MinerError::MinerClosed)));
    }

    // Single-threaded runtime: the payload timer can only fire if filling
    // leaves the runtime thread free.
    #[tokio::test]
    async fn slow_fill_is_cut_by_payload_timeout() {
        let backend = backend();
        for nonce in 0..3 {
            backend.pool.add_local(transfer(nonce)).unwrap();
        }
        let hooks = Hooks {
            committed_tx: Some(Arc::new(|| std::thread::sleep(Duration::from_millis(100)))),
            ..Hooks::default()
        };
        let config = Config {
            new_payload_timeout: Duration::from_millis(20),
            ..config()
        };
        let worker = Worker::with_hooks(config, Arc::new(ChainConfig::default()), engine(Duration::from_secs(3600)), &backend, None, false, hooks);
        let genesis = backend.chain.genesis();
        let params = GenerateParams {
            timestamp: genesis.header().timestamp + 10,
            coinbase: ETHERBASE,
            ..GenerateParams::default()
        };
        let (block, fees) = worker.get_sealing_block(params).await.unwrap();
        assert_eq!(block.transactions().len(), 1);
        assert_eq!(fees, U256::from(TX_GAS) * U256::from(2_000_000_000u64));
        worker.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_transactions_below_gas_price_are_left_out() {
        let remote_sender = Address::new([0x33; 20]);
        let funds = U256::from(10u64).pow(U256::from(20u64));
        let genesis = Genesis::default()
            .with_account(FUNDED, funds)
            .with_account(remote_sender, funds);
        let chain = Arc::new(MemoryChain::new(Arc::new(ChainConfig::default()), &genesis));
        let pool = Arc::new(MemoryPool::new(PoolConfig::default(), chain.clone()));
        let backend = TestBackend { chain, pool };

        // Both pay a 2 gwei tip; only the local one may go under the floor.
        backend.pool.add_local(transfer(0)).unwrap();
        let remote = Transaction {
            from: remote_sender,
            ..transfer(0)
        };
        assert!(backend.pool.add_remotes(vec![remote])[0].is_ok());

        let config = Config {
            gas_price: 3_000_000_000,
            ..config()
        };
        let worker = Worker::new(config, Arc::new(ChainConfig::default()), engine(Duration::from_secs(3600)), &backend, None, false);
        let genesis = backend.chain.genesis();
        let params = GenerateParams {
            timestamp: genesis.header().timestamp + 10,
            coinbase: ETHERBASE,
            ..GenerateParams::default()
        };
        let (block, _) = worker.get_sealing_block(params.clone()).await.unwrap();
        assert_eq!(block.transactions().len(), 1);
        assert_eq!(block.transactions()[0].from, FUNDED);
        worker.close().await;

        let worker = Worker::new(self::config(), Arc::new(ChainConfig::default()), engine(Duration::from_secs(3600)), &backend, None, false);
        let (block, _) = worker.get_sealing_block(params).await.unwrap();
        assert_eq!(block.transactions().len(), 2);
        worker.close().await;
    }
}
