use std::sync::Arc;

use crate::types::{Block, Log, Transaction};

/// The canonical head moved to `block`.
#[derive(Debug, Clone)]
pub struct ChainHeadEvent {
    pub block: Arc<Block>,
}

/// `block` was written but did not become canonical.
#[derive(Debug, Clone)]
pub struct ChainSideEvent {
    pub block: Arc<Block>,
}

/// Transactions entered the pool.
#[derive(Debug, Clone)]
pub struct NewTxsEvent {
    pub txs: Vec<Arc<Transaction>>,
}

/// A locally sealed block was written to the chain.
#[derive(Debug, Clone)]
pub struct NewMinedBlockEvent {
    pub block: Arc<Block>,
}

/// Logs of the pending block, emitted while the miner is idle.
#[derive(Debug, Clone)]
pub struct PendingLogsEvent {
    pub logs: Vec<Log>,
}
