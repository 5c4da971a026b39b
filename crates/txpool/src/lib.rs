//! Transaction pool surface consumed by block production.

pub mod ordering;
pub mod pool;

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use chain::{NewTxsEvent, Transaction};
use event::Subscription;
use thiserror::Error;

pub use ordering::TransactionsByPriceAndNonce;
pub use pool::{MemoryPool, PoolConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("already known: {0}")]
    AlreadyKnown(B256),
    #[error("nonce too low: have {have}, state {state}")]
    NonceTooLow { have: u64, state: u64 },
    #[error("transaction underpriced: tip {tip}, minimum {minimum}")]
    Underpriced { tip: U256, minimum: U256 },
    #[error("replacement transaction underpriced")]
    ReplaceUnderpriced,
    #[error("exceeds block gas limit: {gas} > {limit}")]
    GasLimit { gas: u64, limit: u64 },
    #[error("intrinsic gas too low: have {have}, want {want}")]
    IntrinsicGas { have: u64, want: u64 },
    #[error("insufficient funds for gas * price + value")]
    InsufficientFunds,
}

/// Narrow pool interface the miner depends on.
pub trait TxPool: Send + Sync {
    /// Executable transactions grouped by sender and sorted by nonce. With
    /// `enforce_tips`, remote transactions under the pool's minimum tip are
    /// left out.
    fn pending(&self, enforce_tips: bool) -> BTreeMap<Address, Vec<Arc<Transaction>>>;

    /// Senders whose transactions are treated as local.
    fn locals(&self) -> Vec<Address>;

    fn add_local(&self, tx: Transaction) -> Result<(), PoolError>;

    fn add_remotes(&self, txs: Vec<Transaction>) -> Vec<Result<(), PoolError>>;

    fn subscribe_new_txs_event(&self) -> Subscription<NewTxsEvent>;
}
