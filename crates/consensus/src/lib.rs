//! Consensus engine interface and the proof-of-work engine used by the node.

pub mod difficulty;
pub mod ethash;
pub mod reward;
pub mod uncle;

use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use chain::types::{Block, Header, Receipt, Transaction};
use chain::{BlockChain, StateDb};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use chain::ChainHeaderReader;
pub use difficulty::{calculate_difficulty, DifficultyError};
pub use ethash::{Ethash, PowMode};
pub use reward::{RewardEra, RewardSchedule};
pub use uncle::{check_uncles, UncleRuleError};

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("unknown ancestor")]
    UnknownAncestor,
    #[error("block in the future")]
    FutureBlock,
    #[error("timestamp older than parent")]
    OlderBlockTime,
    #[error("invalid block number")]
    InvalidNumber,
    #[error("extra-data too long: {len} > {max}")]
    ExtraTooLong { len: usize, max: usize },
    #[error(transparent)]
    Difficulty(#[from] DifficultyError),
    #[error("invalid gas limit: have {have}, {reason}")]
    InvalidGasLimit { have: u64, reason: String },
    #[error("invalid gasUsed: have {used}, gasLimit {limit}")]
    GasUsedExceedsLimit { used: u64, limit: u64 },
    #[error("invalid base fee: have {have:?}, want {want:?}")]
    InvalidBaseFee { have: Option<U256>, want: Option<U256> },
    #[error("invalid proof-of-work")]
    InvalidPow,
    #[error(transparent)]
    Uncles(#[from] UncleRuleError),
}

/// Block validation, preparation and sealing.
///
/// `seal` is asynchronous: it returns immediately and later delivers at most
/// one sealed block on `results`, or nothing once `stop` resolves (the sender
/// is dropped or fires). The block's parent must be known to `chain`.
pub trait Engine: Send + Sync {
    /// Address credited for the block.
    fn author(&self, header: &Header) -> Result<Address, ConsensusError>;

    fn verify_header(
        &self,
        chain: &dyn ChainHeaderReader,
        header: &Header,
        seal: bool,
    ) -> Result<(), ConsensusError>;

    fn verify_uncles(&self, chain: &dyn BlockChain, block: &Block) -> Result<(), ConsensusError>;

    /// Fill the consensus fields (difficulty) of a header under construction.
    fn prepare(&self, chain: &dyn ChainHeaderReader, header: &mut Header) -> Result<(), ConsensusError>;

    /// Apply post-transaction state changes (rewards).
    fn finalize(
        &self,
        chain: &dyn ChainHeaderReader,
        header: &Header,
        state: &mut StateDb,
        txs: &[Arc<Transaction>],
        uncles: &[Header],
    );

    /// Finalize and assemble the block, computing the final state root.
    fn finalize_and_assemble(
        &self,
        chain: &dyn ChainHeaderReader,
        header: Header,
        state: &mut StateDb,
        txs: Vec<Arc<Transaction>>,
        uncles: Vec<Header>,
        receipts: &[Receipt],
    ) -> Result<Block, ConsensusError>;

    fn seal(
        &self,
        chain: &dyn ChainHeaderReader,
        block: Block,
        results: mpsc::Sender<Block>,
        stop: oneshot::Receiver<()>,
    ) -> Result<(), ConsensusError>;

    fn seal_hash(&self, header: &Header) -> B256;

    fn calc_difficulty(&self, chain: &dyn ChainHeaderReader, time: u64, parent: &Header) -> U256;

    /// Current local hash rate, if the engine mines.
    fn hashrate(&self) -> f64 {
        0.0
    }

    fn close(&self) {}
}
