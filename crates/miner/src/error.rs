use alloy_primitives::B256;
use chain::ChainError;
use consensus::ConsensusError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("miner closed")]
    MinerClosed,
    #[error("missing parent {0}")]
    MissingParent(B256),
    #[error("invalid timestamp, parent {parent} given {given}")]
    InvalidTimestamp { parent: u64, given: u64 },
    #[error("extra exceeds max length. {len} > {max}")]
    ExtraTooLong { len: usize, max: usize },
    #[error("block filling aborted: {0}")]
    FillAborted(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}
