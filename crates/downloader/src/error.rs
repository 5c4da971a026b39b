use chain::ChainError;
use thiserror::Error;

use crate::msgrate::TrackerError;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("peer is already registered")]
    AlreadyRegistered,
    #[error("peer is not registered")]
    NotRegistered,
    #[error("busy")]
    Busy,
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("legacy sync reached the merge")]
    MergeTransition,
    #[error("syncing canceled (requested)")]
    Cancelled,
    #[error("retrieved hash chain is invalid: {0}")]
    InvalidChain(String),
    #[error("no fetches pending")]
    NoFetchesPending,
    #[error("stale delivery")]
    StaleDelivery,
    #[error("retrieved block body is invalid")]
    InvalidBody,
    #[error("retrieved receipt is invalid")]
    InvalidReceipt,
    #[error("retrieved header is invalid: {0}")]
    InvalidHeader(String),
    #[error("timeout")]
    Timeout,
    #[error("no peers available or all tried for download")]
    NoPeers,
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Request(#[from] protocols::Error),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

impl DownloadError {
    /// Whether the failure is attributable to the sync peer, which should
    /// then be dropped.
    pub fn is_peer_fault(&self) -> bool {
        match self {
            Self::InvalidChain(_)
            | Self::InvalidHeader(_)
            | Self::InvalidBody
            | Self::InvalidReceipt
            | Self::Timeout
            | Self::NoPeers => true,
            Self::Chain(err) => !matches!(err, ChainError::InsertStopped),
            _ => false,
        }
    }
}
