use std::time::Duration;

use alloy_primitives::{B256, U256};
use chain::types::{BlockBody, Header, Receipt};
use forks::{ChainConfig, Fork};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::Error;

// eth protocol message codes
pub const STATUS_MSG: u64 = 0x00;
pub const NEW_BLOCK_HASHES_MSG: u64 = 0x01;
pub const TRANSACTIONS_MSG: u64 = 0x02;
pub const GET_BLOCK_HEADERS_MSG: u64 = 0x03;
pub const BLOCK_HEADERS_MSG: u64 = 0x04;
pub const GET_BLOCK_BODIES_MSG: u64 = 0x05;
pub const BLOCK_BODIES_MSG: u64 = 0x06;
pub const NEW_BLOCK_MSG: u64 = 0x07;
pub const NEW_POOLED_TRANSACTION_HASHES_MSG: u64 = 0x08;
pub const GET_POOLED_TRANSACTIONS_MSG: u64 = 0x09;
pub const POOLED_TRANSACTIONS_MSG: u64 = 0x0a;
pub const GET_RECEIPTS_MSG: u64 = 0x0f;
pub const RECEIPTS_MSG: u64 = 0x10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("no status message: first message code {0:#x}")]
    NoStatusMsg(u64),
    #[error("message too long: {0} > {max}", max = MAX_MESSAGE_SIZE)]
    MsgTooLarge(usize),
    #[error("protocol version mismatch: {remote} (!= {local})")]
    ProtocolVersionMismatch { local: u32, remote: u32 },
    #[error("network ID mismatch: {remote} (!= {local})")]
    NetworkIdMismatch { local: u64, remote: u64 },
    #[error("genesis mismatch: {remote} (!= {local})")]
    GenesisMismatch { local: B256, remote: B256 },
    #[error("fork ID rejected: {0}")]
    ForkIdRejected(#[from] ForkIdError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForkIdError {
    #[error("remote announces a fork already passed locally")]
    LocalIncompatibleOrStale,
    #[error("remote needs update")]
    RemoteStale,
    #[error("incompatible fork checksum")]
    Incompatible,
}

/// EIP-2124 fork identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkId {
    pub hash: [u8; 4],
    pub next: u64,
}

fn fork_blocks(config: &ChainConfig) -> Vec<u64> {
    [Fork::Eip155, Fork::London]
        .into_iter()
        .filter_map(|f| config.activation_block(f))
        .collect()
}

impl ForkId {
    /// Fork identifier of a node at `head`.
    pub fn new(config: &ChainConfig, genesis: B256, head: u64) -> Self {
        let filter = ForkFilter::new(genesis, &fork_blocks(config));
        let passed = filter.forks.iter().take_while(|&&f| f <= head).count();
        Self {
            hash: filter.sums[passed],
            next: filter.forks.get(passed).copied().unwrap_or(0),
        }
    }
}

/// EIP-2124 fork filter: validates a remote fork ID against the local schedule.
#[derive(Debug, Clone)]
pub struct ForkFilter {
    /// `sums[0]` = CRC32(genesis); `sums[i]` additionally covers `forks[..i]`.
    sums: Vec<[u8; 4]>,
    /// Sorted, deduplicated fork blocks, genesis excluded.
    forks: Vec<u64>,
}

impl ForkFilter {
    pub fn new(genesis: B256, fork_blocks: &[u64]) -> Self {
        let mut forks = fork_blocks.to_vec();
        forks.sort_unstable();
        forks.dedup();
        forks.retain(|&b| b != 0);

        let mut hash = crc32fast::hash(genesis.as_slice());
        let mut sums = Vec::with_capacity(forks.len() + 1);
        sums.push(hash.to_be_bytes());
        for &fork in &forks {
            let mut hasher = crc32fast::Hasher::new_with_initial(hash);
            hasher.update(&fork.to_be_bytes());
            hash = hasher.finalize();
            sums.push(hash.to_be_bytes());
        }
        Self { sums, forks }
    }

    pub fn from_config(config: &ChainConfig, genesis: B256) -> Self {
        Self::new(genesis, &fork_blocks(config))
    }

    pub fn validate(&self, remote: &ForkId, head: u64) -> Result<(), ForkIdError> {
        // Index of the local checksum: number of forks already passed.
        let current = self.forks.iter().take_while(|&&f| head >= f).count();

        if self.sums[current] == remote.hash {
            if remote.next > 0 && head >= remote.next {
                return Err(ForkIdError::LocalIncompatibleOrStale);
            }
            return Ok(());
        }
        // Remote is behind: it must announce the fork we passed next.
        if let Some(j) = self.sums[..current].iter().position(|s| *s == remote.hash) {
            if self.forks[j] != remote.next {
                return Err(ForkIdError::RemoteStale);
            }
            return Ok(());
        }
        // Remote is ahead: its checksum must be one we will reach.
        if self.sums[current + 1..].contains(&remote.hash) {
            return Ok(());
        }
        Err(ForkIdError::Incompatible)
    }
}

/// Status message exchanged on connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub protocol_version: u32,
    pub network_id: u64,
    pub td: U256,
    pub head: B256,
    pub genesis: B256,
    pub fork_id: ForkId,
}

/// First-message checks: it must be a status message of acceptable size.
pub fn check_status_message(code: u64, size: usize) -> Result<(), HandshakeError> {
    if code != STATUS_MSG {
        return Err(HandshakeError::NoStatusMsg(code));
    }
    if size > MAX_MESSAGE_SIZE {
        return Err(HandshakeError::MsgTooLarge(size));
    }
    Ok(())
}

impl Status {
    /// Validate a remote status against ours. `head` is our head block number.
    pub fn validate(
        &self,
        remote: &Status,
        filter: &ForkFilter,
        head: u64,
    ) -> Result<(), HandshakeError> {
        if remote.network_id != self.network_id {
            return Err(HandshakeError::NetworkIdMismatch {
                local: self.network_id,
                remote: remote.network_id,
            });
        }
        if remote.protocol_version != self.protocol_version {
            return Err(HandshakeError::ProtocolVersionMismatch {
                local: self.protocol_version,
                remote: remote.protocol_version,
            });
        }
        if remote.genesis != self.genesis {
            return Err(HandshakeError::GenesisMismatch {
                local: self.genesis,
                remote: remote.genesis,
            });
        }
        filter.validate(&remote.fork_id, head)?;
        Ok(())
    }
}

/// Origin of a header query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    Hash(B256),
    Number(u64),
}

/// Data delivered in answer to a request.
#[derive(Debug, Clone)]
pub enum ResponsePayload {
    Headers(Vec<Header>),
    Bodies(Vec<BlockBody>),
    Receipts(Vec<Vec<Receipt>>),
}

impl ResponsePayload {
    pub fn code(&self) -> u64 {
        match self {
            Self::Headers(_) => BLOCK_HEADERS_MSG,
            Self::Bodies(_) => BLOCK_BODIES_MSG,
            Self::Receipts(_) => RECEIPTS_MSG,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Headers(h) => h.len(),
            Self::Bodies(b) => b.len(),
            Self::Receipts(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle of an in-flight request. Closing it tells the peer side to stop
/// waiting for the answer.
#[derive(Debug)]
pub struct Request {
    pub id: u64,
    pub peer: String,
    /// Message code of the request.
    pub code: u64,
    /// Message code of the expected response.
    pub want: u64,
    pub sent: Instant,
    cancel: Option<oneshot::Sender<()>>,
}

impl Request {
    /// Create a request handle plus the receiver the serving side watches
    /// for cancellation.
    pub fn new(id: u64, peer: impl Into<String>, code: u64, want: u64) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let req = Self {
            id,
            peer: peer.into(),
            code,
            want,
            sent: Instant::now(),
            cancel: Some(tx),
        };
        (req, rx)
    }

    pub fn close(&mut self) -> Result<(), Error> {
        match self.cancel.take() {
            Some(tx) => {
                let _ = tx.send(());
                Ok(())
            }
            None => Err(Error::RequestClosed(self.id)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_none()
    }
}

/// A peer's answer to a [`Request`].
#[derive(Debug, Clone)]
pub struct Response {
    pub id: u64,
    pub peer: String,
    pub payload: ResponsePayload,
    /// Round trip time measured by the serving side.
    pub time: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> ForkFilter {
        ForkFilter::new(B256::repeat_byte(0xaa), &[100, 200, 300])
    }

    fn id(hash: [u8; 4], next: u64) -> ForkId {
        ForkId { hash, next }
    }

    #[test]
    fn fork_filter_rules() {
        let f = filter();
        // same state
        assert_eq!(f.validate(&id(f.sums[3], 0), 400), Ok(()));
        // remote behind with the right next fork
        assert_eq!(f.validate(&id(f.sums[1], 200), 400), Ok(()));
        assert_eq!(f.validate(&id(f.sums[1], 999), 400), Err(ForkIdError::RemoteStale));
        // we are behind
        assert_eq!(f.validate(&id(f.sums[3], 0), 150), Ok(()));
        // unknown checksum
        assert_eq!(f.validate(&id([0xff; 4], 0), 400), Err(ForkIdError::Incompatible));
        // remote announces a fork we passed without forking
        assert_eq!(
            f.validate(&id(f.sums[3], 350), 400),
            Err(ForkIdError::LocalIncompatibleOrStale)
        );
    }

    #[test]
    fn genesis_only_filter() {
        let f = ForkFilter::new(B256::repeat_byte(0xbb), &[0]);
        assert_eq!(f.validate(&id(f.sums[0], 0), 0), Ok(()));
        assert_eq!(f.validate(&id([0; 4], 0), 0), Err(ForkIdError::Incompatible));
    }

    #[test]
    fn crc32_matches_reference_genesis() {
        let bytes =
            hex::decode("d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3").unwrap();
        let f = ForkFilter::new(B256::from_slice(&bytes), &[1_150_000]);
        assert_eq!(f.sums[0], [0xfc, 0x64, 0xec, 0x04]);
        let mut hasher = crc32fast::Hasher::new_with_initial(0xfc64ec04);
        hasher.update(&1_150_000u64.to_be_bytes());
        assert_eq!(f.sums[1], hasher.finalize().to_be_bytes());
    }

    #[test]
    fn fork_id_tracks_head() {
        let config = ChainConfig {
            eip155_block: Some(10),
            london_block: Some(20),
            ..Default::default()
        };
        let genesis = B256::repeat_byte(1);
        let f = ForkFilter::from_config(&config, genesis);
        assert_eq!(ForkId::new(&config, genesis, 5), id(f.sums[0], 10));
        assert_eq!(ForkId::new(&config, genesis, 15), id(f.sums[1], 20));
        assert_eq!(ForkId::new(&config, genesis, 25), id(f.sums[2], 0));
        assert_eq!(f.validate(&ForkId::new(&config, genesis, 25), 25), Ok(()));
    }

    fn status() -> Status {
        Status {
            protocol_version: 68,
            network_id: 1,
            td: U256::from(100),
            head: B256::repeat_byte(2),
            genesis: B256::repeat_byte(0xaa),
            fork_id: ForkId::new(&ChainConfig::default(), B256::repeat_byte(0xaa), 0),
        }
    }

    #[test]
    fn status_handshake_errors() {
        let local = status();
        let f = ForkFilter::from_config(&ChainConfig::default(), local.genesis);
        assert_eq!(check_status_message(TRANSACTIONS_MSG, 10), Err(HandshakeError::NoStatusMsg(2)));
        assert_eq!(local.validate(&status(), &f, 0), Ok(()));

        let mut remote = status();
        remote.protocol_version = 10;
        assert!(matches!(
            local.validate(&remote, &f, 0),
            Err(HandshakeError::ProtocolVersionMismatch { remote: 10, .. })
        ));

        let mut remote = status();
        remote.network_id = 999;
        assert!(matches!(
            local.validate(&remote, &f, 0),
            Err(HandshakeError::NetworkIdMismatch { .. })
        ));

        let mut remote = status();
        remote.genesis = B256::repeat_byte(3);
        assert!(matches!(
            local.validate(&remote, &f, 0),
            Err(HandshakeError::GenesisMismatch { .. })
        ));

        let mut remote = status();
        remote.fork_id = id([0, 1, 2, 3], 0);
        assert!(matches!(
            local.validate(&remote, &f, 0),
            Err(HandshakeError::ForkIdRejected(_))
        ));
    }

    #[tokio::test]
    async fn request_close_signals_once() {
        let (mut req, cancel) = Request::new(7, "peer", GET_BLOCK_BODIES_MSG, BLOCK_BODIES_MSG);
        req.close().unwrap();
        assert!(cancel.await.is_ok());
        assert!(matches!(req.close(), Err(Error::RequestClosed(7))));
    }
}
