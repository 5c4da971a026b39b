//! Payloads built on behalf of an external caller: an empty block available
//! immediately, improved in the background while fees keep rising.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use chain::Block;
use sha3::{Digest, Keccak256};
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::error::MinerError;
use crate::worker::{GenerateParams, Worker};

/// Rebuilding stops this long after the payload was requested.
const PAYLOAD_BUILD_DEADLINE: Duration = Duration::from_secs(12);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadId(pub [u8; 8]);

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildPayloadArgs {
    pub parent: B256,
    pub timestamp: u64,
    pub fee_recipient: Address,
    pub random: B256,
}

impl BuildPayloadArgs {
    /// Identifier derived from every build input.
    pub fn id(&self) -> PayloadId {
        let mut hasher = Keccak256::new();
        hasher.update(self.parent);
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.random);
        hasher.update(self.fee_recipient);
        let digest = hasher.finalize();
        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[..8]);
        PayloadId(id)
    }

    fn params(&self, no_txs: bool) -> GenerateParams {
        GenerateParams {
            timestamp: self.timestamp,
            force_time: true,
            parent_hash: Some(self.parent),
            coinbase: self.fee_recipient,
            random: self.random,
            no_uncle: true,
            no_txs,
        }
    }
}

pub struct Payload {
    id: PayloadId,
    empty: Arc<Block>,
    full: watch::Sender<Option<(Arc<Block>, U256)>>,
    stop: watch::Sender<bool>,
}

impl Payload {
    fn new(id: PayloadId, empty: Block) -> Self {
        Self {
            id,
            empty: Arc::new(empty),
            full: watch::channel(None).0,
            stop: watch::channel(false).0,
        }
    }

    pub fn id(&self) -> PayloadId {
        self.id
    }

    /// Replace the full block if `fees` beat the current one.
    fn update(&self, block: Block, fees: U256, elapsed: Duration) {
        let number = block.number();
        let txs = block.transactions().len();
        let updated = self.full.send_if_modified(|full| {
            if full.as_ref().is_some_and(|(_, best)| fees <= *best) {
                return false;
            }
            *full = Some((Arc::new(block), fees));
            true
        });
        if updated {
            info!(id = %self.id, number, txs, %fees, ?elapsed, "updated payload");
        }
    }

    /// Stop improving and return the best block so far.
    pub fn resolve(&self) -> Arc<Block> {
        self.stop.send_replace(true);
        match &*self.full.borrow() {
            Some((block, _)) => block.clone(),
            None => self.empty.clone(),
        }
    }

    pub fn resolve_empty(&self) -> Arc<Block> {
        self.empty.clone()
    }

    /// Wait for the first full block, then stop improving it. Returns `None`
    /// when building stopped, by delivery or deadline, before any full block
    /// was made.
    pub async fn resolve_full(&self) -> Option<Arc<Block>> {
        let mut full = self.full.subscribe();
        let mut stop = self.stop.subscribe();
        tokio::select! {
            biased;
            _ = full.wait_for(Option::is_some) => {}
            _ = stop.wait_for(|stopped| *stopped) => {}
        }
        self.stop.send_replace(true);
        self.full.borrow().as_ref().map(|(block, _)| block.clone())
    }
}

impl Worker {
    /// Start building a payload. The empty block is returned at once and the
    /// full one is rebuilt every recommit interval until resolved or the
    /// build deadline passes.
    pub async fn build_payload(&self, args: BuildPayloadArgs) -> Result<Arc<Payload>, MinerError> {
        let mut client = self.sealing_client();
        let (empty, _) = client.get_sealing_block(args.params(true)).await?;
        let payload = Arc::new(Payload::new(args.id(), empty));

        let recommit = self.recommit();
        let background = payload.clone();
        tokio::spawn(async move {
            let payload = background;
            let mut stop = payload.stop.subscribe();
            let deadline = time::sleep(PAYLOAD_BUILD_DEADLINE);
            tokio::pin!(deadline);
            let rebuild = time::sleep(Duration::ZERO);
            tokio::pin!(rebuild);
            loop {
                tokio::select! {
                    () = &mut rebuild => {
                        let start = Instant::now();
                        match client.get_sealing_block(args.params(false)).await {
                            Ok((block, fees)) => payload.update(block, fees, start.elapsed()),
                            Err(err) => debug!(id = %payload.id, %err, "failed to rebuild payload"),
                        }
                        rebuild.as_mut().reset(Instant::now() + recommit);
                    }
                    _ = stop.changed() => {
                        info!(id = %payload.id, reason = "delivery", "stopping work on payload");
                        return;
                    }
                    () = &mut deadline => {
                        info!(id = %payload.id, reason = "timeout", "stopping work on payload");
                        payload.stop.send_replace(true);
                        return;
                    }
                }
            }
        });
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_depends_on_every_input() {
        let args = BuildPayloadArgs {
            parent: B256::repeat_byte(1),
            timestamp: 10,
            fee_recipient: Address::repeat_byte(2),
            random: B256::repeat_byte(3),
        };
        let id = args.id();
        assert_eq!(id, args.id());
        assert_ne!(id, BuildPayloadArgs { timestamp: 11, ..args }.id());
        assert_ne!(id, BuildPayloadArgs { fee_recipient: Address::repeat_byte(4), ..args }.id());
        assert_ne!(id, BuildPayloadArgs { random: B256::ZERO, ..args }.id());
        assert_ne!(id, BuildPayloadArgs { parent: B256::ZERO, ..args }.id());
        assert_eq!(id.to_string().len(), 18);
    }

    #[test]
    fn update_keeps_the_most_profitable_block() {
        let block = |extra: u8| {
            let header = chain::Header {
                extra_data: vec![extra],
                ..chain::Header::default()
            };
            Block::new(header, Vec::new(), Vec::new(), &[])
        };
        let payload = Payload::new(PayloadId([0; 8]), block(0));
        assert_eq!(payload.resolve_empty().header().extra_data, vec![0]);

        payload.update(block(1), U256::from(5u64), Duration::ZERO);
        payload.update(block(2), U256::from(3u64), Duration::ZERO);
        payload.update(block(3), U256::from(5u64), Duration::ZERO);
        assert_eq!(payload.resolve().header().extra_data, vec![1]);
        assert!(*payload.stop.borrow());
    }

    #[tokio::test]
    async fn resolve_full_after_resolve_returns_nothing() {
        let empty = Block::new(chain::Header::default(), Vec::new(), Vec::new(), &[]);
        let payload = Payload::new(PayloadId([0; 8]), empty);
        payload.resolve();
        let full = tokio::time::timeout(Duration::from_secs(1), payload.resolve_full())
            .await
            .unwrap();
        assert!(full.is_none());
    }

    #[tokio::test]
    async fn resolve_full_waits_for_a_full_block_and_stops() {
        let payload = Arc::new(Payload::new(
            PayloadId([0; 8]),
            Block::new(chain::Header::default(), Vec::new(), Vec::new(), &[]),
        ));
        let waiter = tokio::spawn({
            let payload = payload.clone();
            async move { payload.resolve_full().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let header = chain::Header {
            extra_data: vec![7],
            ..chain::Header::default()
        };
        payload.update(Block::new(header, Vec::new(), Vec::new(), &[]), U256::from(1u64), Duration::ZERO);
        let full = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(full.header().extra_data, vec![7]);
        assert!(*payload.stop.borrow());
    }
}
