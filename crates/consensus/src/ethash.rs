//! Proof-of-work engine with simulated sealing.
//!
//! Hashing itself is not performed: sealed blocks carry a zero nonce and mix
//! digest, and seal verification only fails for a configured block number.
//! Everything else (difficulty, gas limit, base fee, rewards) follows the
//! network rules.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy_primitives::{Address, B256, U256};
use chain::gas::calc_base_fee;
use chain::types::{Block, Header, Receipt, Transaction};
use chain::{BlockChain, ChainHeaderReader, Finalizer, StateDb};
use forks::params::{
    ALLOWED_FUTURE_BLOCK_TIME, GAS_LIMIT_BOUND_DIVISOR, MAXIMUM_EXTRA_DATA_SIZE, MAX_GAS_LIMIT,
    MAX_UNCLE_DEPTH, MIN_GAS_LIMIT,
};
use forks::ChainConfig;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::difficulty::{calculate_difficulty, validate_difficulty};
use crate::reward::RewardSchedule;
use crate::uncle::check_uncles;
use crate::{ConsensusError, Engine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowMode {
    /// Verify headers, accept every seal except at `fake_fail`.
    Fake,
    /// Accept every header without checks.
    FullFake,
}

pub struct Ethash {
    mode: PowMode,
    rewards: RewardSchedule,
    fake_fail: Option<u64>,
    fake_delay: Duration,
}

impl Ethash {
    pub fn new_faker(rewards: RewardSchedule) -> Self {
        Self {
            mode: PowMode::Fake,
            rewards,
            fake_fail: None,
            fake_delay: Duration::ZERO,
        }
    }

    /// Engine whose seal check fails for block `fail`.
    pub fn new_fake_failer(rewards: RewardSchedule, fail: u64) -> Self {
        Self {
            fake_fail: Some(fail),
            ..Self::new_faker(rewards)
        }
    }

    /// Engine that delivers seals only after `delay`.
    pub fn new_fake_delayer(rewards: RewardSchedule, delay: Duration) -> Self {
        Self {
            fake_delay: delay,
            ..Self::new_faker(rewards)
        }
    }

    pub fn new_full_faker(rewards: RewardSchedule) -> Self {
        Self {
            mode: PowMode::FullFake,
            ..Self::new_faker(rewards)
        }
    }

    pub fn mode(&self) -> PowMode {
        self.mode
    }

    pub fn rewards(&self) -> &RewardSchedule {
        &self.rewards
    }

    /// Reward application for blocks imported by the chain.
    pub fn finalizer(&self) -> Finalizer {
        let rewards = self.rewards.clone();
        Arc::new(move |block: &Block, receipts: &[Receipt], state: &mut StateDb| {
            rewards.accumulate_rewards(state, block.header(), block.uncles());
            rewards.redirect_fees(state, block.header(), block.transactions(), receipts);
        })
    }

    fn verify_against_parent(
        &self,
        config: &ChainConfig,
        header: &Header,
        parent: &Header,
        uncle: bool,
        seal: bool,
        now: u64,
    ) -> Result<(), ConsensusError> {
        if header.extra_data.len() > MAXIMUM_EXTRA_DATA_SIZE {
            return Err(ConsensusError::ExtraTooLong {
                len: header.extra_data.len(),
                max: MAXIMUM_EXTRA_DATA_SIZE,
            });
        }
        if !uncle && header.timestamp > now + ALLOWED_FUTURE_BLOCK_TIME {
            return Err(ConsensusError::FutureBlock);
        }
        if header.timestamp <= parent.timestamp {
            return Err(ConsensusError::OlderBlockTime);
        }
        validate_difficulty(header, parent)?;
        if header.gas_limit > MAX_GAS_LIMIT {
            return Err(ConsensusError::InvalidGasLimit {
                have: header.gas_limit,
                reason: format!("max {MAX_GAS_LIMIT}"),
            });
        }
        if header.gas_used > header.gas_limit {
            return Err(ConsensusError::GasUsedExceedsLimit {
                used: header.gas_used,
                limit: header.gas_limit,
            });
        }
        if config.is_london(header.number) {
            verify_eip1559_header(config, parent, header)?;
        } else {
            if header.base_fee.is_some() {
                return Err(ConsensusError::InvalidBaseFee {
                    have: header.base_fee,
                    want: None,
                });
            }
            verify_gas_limit(parent.gas_limit, header.gas_limit)?;
        }
        if header.number != parent.number + 1 {
            return Err(ConsensusError::InvalidNumber);
        }
        if seal && self.fake_fail == Some(header.number) {
            return Err(ConsensusError::InvalidPow);
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Check that the gas limit moved by less than 1/1024 of the parent limit.
pub fn verify_gas_limit(parent_gas_limit: u64, header_gas_limit: u64) -> Result<(), ConsensusError> {
    let diff = parent_gas_limit.abs_diff(header_gas_limit);
    let limit = parent_gas_limit / GAS_LIMIT_BOUND_DIVISOR;
    if diff >= limit {
        return Err(ConsensusError::InvalidGasLimit {
            have: header_gas_limit,
            reason: format!("want {parent_gas_limit} +-= {}", limit.saturating_sub(1)),
        });
    }
    if header_gas_limit < MIN_GAS_LIMIT {
        return Err(ConsensusError::InvalidGasLimit {
            have: header_gas_limit,
            reason: format!("minimum {MIN_GAS_LIMIT}"),
        });
    }
    Ok(())
}

/// Gas limit and base fee rules of London blocks.
pub fn verify_eip1559_header(
    config: &ChainConfig,
    parent: &Header,
    header: &Header,
) -> Result<(), ConsensusError> {
    let mut parent_gas_limit = parent.gas_limit;
    if !config.is_london(parent.number) {
        parent_gas_limit = parent.gas_limit * config.elasticity_multiplier;
    }
    verify_gas_limit(parent_gas_limit, header.gas_limit)?;
    let want = calc_base_fee(config, parent);
    if header.base_fee != Some(want) {
        return Err(ConsensusError::InvalidBaseFee {
            have: header.base_fee,
            want: Some(want),
        });
    }
    Ok(())
}

impl Engine for Ethash {
    fn author(&self, header: &Header) -> Result<Address, ConsensusError> {
        Ok(header.coinbase)
    }

    fn verify_header(
        &self,
        chain: &dyn ChainHeaderReader,
        header: &Header,
        seal: bool,
    ) -> Result<(), ConsensusError> {
        if self.mode == PowMode::FullFake {
            return Ok(());
        }
        if header.number == 0 {
            return Err(ConsensusError::UnknownAncestor);
        }
        let parent = chain
            .get_header(&header.parent_hash, header.number - 1)
            .ok_or(ConsensusError::UnknownAncestor)?;
        self.verify_against_parent(chain.config(), header, &parent, false, seal, unix_now())
    }

    fn verify_uncles(&self, chain: &dyn BlockChain, block: &Block) -> Result<(), ConsensusError> {
        if self.mode == PowMode::FullFake {
            return Ok(());
        }
        let mut known = HashSet::new();
        let mut cursor = chain.get_block(&block.parent_hash(), block.number().saturating_sub(1));
        for _ in 0..MAX_UNCLE_DEPTH {
            let Some(ancestor) = cursor else { break };
            known.insert(ancestor.hash());
            known.extend(ancestor.uncles().iter().map(Header::hash));
            if ancestor.number() == 0 {
                break;
            }
            cursor = chain.get_block(&ancestor.parent_hash(), ancestor.number() - 1);
        }
        check_uncles(block.header(), block.uncles(), &known)?;
        Ok(())
    }

    fn prepare(&self, chain: &dyn ChainHeaderReader, header: &mut Header) -> Result<(), ConsensusError> {
        if header.number == 0 {
            return Err(ConsensusError::UnknownAncestor);
        }
        let parent = chain
            .get_header(&header.parent_hash, header.number - 1)
            .ok_or(ConsensusError::UnknownAncestor)?;
        header.difficulty = self.calc_difficulty(chain, header.timestamp, &parent);
        Ok(())
    }

    fn finalize(
        &self,
        _chain: &dyn ChainHeaderReader,
        header: &Header,
        state: &mut StateDb,
        _txs: &[Arc<Transaction>],
        uncles: &[Header],
    ) {
        self.rewards.accumulate_rewards(state, header, uncles);
    }

    fn finalize_and_assemble(
        &self,
        chain: &dyn ChainHeaderReader,
        mut header: Header,
        state: &mut StateDb,
        txs: Vec<Arc<Transaction>>,
        uncles: Vec<Header>,
        receipts: &[Receipt],
    ) -> Result<Block, ConsensusError> {
        self.finalize(chain, &header, state, &txs, &uncles);
        self.rewards.redirect_fees(state, &header, &txs, receipts);
        header.state_root = state.intermediate_root();
        Ok(Block::new(header, txs, uncles, receipts))
    }

    fn seal(
        &self,
        chain: &dyn ChainHeaderReader,
        block: Block,
        results: mpsc::Sender<Block>,
        mut stop: oneshot::Receiver<()>,
    ) -> Result<(), ConsensusError> {
        let number = block.number();
        if number > 0 && chain.get_header(&block.parent_hash(), number - 1).is_none() {
            return Err(ConsensusError::UnknownAncestor);
        }
        let seal_hash = self.seal_hash(block.header());
        let mut header = block.header().clone();
        header.nonce = [0u8; 8];
        header.mix_hash = B256::ZERO;
        let sealed = block.with_seal(header);

        if self.fake_delay.is_zero() {
            if matches!(stop.try_recv(), Ok(()) | Err(TryRecvError::Closed)) {
                trace!(sealhash = %seal_hash, "sealing aborted before start");
                return Ok(());
            }
            if results.try_send(sealed).is_err() {
                warn!(sealhash = %seal_hash, "sealing result is not read by miner");
            }
            return Ok(());
        }

        let delay = self.fake_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if results.try_send(sealed).is_err() {
                        warn!(sealhash = %seal_hash, "sealing result is not read by miner");
                    }
                }
                _ = &mut stop => {
                    trace!(sealhash = %seal_hash, "sealing aborted");
                }
            }
        });
        Ok(())
    }

    fn seal_hash(&self, header: &Header) -> B256 {
        header.seal_hash()
    }

    fn calc_difficulty(&self, _chain: &dyn ChainHeaderReader, time: u64, parent: &Header) -> U256 {
        calculate_difficulty(parent, time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain::{Genesis, MemoryChain};

    fn chain() -> MemoryChain {
        MemoryChain::new(Arc::new(ChainConfig::default()), &Genesis::default())
    }

    fn child_of(engine: &Ethash, chain: &MemoryChain, parent: &Header, time: u64) -> Header {
        let mut header = Header {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            gas_limit: parent.gas_limit,
            timestamp: time,
            ..Default::default()
        };
        engine.prepare(chain, &mut header).unwrap();
        header
    }

    #[test]
    fn prepared_header_verifies() {
        let engine = Ethash::new_faker(RewardSchedule::default());
        let chain = chain();
        let genesis = chain.genesis().header().clone();
        let header = child_of(&engine, &chain, &genesis, genesis.timestamp + 2);
        engine.verify_header(&chain, &header, true).unwrap();
    }

    #[test]
    fn header_checks() {
        let engine = Ethash::new_fake_failer(RewardSchedule::default(), 1);
        let chain = chain();
        let genesis = chain.genesis().header().clone();
        let good = child_of(&engine, &chain, &genesis, genesis.timestamp + 2);

        assert!(matches!(
            engine.verify_header(&chain, &good, true),
            Err(ConsensusError::InvalidPow)
        ));
        engine.verify_header(&chain, &good, false).unwrap();

        let mut bad = good.clone();
        bad.extra_data = vec![0; 33];
        assert!(matches!(
            engine.verify_header(&chain, &bad, false),
            Err(ConsensusError::ExtraTooLong { len: 33, .. })
        ));

        let mut bad = good.clone();
        bad.timestamp = genesis.timestamp;
        assert!(matches!(
            engine.verify_header(&chain, &bad, false),
            Err(ConsensusError::OlderBlockTime)
        ));

        let mut bad = good.clone();
        bad.gas_limit = genesis.gas_limit * 2;
        assert!(matches!(
            engine.verify_header(&chain, &bad, false),
            Err(ConsensusError::InvalidGasLimit { .. })
        ));

        let mut bad = good.clone();
        bad.timestamp = unix_now() + 60;
        bad.difficulty = calculate_difficulty(&genesis, bad.timestamp);
        assert!(matches!(
            engine.verify_header(&chain, &bad, false),
            Err(ConsensusError::FutureBlock)
        ));

        let mut orphan = good;
        orphan.parent_hash = B256::repeat_byte(9);
        assert!(matches!(
            engine.verify_header(&chain, &orphan, false),
            Err(ConsensusError::UnknownAncestor)
        ));
    }

    #[test]
    fn full_faker_accepts_anything() {
        let engine = Ethash::new_full_faker(RewardSchedule::default());
        let header = Header {
            number: 42,
            extra_data: vec![0; 100],
            ..Default::default()
        };
        engine.verify_header(&chain(), &header, true).unwrap();
    }

    #[test]
    fn finalize_credits_reward_and_sets_root() {
        let engine = Ethash::new_faker(RewardSchedule::default());
        let chain = chain();
        let coinbase = Address::repeat_byte(7);
        let mut header = child_of(&engine, &chain, chain.genesis().header(), 2);
        header.coinbase = coinbase;
        let mut state = StateDb::new();
        let block = engine
            .finalize_and_assemble(&chain, header, &mut state, vec![], vec![], &[])
            .unwrap();
        assert_eq!(state.balance(&coinbase), engine.rewards().block_reward(1));
        assert_eq!(block.header().state_root, state.intermediate_root());
    }

    #[tokio::test]
    async fn instant_seal_delivers_zeroed_seal() {
        let engine = Ethash::new_faker(RewardSchedule::default());
        let chain = chain();
        let mut header = Header {
            parent_hash: chain.genesis().hash(),
            number: 1,
            ..Default::default()
        };
        header.nonce = [9u8; 8];
        let block = Block::new(header, vec![], vec![], &[]);
        let (tx, mut rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = oneshot::channel();
        engine.seal(&chain, block.clone(), tx, stop_rx).unwrap();
        let sealed = rx.recv().await.unwrap();
        assert_eq!(sealed.header().nonce, [0u8; 8]);
        assert_eq!(engine.seal_hash(sealed.header()), engine.seal_hash(block.header()));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_seal_can_be_aborted() {
        let engine = Ethash::new_fake_delayer(RewardSchedule::default(), Duration::from_secs(5));
        let block = Block::new(Header::default(), vec![], vec![], &[]);
        let (tx, mut rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        engine.seal(&chain(), block.clone(), tx.clone(), stop_rx).unwrap();
        drop(stop_tx);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());

        let (_keep, stop_rx) = oneshot::channel();
        engine.seal(&chain(), block, tx, stop_rx).unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn seal_requires_known_parent() {
        let engine = Ethash::new_faker(RewardSchedule::default());
        let header = Header {
            parent_hash: B256::repeat_byte(7),
            number: 1,
            ..Default::default()
        };
        let block = Block::new(header, vec![], vec![], &[]);
        let (tx, mut rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = oneshot::channel();
        assert!(matches!(
            engine.seal(&chain(), block, tx, stop_rx),
            Err(ConsensusError::UnknownAncestor)
        ));
        assert!(rx.try_recv().is_err());
    }
}
