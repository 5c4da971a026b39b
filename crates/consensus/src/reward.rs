//! Block issuance policy, held as data so networks can tune it without code changes.

use std::sync::Arc;

use alloy_primitives::{address, Address, U256};
use chain::types::{Receipt, Transaction};
use chain::{Header, StateDb};
use tracing::trace;

/// One issuance era: blocks up to and including `last_block` pay `reward` wei.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardEra {
    pub last_block: u64,
    pub reward: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardSchedule {
    /// Eras ordered by `last_block`.
    pub eras: Vec<RewardEra>,
    /// Reward for blocks past the last era and below the cap.
    pub tail_reward: U256,
    /// No rewards are paid and fees stay with the miner from this block on.
    pub supply_cap_block: u64,
    /// Receives transaction fees until the supply cap.
    pub fee_pool: Address,
    /// Uncles are accepted but never paid.
    pub uncle_reward: U256,
}

/// Wei per millionth of a coin.
const WEI_PER_MICRO: u64 = 1_000_000_000_000;

impl Default for RewardSchedule {
    fn default() -> Self {
        let era = |last_block: u64, micro_units: u64| RewardEra {
            last_block,
            reward: U256::from(micro_units) * U256::from(WEI_PER_MICRO),
        };
        Self {
            eras: vec![
                era(4_000_000, 2_000_000),
                era(8_000_000, 1_000_000),
                era(16_000_000, 500_000),
                era(32_000_000, 250_000),
                era(64_000_000, 125_000),
                era(128_000_000, 62_500),
            ],
            tail_reward: U256::from(31_250_000_000_000_000u64),
            supply_cap_block: 1_290_406_400,
            fee_pool: address!("366D7b25624795a6f7071829c7A50C3D116C69E3"),
            uncle_reward: U256::ZERO,
        }
    }
}

impl RewardSchedule {
    /// Issuance for the block at `number`.
    pub fn block_reward(&self, number: u64) -> U256 {
        if number >= self.supply_cap_block {
            return U256::ZERO;
        }
        self.eras
            .iter()
            .find(|era| number <= era.last_block)
            .map_or(self.tail_reward, |era| era.reward)
    }

    /// Credit the block reward to the coinbase.
    pub fn accumulate_rewards(&self, state: &mut StateDb, header: &Header, uncles: &[Header]) {
        let reward = self.block_reward(header.number);
        if !reward.is_zero() {
            state.add_balance(header.coinbase, reward);
        }
        if !self.uncle_reward.is_zero() {
            for uncle in uncles {
                state.add_balance(uncle.coinbase, self.uncle_reward);
            }
        }
        trace!(number = header.number, %reward, "accumulated block reward");
    }

    /// Move the block's transaction fees from the coinbase to the fee pool
    /// while the supply cap has not been reached.
    pub fn redirect_fees(
        &self,
        state: &mut StateDb,
        header: &Header,
        txs: &[Arc<Transaction>],
        receipts: &[Receipt],
    ) {
        if header.number >= self.supply_cap_block {
            return;
        }
        let fees = txs
            .iter()
            .zip(receipts)
            .fold(U256::ZERO, |acc, (tx, r)| acc + U256::from(r.gas_used) * tx.gas_price);
        if fees.is_zero() {
            return;
        }
        state.sub_balance(header.coinbase, fees);
        state.add_balance(self.fee_pool, fees);
    }
}
