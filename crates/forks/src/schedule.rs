use alloy_primitives::U256;

use crate::params::{BASE_FEE_CHANGE_DENOMINATOR, ELASTICITY_MULTIPLIER};

/// Hard forks whose activation changes block building or validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    /// Replay-protected transactions (EIP-155).
    Eip155,
    /// Base fee and elastic gas limit (EIP-1559).
    London,
}

/// Chain parameters, constructed once at startup and shared by reference.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub eip155_block: Option<u64>,
    pub london_block: Option<u64>,
    /// Total difficulty at which the legacy sync and PoW block production stop.
    pub terminal_total_difficulty: Option<U256>,
    /// Set once the network is known to have passed the terminal difficulty.
    pub terminal_total_difficulty_passed: bool,
    /// Fixed block period in seconds. Zero means proof-of-work style timing;
    /// a non-zero period enables recommits on new transactions.
    pub period: Option<u64>,
    pub elasticity_multiplier: u64,
    pub base_fee_change_denominator: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 337,
            eip155_block: Some(0),
            london_block: None,
            terminal_total_difficulty: None,
            terminal_total_difficulty_passed: false,
            period: None,
            elasticity_multiplier: ELASTICITY_MULTIPLIER,
            base_fee_change_denominator: BASE_FEE_CHANGE_DENOMINATOR,
        }
    }
}

impl ChainConfig {
    /// Block number at which `fork` activates, if it is scheduled at all.
    pub fn activation_block(&self, fork: Fork) -> Option<u64> {
        match fork {
            Fork::Eip155 => self.eip155_block,
            Fork::London => self.london_block,
        }
    }

    /// Returns true if the given fork is active at the given block number.
    pub fn is_active(&self, fork: Fork, block_number: u64) -> bool {
        self.activation_block(fork)
            .is_some_and(|activation| block_number >= activation)
    }

    pub fn is_london(&self, block_number: u64) -> bool {
        self.is_active(Fork::London, block_number)
    }

    pub fn is_eip155(&self, block_number: u64) -> bool {
        self.is_active(Fork::Eip155, block_number)
    }

    /// Whether new transactions should trigger block rebuilds. Proof-of-work
    /// (no period) always resubmits; a fixed-period chain only when the period is non-zero.
    pub fn resubmits_on_period(&self) -> bool {
        self.period.map_or(true, |p| p > 0)
    }

    /// Whether transactions arriving should immediately seal a block (zero-period dev chains).
    pub fn seals_on_demand(&self) -> bool {
        self.period == Some(0)
    }

    /// Whether the given total difficulty reached the terminal difficulty.
    pub fn reached_ttd(&self, td: U256) -> bool {
        self.terminal_total_difficulty
            .is_some_and(|ttd| td >= ttd)
    }
}
