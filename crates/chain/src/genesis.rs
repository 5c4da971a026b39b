use alloy_primitives::{Address, U256};
use forks::params::{INITIAL_BASE_FEE, MIN_DIFFICULTY};
use forks::ChainConfig;

use crate::state::{Account, StateDb};
use crate::types::{Block, Header};

/// Initial allocation and header parameters of a chain.
#[derive(Debug, Clone)]
pub struct Genesis {
    pub alloc: Vec<(Address, Account)>,
    pub gas_limit: u64,
    pub difficulty: U256,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub coinbase: Address,
}

impl Default for Genesis {
    fn default() -> Self {
        Self {
            alloc: Vec::new(),
            gas_limit: 8_000_000,
            difficulty: U256::from(MIN_DIFFICULTY),
            timestamp: 0,
            extra_data: Vec::new(),
            coinbase: Address::ZERO,
        }
    }
}

impl Genesis {
    /// Fund `addr` with `balance` wei.
    pub fn with_account(mut self, addr: Address, balance: U256) -> Self {
        self.alloc.push((addr, Account { nonce: 0, balance }));
        self
    }

    /// Build the genesis block and its state.
    pub fn to_block(&self, config: &ChainConfig) -> (Block, StateDb) {
        let mut state = StateDb::with_accounts(self.alloc.iter().cloned());
        let header = Header {
            number: 0,
            gas_limit: self.gas_limit,
            difficulty: self.difficulty,
            timestamp: self.timestamp,
            extra_data: self.extra_data.clone(),
            coinbase: self.coinbase,
            state_root: state.intermediate_root(),
            base_fee: config
                .is_london(0)
                .then(|| U256::from(INITIAL_BASE_FEE)),
            ..Default::default()
        };
        (Block::new(header, vec![], vec![], &[]), state)
    }
}
