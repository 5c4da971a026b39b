//! Transaction application. Only plain value transfers are executed; calldata
//! is charged intrinsic gas and, for calls, surfaced as a single log.

use alloy_primitives::{Address, U256};
use forks::params::{
    TX_DATA_NON_ZERO_GAS, TX_DATA_ZERO_GAS, TX_GAS, TX_GAS_CONTRACT_CREATION,
};
use thiserror::Error;
use tracing::trace;

use crate::state::StateDb;
use crate::types::{
    Header, Log, Receipt, Transaction, TxError, RECEIPT_STATUS_SUCCESSFUL,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("gas limit reached")]
    GasLimitReached,
    #[error("nonce too low: address {address}, tx {tx}, state {state}")]
    NonceTooLow { address: Address, tx: u64, state: u64 },
    #[error("nonce too high: address {address}, tx {tx}, state {state}")]
    NonceTooHigh { address: Address, tx: u64, state: u64 },
    #[error("insufficient funds for gas * price + value: address {address}, have {have}, want {want}")]
    InsufficientFunds {
        address: Address,
        have: U256,
        want: U256,
    },
    #[error("intrinsic gas too low: have {have}, want {want}")]
    IntrinsicGas { have: u64, want: u64 },
    #[error(transparent)]
    FeeCapTooLow(#[from] TxError),
}

/// Gas available for the transactions of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPool(u64);

impl GasPool {
    pub fn new(gas: u64) -> Self {
        Self(gas)
    }

    pub fn gas(&self) -> u64 {
        self.0
    }

    pub fn add_gas(&mut self, amount: u64) {
        self.0 = self.0.saturating_add(amount);
    }

    pub fn sub_gas(&mut self, amount: u64) -> Result<(), ApplyError> {
        if self.0 < amount {
            return Err(ApplyError::GasLimitReached);
        }
        self.0 -= amount;
        Ok(())
    }
}

pub fn intrinsic_gas(data: &[u8], contract_creation: bool) -> u64 {
    let base = if contract_creation {
        TX_GAS_CONTRACT_CREATION
    } else {
        TX_GAS
    };
    let zeros = data.iter().filter(|b| **b == 0).count() as u64;
    let non_zeros = data.len() as u64 - zeros;
    base + zeros * TX_DATA_ZERO_GAS + non_zeros * TX_DATA_NON_ZERO_GAS
}

/// Apply `tx` on top of `state` inside the block described by `header`.
///
/// On error the state and the gas pool are left untouched. On success the
/// returned receipt carries the cumulative gas including this transaction and
/// `used_gas` is advanced.
pub fn apply_transaction(
    gas_pool: &mut GasPool,
    state: &mut StateDb,
    header: &Header,
    tx: &Transaction,
    used_gas: &mut u64,
) -> Result<Receipt, ApplyError> {
    let sender = tx.from;
    let state_nonce = state.nonce(&sender);
    if tx.nonce < state_nonce {
        return Err(ApplyError::NonceTooLow {
            address: sender,
            tx: tx.nonce,
            state: state_nonce,
        });
    }
    if tx.nonce > state_nonce {
        return Err(ApplyError::NonceTooHigh {
            address: sender,
            tx: tx.nonce,
            state: state_nonce,
        });
    }

    let tip = tx.effective_gas_tip(header.base_fee)?;
    let price = tx.effective_gas_price(header.base_fee);
    let want = U256::from(tx.gas) * price + tx.value;
    let have = state.balance(&sender);
    if have < want {
        return Err(ApplyError::InsufficientFunds {
            address: sender,
            have,
            want,
        });
    }

    let gas_used = intrinsic_gas(&tx.data, tx.to.is_none());
    if tx.gas < gas_used {
        return Err(ApplyError::IntrinsicGas {
            have: tx.gas,
            want: gas_used,
        });
    }
    gas_pool.sub_gas(tx.gas)?;
    gas_pool.add_gas(tx.gas - gas_used);

    let fee = U256::from(gas_used) * price;
    state.sub_balance(sender, fee + tx.value);
    state.set_nonce(sender, state_nonce + 1);

    let contract_address = match tx.to {
        Some(to) => {
            state.add_balance(to, tx.value);
            if !tx.data.is_empty() {
                state.add_log(Log {
                    address: to,
                    data: tx.data.clone(),
                    block_number: header.number,
                    ..Default::default()
                });
            }
            None
        }
        None => {
            let created = Address::from_slice(&tx.hash()[12..]);
            state.add_balance(created, tx.value);
            Some(created)
        }
    };
    state.add_balance(header.coinbase, U256::from(gas_used) * tip);

    *used_gas += gas_used;
    let tx_hash = tx.hash();
    trace!(hash = %tx_hash, gas_used, "applied transaction");

    Ok(Receipt {
        status: RECEIPT_STATUS_SUCCESSFUL,
        cumulative_gas_used: *used_gas,
        logs: state.logs_for(&tx_hash),
        tx_hash,
        contract_address,
        gas_used,
        block_number: header.number,
        ..Default::default()
    })
}
