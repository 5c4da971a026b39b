//! World state stand-in: accounts with nonce and balance, with journaled
//! snapshots so a failing transaction can be rolled back.

use std::collections::BTreeMap;

use alloy_primitives::{Address, B256, U256};

use crate::rlp;
use crate::types::{keccak256, Log};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
}

#[derive(Debug, Clone, Default)]
pub struct StateDb {
    accounts: BTreeMap<Address, Account>,
    snapshots: Vec<BTreeMap<Address, Account>>,
    logs: Vec<Log>,
    tx_hash: B256,
    tx_index: u64,
    prefetching: bool,
}

impl StateDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: impl IntoIterator<Item = (Address, Account)>) -> Self {
        Self {
            accounts: accounts.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn nonce(&self, addr: &Address) -> u64 {
        self.accounts.get(addr).map_or(0, |a| a.nonce)
    }

    pub fn balance(&self, addr: &Address) -> U256 {
        self.accounts.get(addr).map_or(U256::ZERO, |a| a.balance)
    }

    pub fn set_nonce(&mut self, addr: Address, nonce: u64) {
        self.accounts.entry(addr).or_default().nonce = nonce;
    }

    pub fn add_balance(&mut self, addr: Address, amount: U256) {
        let acct = self.accounts.entry(addr).or_default();
        acct.balance = acct.balance.saturating_add(amount);
    }

    /// Subtract `amount`; the caller has already checked the balance covers it.
    pub fn sub_balance(&mut self, addr: Address, amount: U256) {
        let acct = self.accounts.entry(addr).or_default();
        acct.balance = acct.balance.saturating_sub(amount);
    }

    /// Take a snapshot and return its id for [`StateDb::revert_to_snapshot`].
    pub fn snapshot(&mut self) -> usize {
        self.snapshots.push(self.accounts.clone());
        self.snapshots.len() - 1
    }

    pub fn revert_to_snapshot(&mut self, id: usize) {
        if id < self.snapshots.len() {
            self.snapshots.truncate(id + 1);
            if let Some(accounts) = self.snapshots.pop() {
                self.accounts = accounts;
            }
        }
    }

    /// Position subsequent logs under the given transaction.
    pub fn set_tx_context(&mut self, tx_hash: B256, tx_index: u64) {
        self.tx_hash = tx_hash;
        self.tx_index = tx_index;
    }

    pub fn add_log(&mut self, mut log: Log) {
        log.tx_hash = self.tx_hash;
        log.tx_index = self.tx_index;
        log.index = self.logs.len() as u64;
        self.logs.push(log);
    }

    /// Logs emitted by the given transaction.
    pub fn logs_for(&self, tx_hash: &B256) -> Vec<Log> {
        self.logs
            .iter()
            .filter(|l| &l.tx_hash == tx_hash)
            .cloned()
            .collect()
    }

    /// Commit the current journal and return the state root.
    pub fn intermediate_root(&mut self) -> B256 {
        self.snapshots.clear();
        let encoded: Vec<Vec<u8>> = self
            .accounts
            .iter()
            .map(|(addr, acct)| {
                rlp::encode_list(&[
                    rlp::encode_address(addr),
                    rlp::encode_u64(acct.nonce),
                    rlp::encode_u256(&acct.balance),
                ])
            })
            .collect();
        keccak256(rlp::encode_list(&encoded))
    }

    /// Deep copy; the copy shares nothing with the original.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn start_prefetcher(&mut self) {
        self.prefetching = true;
    }

    pub fn stop_prefetcher(&mut self) {
        self.prefetching = false;
    }

    pub fn is_prefetching(&self) -> bool {
        self.prefetching
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_revert_restores_balances() {
        let a = Address::repeat_byte(1);
        let mut state = StateDb::new();
        state.add_balance(a, U256::from(10));
        let snap = state.snapshot();
        state.sub_balance(a, U256::from(4));
        state.set_nonce(a, 3);
        state.revert_to_snapshot(snap);
        assert_eq!(state.balance(&a), U256::from(10));
        assert_eq!(state.nonce(&a), 0);
    }

    #[test]
    fn copy_is_independent() {
        let a = Address::repeat_byte(1);
        let mut state = StateDb::new();
        state.add_balance(a, U256::from(10));
        let copy = state.copy();
        state.add_balance(a, U256::from(5));
        assert_eq!(copy.balance(&a), U256::from(10));
        assert_ne!(copy.clone().intermediate_root(), state.intermediate_root());
    }

    #[test]
    fn logs_carry_tx_context() {
        let mut state = StateDb::new();
        let tx = B256::repeat_byte(7);
        state.set_tx_context(tx, 2);
        state.add_log(Log::default());
        let logs = state.logs_for(&tx);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].tx_index, 2);
    }
}
