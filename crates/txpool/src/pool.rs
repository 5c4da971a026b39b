use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use chain::processor::intrinsic_gas;
use chain::{BlockChain, NewTxsEvent, StateDb, Transaction};
use event::{Feed, Subscription};
use forks::params::WEI_PER_GWEI;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::{PoolError, TxPool};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum tip accepted from remote senders.
    pub price_limit: U256,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            price_limit: U256::from(WEI_PER_GWEI),
        }
    }
}

#[derive(Default)]
struct PoolInner {
    by_sender: HashMap<Address, BTreeMap<u64, Arc<Transaction>>>,
    locals: HashSet<Address>,
}

/// In-memory pool validated against the chain's current head state.
pub struct MemoryPool {
    config: PoolConfig,
    chain: Arc<dyn BlockChain>,
    inner: RwLock<PoolInner>,
    feed: Feed<NewTxsEvent>,
}

impl MemoryPool {
    pub fn new(config: PoolConfig, chain: Arc<dyn BlockChain>) -> Self {
        Self {
            config,
            chain,
            inner: RwLock::new(PoolInner::default()),
            feed: Feed::new(),
        }
    }

    fn head_state(&self) -> Option<StateDb> {
        let head = self.chain.current_block();
        self.chain.state_at(head.header().state_root).ok()
    }

    fn validate(&self, tx: &Transaction, local: bool, state: Option<&StateDb>) -> Result<(), PoolError> {
        let head = self.chain.current_block();
        if tx.gas > head.header().gas_limit {
            return Err(PoolError::GasLimit {
                gas: tx.gas,
                limit: head.header().gas_limit,
            });
        }
        let want = intrinsic_gas(&tx.data, tx.to.is_none());
        if tx.gas < want {
            return Err(PoolError::IntrinsicGas { have: tx.gas, want });
        }
        if !local && tx.gas_tip_cap() < self.config.price_limit {
            return Err(PoolError::Underpriced {
                tip: tx.gas_tip_cap(),
                minimum: self.config.price_limit,
            });
        }
        if let Some(state) = state {
            let nonce = state.nonce(&tx.from);
            if tx.nonce < nonce {
                return Err(PoolError::NonceTooLow {
                    have: tx.nonce,
                    state: nonce,
                });
            }
            if state.balance(&tx.from) < tx.cost() {
                return Err(PoolError::InsufficientFunds);
            }
        }
        Ok(())
    }

    fn insert(&self, tx: Transaction, local: bool) -> Result<Arc<Transaction>, PoolError> {
        let state = self.head_state();
        self.validate(&tx, local, state.as_ref())?;
        let tx = Arc::new(tx);
        let mut inner = self.inner.write();
        if local {
            inner.locals.insert(tx.from);
        }
        let queue = inner.by_sender.entry(tx.from).or_default();
        if let Some(existing) = queue.get(&tx.nonce) {
            if existing.hash() == tx.hash() {
                return Err(PoolError::AlreadyKnown(tx.hash()));
            }
            if existing.gas_price >= tx.gas_price {
                return Err(PoolError::ReplaceUnderpriced);
            }
        }
        queue.insert(tx.nonce, tx.clone());
        trace!(hash = %tx.hash(), from = %tx.from, nonce = tx.nonce, local, "pooled transaction");
        Ok(tx)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_sender.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TxPool for MemoryPool {
    fn pending(&self, enforce_tips: bool) -> BTreeMap<Address, Vec<Arc<Transaction>>> {
        let state = self.head_state();
        let base_fee = self.chain.current_block().base_fee();
        let mut inner = self.inner.write();
        let locals = inner.locals.clone();
        let mut pending = BTreeMap::new();
        for (from, queue) in inner.by_sender.iter_mut() {
            let mut next = state.as_ref().map_or(0, |s| s.nonce(from));
            let stale: Vec<u64> = queue.range(..next).map(|(n, _)| *n).collect();
            for nonce in stale {
                queue.remove(&nonce);
            }
            let mut list = Vec::new();
            for (nonce, tx) in queue.iter() {
                if *nonce != next {
                    break;
                }
                if enforce_tips && !locals.contains(from) {
                    let tip = tx.effective_gas_tip(base_fee).unwrap_or(U256::ZERO);
                    if tip < self.config.price_limit {
                        break;
                    }
                }
                list.push(tx.clone());
                next += 1;
            }
            if !list.is_empty() {
                pending.insert(*from, list);
            }
        }
        inner.by_sender.retain(|_, q| !q.is_empty());
        pending
    }

    fn locals(&self) -> Vec<Address> {
        self.inner.read().locals.iter().copied().collect()
    }

    fn add_local(&self, tx: Transaction) -> Result<(), PoolError> {
        let tx = self.insert(tx, true)?;
        self.feed.send(NewTxsEvent { txs: vec![tx] });
        Ok(())
    }

    fn add_remotes(&self, txs: Vec<Transaction>) -> Vec<Result<(), PoolError>> {
        let mut added = Vec::new();
        let results = txs
            .into_iter()
            .map(|tx| {
                let tx = self.insert(tx, false)?;
                added.push(tx);
                Ok(())
            })
            .collect();
        if !added.is_empty() {
            debug!(count = added.len(), "added remote transactions");
            self.feed.send(NewTxsEvent { txs: added });
        }
        results
    }

    fn subscribe_new_txs_event(&self) -> Subscription<NewTxsEvent> {
        self.feed.subscribe()
    }
}
