use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use alloy_primitives::{Address, B256};
use chain::{apply_transaction, ApplyError, Block, BlockChain, GasPool, Header, Log, Receipt, StateDb, Transaction};

use crate::worker::UncleError;

/// Ancestors considered when validating uncles of the sealing block.
pub(crate) const ANCESTOR_WINDOW: usize = 7;

/// Mutable context of one block under construction.
#[derive(Debug, Clone)]
pub struct Environment {
    pub state: StateDb,
    /// Hashes of the last few canonical blocks, parent included.
    pub ancestors: HashSet<B256>,
    /// `ancestors` plus every uncle they already reference.
    pub family: HashSet<B256>,
    /// Transactions successfully applied so far.
    pub tcount: usize,
    /// Created lazily by the first fill pass.
    pub gas_pool: Option<GasPool>,
    pub coinbase: Address,
    pub header: Header,
    pub txs: Vec<Arc<Transaction>>,
    pub receipts: Vec<Receipt>,
    pub uncles: BTreeMap<B256, Header>,
}

impl Environment {
    /// Fresh context on top of `parent`, collecting the ancestry used for
    /// uncle validation.
    pub(crate) fn new(
        chain: &dyn BlockChain,
        parent: &Header,
        mut state: StateDb,
        header: Header,
        coinbase: Address,
    ) -> Self {
        state.start_prefetcher();
        let mut ancestors = HashSet::new();
        let mut family = HashSet::new();
        let mut cursor = chain.get_block(&parent.hash(), parent.number);
        for _ in 0..ANCESTOR_WINDOW {
            let Some(block) = cursor else { break };
            family.extend(block.uncles().iter().map(Header::hash));
            family.insert(block.hash());
            ancestors.insert(block.hash());
            cursor = match block.number() {
                0 => None,
                n => chain.get_block(&block.parent_hash(), n - 1),
            };
        }
        Self {
            state,
            ancestors,
            family,
            tcount: 0,
            gas_pool: None,
            coinbase,
            header,
            txs: Vec::new(),
            receipts: Vec::new(),
            uncles: BTreeMap::new(),
        }
    }

    /// Deep copy, so sealing a snapshot never races with further filling.
    pub fn copy(&self) -> Self {
        Self {
            state: self.state.copy(),
            ..self.clone()
        }
    }

    pub fn uncle_list(&self) -> Vec<Header> {
        self.uncles.values().cloned().collect()
    }

    /// Release resources held for the block. The context stays readable.
    pub fn discard(&mut self) {
        self.state.stop_prefetcher();
    }

    /// Reference `uncle` from the sealing block if it is a valid uncle.
    /// `beacon` marks a block past the terminal difficulty, which carries no uncles.
    pub(crate) fn commit_uncle(&mut self, uncle: &Header, beacon: bool) -> Result<(), UncleError> {
        if beacon {
            return Err(UncleError::BeaconBlock);
        }
        let hash = uncle.hash();
        if self.uncles.contains_key(&hash) {
            return Err(UncleError::NotUnique);
        }
        if self.header.parent_hash == uncle.parent_hash {
            return Err(UncleError::Sibling);
        }
        if !self.ancestors.contains(&uncle.parent_hash) {
            return Err(UncleError::ParentUnknown);
        }
        if self.family.contains(&hash) {
            return Err(UncleError::AlreadyIncluded);
        }
        self.uncles.insert(hash, uncle.clone());
        Ok(())
    }

    /// Apply one transaction. On failure state and gas are rolled back.
    pub(crate) fn commit_transaction(&mut self, tx: &Arc<Transaction>) -> Result<Vec<Log>, ApplyError> {
        let gas_pool = self
            .gas_pool
            .get_or_insert_with(|| GasPool::new(self.header.gas_limit));
        let (snapshot, saved_gas) = (self.state.snapshot(), *gas_pool);
        let mut used = self.header.gas_used;
        match apply_transaction(gas_pool, &mut self.state, &self.header, tx, &mut used) {
            Ok(receipt) => {
                self.header.gas_used = used;
                let logs = receipt.logs.clone();
                self.txs.push(tx.clone());
                self.receipts.push(receipt);
                Ok(logs)
            }
            Err(err) => {
                self.state.revert_to_snapshot(snapshot);
                *gas_pool = saved_gas;
                Err(err)
            }
        }
    }
}

/// A finalized block handed to the sealer, with what is needed to write it
/// once a seal comes back.
#[derive(Debug)]
pub struct Task {
    pub receipts: Vec<Receipt>,
    pub state: StateDb,
    pub block: Block,
    pub created_at: Instant,
}
