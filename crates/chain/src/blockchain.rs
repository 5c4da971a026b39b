//! Chain access traits and the in-memory chain backing the node.
//!
//! The chain is the only writer of the canonical head. Sync imports blocks
//! through [`BlockChain::insert_chain`] / [`BlockChain::insert_receipt_chain`];
//! the miner writes sealed blocks through
//! [`BlockChain::write_block_and_set_head`]. Both observe head changes through
//! the chain head feed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy_primitives::{B256, U256};
use event::{Feed, Subscription};
use forks::ChainConfig;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{ChainHeadEvent, ChainSideEvent};
use crate::genesis::Genesis;
use crate::processor::{apply_transaction, ApplyError, GasPool};
use crate::state::StateDb;
use crate::types::{receipts_root, transactions_root, compute_uncle_hash, Block, Header, Log, Receipt};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("unknown ancestor: block {number} parent {parent}")]
    UnknownParent { number: u64, parent: B256 },
    #[error("missing trie node: state {0} is not available")]
    MissingState(B256),
    #[error("bad block {number}: {reason}")]
    BadBlock { number: u64, reason: String },
    #[error("insertion is interrupted")]
    InsertStopped,
    #[error("block {number} transaction {index}: {source}")]
    Apply {
        number: u64,
        index: usize,
        #[source]
        source: ApplyError,
    },
}

/// Outcome of writing a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Canon,
    Side,
}

/// Applies consensus rewards to a freshly executed block state.
pub type Finalizer = Arc<dyn Fn(&Block, &[Receipt], &mut StateDb) + Send + Sync>;

/// Read access to headers and total difficulties, as needed by consensus
/// engines and the unconfirmed block tracker.
pub trait ChainHeaderReader: Send + Sync {
    fn config(&self) -> &ChainConfig;
    fn current_header(&self) -> Header;
    fn get_header(&self, hash: &B256, number: u64) -> Option<Header>;
    fn get_header_by_number(&self, number: u64) -> Option<Header>;
    fn get_header_by_hash(&self, hash: &B256) -> Option<Header>;
    fn get_td(&self, hash: &B256, number: u64) -> Option<U256>;
}

/// Full chain access used by sync and block production.
pub trait BlockChain: ChainHeaderReader {
    fn genesis(&self) -> Arc<Block>;
    fn current_block(&self) -> Arc<Block>;
    /// Head of the chain imported with receipts only.
    fn current_snap_block(&self) -> Arc<Block>;
    fn get_block(&self, hash: &B256, number: u64) -> Option<Arc<Block>>;
    fn get_block_by_hash(&self, hash: &B256) -> Option<Arc<Block>>;
    fn get_block_by_number(&self, number: u64) -> Option<Arc<Block>>;
    fn get_receipts_by_hash(&self, hash: &B256) -> Option<Vec<Receipt>>;
    fn has_block(&self, hash: &B256, number: u64) -> bool;
    fn state_at(&self, root: B256) -> Result<StateDb, ChainError>;
    /// Pivot of an unfinished snapshot sync, if any.
    fn last_pivot_number(&self) -> Option<u64>;

    fn write_block_and_set_head(
        &self,
        block: Block,
        receipts: Vec<Receipt>,
        logs: Vec<Log>,
        state: StateDb,
        emit_head_event: bool,
    ) -> Result<WriteStatus, ChainError>;
    /// Execute and import `blocks` in order; returns how many were imported.
    fn insert_chain(&self, blocks: Vec<Block>) -> Result<usize, ChainError>;
    /// Import `blocks` with their receipts without executing them.
    fn insert_receipt_chain(
        &self,
        blocks: Vec<Block>,
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<usize, ChainError>;
    /// Abort any running insertion and reject further ones.
    fn stop_insert(&self);

    fn subscribe_chain_head_event(&self) -> Subscription<ChainHeadEvent>;
    fn subscribe_chain_side_event(&self) -> Subscription<ChainSideEvent>;
}

struct Inner {
    blocks: HashMap<B256, Arc<Block>>,
    receipts: HashMap<B256, Vec<Receipt>>,
    tds: HashMap<B256, U256>,
    canonical: BTreeMap<u64, B256>,
    states: HashMap<B256, StateDb>,
    head: Arc<Block>,
    snap_head: Arc<Block>,
    pivot: Option<u64>,
}

impl Inner {
    fn td_of(&self, block: &Block) -> U256 {
        self.tds.get(&block.hash()).copied().unwrap_or_default()
    }

    fn is_canonical(&self, block: &Block) -> bool {
        self.canonical.get(&block.number()) == Some(&block.hash())
    }

    /// Rewrite the canonical index so that `block` is the head.
    fn set_canonical(&mut self, block: Arc<Block>) {
        let number = block.number();
        let stale: Vec<u64> = self.canonical.range(number + 1..).map(|(n, _)| *n).collect();
        for n in stale {
            self.canonical.remove(&n);
        }
        let mut cursor = Some(block.clone());
        while let Some(b) = cursor {
            if self.canonical.get(&b.number()) == Some(&b.hash()) {
                break;
            }
            self.canonical.insert(b.number(), b.hash());
            cursor = if b.number() == 0 {
                None
            } else {
                self.blocks.get(&b.parent_hash()).cloned()
            };
        }
        self.head = block;
    }

    fn store(&mut self, block: Arc<Block>, mut receipts: Vec<Receipt>) -> U256 {
        let hash = block.hash();
        let parent_td = self.tds.get(&block.parent_hash()).copied().unwrap_or_default();
        let td = parent_td + block.header().difficulty;
        for (i, r) in receipts.iter_mut().enumerate() {
            r.block_hash = hash;
            r.block_number = block.number();
            r.transaction_index = i as u64;
        }
        self.tds.insert(hash, td);
        self.receipts.insert(hash, receipts);
        self.blocks.insert(hash, block);
        td
    }
}

/// In-memory [`BlockChain`].
pub struct MemoryChain {
    config: Arc<ChainConfig>,
    genesis: Arc<Block>,
    inner: RwLock<Inner>,
    finalizer: Option<Finalizer>,
    insert_stopped: AtomicBool,
    head_feed: Feed<ChainHeadEvent>,
    side_feed: Feed<ChainSideEvent>,
}

impl MemoryChain {
    pub fn new(config: Arc<ChainConfig>, genesis: &Genesis) -> Self {
        let (block, mut state) = genesis.to_block(&config);
        let block = Arc::new(block);
        let hash = block.hash();
        let root = state.intermediate_root();
        let mut inner = Inner {
            blocks: HashMap::new(),
            receipts: HashMap::new(),
            tds: HashMap::new(),
            canonical: BTreeMap::new(),
            states: HashMap::new(),
            head: block.clone(),
            snap_head: block.clone(),
            pivot: None,
        };
        inner.store(block.clone(), Vec::new());
        inner.canonical.insert(0, hash);
        inner.states.insert(root, state);
        info!(hash = %hash, "initialised chain from genesis");
        Self {
            config,
            genesis: block,
            inner: RwLock::new(inner),
            finalizer: None,
            insert_stopped: AtomicBool::new(false),
            head_feed: Feed::new(),
            side_feed: Feed::new(),
        }
    }

    /// Apply rewards to imported blocks and verify their state roots.
    pub fn with_finalizer(mut self, finalizer: Finalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    pub fn set_last_pivot_number(&self, pivot: Option<u64>) {
        self.inner.write().pivot = pivot;
    }

    fn check_body(block: &Block) -> Result<(), ChainError> {
        let header = block.header();
        if transactions_root(block.transactions()) != header.transactions_root {
            return Err(ChainError::BadBlock {
                number: block.number(),
                reason: "transaction root mismatch".into(),
            });
        }
        if compute_uncle_hash(block.uncles()) != header.uncle_hash {
            return Err(ChainError::BadBlock {
                number: block.number(),
                reason: "uncle hash mismatch".into(),
            });
        }
        Ok(())
    }

    fn execute(&self, block: &Block, mut state: StateDb) -> Result<(StateDb, Vec<Receipt>), ChainError> {
        let header = block.header();
        let mut gas_pool = GasPool::new(header.gas_limit);
        let mut used_gas = 0;
        let mut receipts = Vec::with_capacity(block.transactions().len());
        for (index, tx) in block.transactions().iter().enumerate() {
            state.set_tx_context(tx.hash(), index as u64);
            let receipt = apply_transaction(&mut gas_pool, &mut state, header, tx, &mut used_gas)
                .map_err(|source| ChainError::Apply {
                    number: block.number(),
                    index,
                    source,
                })?;
            receipts.push(receipt);
        }
        if used_gas != header.gas_used {
            return Err(ChainError::BadBlock {
                number: block.number(),
                reason: format!("gas used mismatch: have {used_gas}, want {}", header.gas_used),
            });
        }
        if receipts_root(&receipts) != header.receipts_root {
            return Err(ChainError::BadBlock {
                number: block.number(),
                reason: "receipt root mismatch".into(),
            });
        }
        if let Some(finalize) = &self.finalizer {
            finalize(block, &receipts, &mut state);
            let root = state.intermediate_root();
            if root != header.state_root {
                return Err(ChainError::BadBlock {
                    number: block.number(),
                    reason: format!("state root mismatch: have {root}, want {}", header.state_root),
                });
            }
        }
        Ok((state, receipts))
    }
}

impl ChainHeaderReader for MemoryChain {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn current_header(&self) -> Header {
        self.inner.read().head.header().clone()
    }

    fn get_header(&self, hash: &B256, number: u64) -> Option<Header> {
        self.get_block(hash, number).map(|b| b.header().clone())
    }

    fn get_header_by_number(&self, number: u64) -> Option<Header> {
        self.get_block_by_number(number).map(|b| b.header().clone())
    }

    fn get_header_by_hash(&self, hash: &B256) -> Option<Header> {
        self.get_block_by_hash(hash).map(|b| b.header().clone())
    }

    fn get_td(&self, hash: &B256, number: u64) -> Option<U256> {
        let inner = self.inner.read();
        let block = inner.blocks.get(hash)?;
        if block.number() != number {
            return None;
        }
        inner.tds.get(hash).copied()
    }
}

impl BlockChain for MemoryChain {
    fn genesis(&self) -> Arc<Block> {
        self.genesis.clone()
    }

    fn current_block(&self) -> Arc<Block> {
        self.inner.read().head.clone()
    }

    fn current_snap_block(&self) -> Arc<Block> {
        self.inner.read().snap_head.clone()
    }

    fn get_block(&self, hash: &B256, number: u64) -> Option<Arc<Block>> {
        self.get_block_by_hash(hash).filter(|b| b.number() == number)
    }

    fn get_block_by_hash(&self, hash: &B256) -> Option<Arc<Block>> {
        self.inner.read().blocks.get(hash).cloned()
    }

    fn get_block_by_number(&self, number: u64) -> Option<Arc<Block>> {
        let inner = self.inner.read();
        let hash = inner.canonical.get(&number)?;
        inner.blocks.get(hash).cloned()
    }

    fn get_receipts_by_hash(&self, hash: &B256) -> Option<Vec<Receipt>> {
        self.inner.read().receipts.get(hash).cloned()
    }

    fn has_block(&self, hash: &B256, number: u64) -> bool {
        self.get_block(hash, number).is_some()
    }

    fn state_at(&self, root: B256) -> Result<StateDb, ChainError> {
        self.inner
            .read()
            .states
            .get(&root)
            .map(StateDb::copy)
            .ok_or(ChainError::MissingState(root))
    }

    fn last_pivot_number(&self) -> Option<u64> {
        self.inner.read().pivot
    }

    fn write_block_and_set_head(
        &self,
        block: Block,
        receipts: Vec<Receipt>,
        _logs: Vec<Log>,
        mut state: StateDb,
        emit_head_event: bool,
    ) -> Result<WriteStatus, ChainError> {
        let block = Arc::new(block);
        let status = {
            let mut inner = self.inner.write();
            if !inner.blocks.contains_key(&block.parent_hash()) {
                return Err(ChainError::UnknownParent {
                    number: block.number(),
                    parent: block.parent_hash(),
                });
            }
            let root = state.intermediate_root();
            inner.states.insert(root, state);
            let td = inner.store(block.clone(), receipts);
            let head_td = inner.td_of(&inner.head.clone());
            if td > head_td {
                inner.set_canonical(block.clone());
                WriteStatus::Canon
            } else {
                WriteStatus::Side
            }
        };
        match status {
            WriteStatus::Canon => {
                if emit_head_event {
                    self.head_feed.send(ChainHeadEvent { block: block.clone() });
                }
            }
            WriteStatus::Side => {
                self.side_feed.send(ChainSideEvent { block: block.clone() });
            }
        }
        debug!(number = block.number(), hash = %block.hash(), ?status, "wrote block");
        Ok(status)
    }

    fn insert_chain(&self, blocks: Vec<Block>) -> Result<usize, ChainError> {
        let mut imported = 0;
        let mut new_head = None;
        let mut sides = Vec::new();
        for block in blocks {
            if self.insert_stopped.load(Ordering::Acquire) {
                return Err(ChainError::InsertStopped);
            }
            if self.has_block(&block.hash(), block.number()) {
                continue;
            }
            Self::check_body(&block)?;
            let (parent_root, parent_known) = {
                let inner = self.inner.read();
                match inner.blocks.get(&block.parent_hash()) {
                    Some(p) => (p.header().state_root, true),
                    None => (B256::ZERO, false),
                }
            };
            if !parent_known {
                return Err(ChainError::UnknownParent {
                    number: block.number(),
                    parent: block.parent_hash(),
                });
            }
            let parent_state = self.state_at(parent_root)?;
            let (state, receipts) = self.execute(&block, parent_state)?;

            let block = Arc::new(block);
            let mut inner = self.inner.write();
            inner.states.insert(block.header().state_root, state);
            let td = inner.store(block.clone(), receipts);
            let head_td = inner.td_of(&inner.head.clone());
            if td > head_td {
                inner.set_canonical(block.clone());
                new_head = Some(block);
            } else if !inner.is_canonical(&block) {
                sides.push(block);
            }
            imported += 1;
        }
        for block in sides {
            self.side_feed.send(ChainSideEvent { block });
        }
        if let Some(block) = new_head {
            info!(number = block.number(), hash = %block.hash(), imported, "imported new chain segment");
            self.head_feed.send(ChainHeadEvent { block });
        }
        Ok(imported)
    }

    fn insert_receipt_chain(
        &self,
        blocks: Vec<Block>,
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<usize, ChainError> {
        let mut imported = 0;
        for (block, receipts) in blocks.into_iter().zip(receipts) {
            if self.insert_stopped.load(Ordering::Acquire) {
                return Err(ChainError::InsertStopped);
            }
            Self::check_body(&block)?;
            if receipts_root(&receipts) != block.header().receipts_root {
                return Err(ChainError::BadBlock {
                    number: block.number(),
                    reason: "receipt root mismatch".into(),
                });
            }
            let mut inner = self.inner.write();
            if !inner.blocks.contains_key(&block.parent_hash()) {
                return Err(ChainError::UnknownParent {
                    number: block.number(),
                    parent: block.parent_hash(),
                });
            }
            let block = Arc::new(block);
            let td = inner.store(block.clone(), receipts);
            let snap_td = inner.td_of(&inner.snap_head.clone());
            if td > snap_td {
                inner.snap_head = block;
            }
            imported += 1;
        }
        if imported > 0 {
            let head = self.current_snap_block();
            info!(number = head.number(), hash = %head.hash(), imported, "imported receipt chain segment");
        }
        Ok(imported)
    }

    fn stop_insert(&self) {
        if !self.insert_stopped.swap(true, Ordering::AcqRel) {
            warn!("chain insertion stopped");
        }
    }

    fn subscribe_chain_head_event(&self) -> Subscription<ChainHeadEvent> {
        self.head_feed.subscribe()
    }

    fn subscribe_chain_side_event(&self) -> Subscription<ChainSideEvent> {
        self.side_feed.subscribe()
    }
}
