use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use chain::Transaction;
use tracing::trace;

struct Head {
    tip: U256,
    seq: u64,
    tx: Arc<Transaction>,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    /// Higher tip first; on equal tips the earlier-seen sender wins.
    fn cmp(&self, other: &Self) -> Ordering {
        self.tip
            .cmp(&other.tip)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Iterates pending transactions by effective tip while respecting per-sender
/// nonce order: only the lowest-nonce transaction of each sender is ever a
/// candidate.
pub struct TransactionsByPriceAndNonce {
    txs: BTreeMap<Address, VecDeque<Arc<Transaction>>>,
    heads: BinaryHeap<Head>,
    base_fee: Option<U256>,
    seq: u64,
}

impl TransactionsByPriceAndNonce {
    /// `txs` must be nonce-sorted per sender. Senders whose head transaction
    /// cannot pay `base_fee` are dropped.
    pub fn new(txs: BTreeMap<Address, Vec<Arc<Transaction>>>, base_fee: Option<U256>) -> Self {
        let mut this = Self {
            txs: BTreeMap::new(),
            heads: BinaryHeap::with_capacity(txs.len()),
            base_fee,
            seq: 0,
        };
        for (from, list) in txs {
            let mut list: VecDeque<_> = list.into();
            if let Some(head) = list.pop_front() {
                this.txs.insert(from, list);
                this.push_head(head);
            }
        }
        this
    }

    fn push_head(&mut self, tx: Arc<Transaction>) {
        match tx.effective_gas_tip(self.base_fee) {
            Ok(tip) => {
                self.seq += 1;
                self.heads.push(Head {
                    tip,
                    seq: self.seq,
                    tx,
                });
            }
            Err(err) => {
                trace!(hash = %tx.hash(), %err, "dropping sender with underpriced head");
                self.txs.remove(&tx.from);
            }
        }
    }

    /// Best transaction, without removing it.
    pub fn peek(&self) -> Option<&Arc<Transaction>> {
        self.heads.peek().map(|h| &h.tx)
    }

    /// Replace the best transaction with the next one of the same sender.
    pub fn shift(&mut self) {
        let Some(head) = self.heads.pop() else { return };
        let from = head.tx.from;
        let next = self.txs.get_mut(&from).and_then(VecDeque::pop_front);
        match next {
            Some(tx) => self.push_head(tx),
            None => {
                self.txs.remove(&from);
            }
        }
    }

    /// Drop the best transaction and every later one of its sender.
    pub fn pop(&mut self) {
        if let Some(head) = self.heads.pop() {
            self.txs.remove(&head.tx.from);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }
}
