//! Locally mined blocks awaiting enough confirmations to report their fate.

use std::collections::VecDeque;
use std::sync::Arc;

use alloy_primitives::B256;
use chain::{Block, BlockChain, ChainHeaderReader, Header};
use parking_lot::Mutex;
use tracing::{info, warn};

/// Chain lookups needed to tell canonical, uncled and lost blocks apart.
pub trait ChainRetriever: Send + Sync {
    fn get_header_by_number(&self, number: u64) -> Option<Header>;
    fn get_block_by_number(&self, number: u64) -> Option<Arc<Block>>;
}

impl ChainRetriever for Arc<dyn BlockChain> {
    fn get_header_by_number(&self, number: u64) -> Option<Header> {
        ChainHeaderReader::get_header_by_number(&**self, number)
    }

    fn get_block_by_number(&self, number: u64) -> Option<Arc<Block>> {
        BlockChain::get_block_by_number(&**self, number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UnconfirmedBlock {
    index: u64,
    hash: B256,
}

/// FIFO of mined blocks ordered by height. Entries are dropped, and their
/// outcome logged, once the chain is `depth` blocks past them.
pub struct UnconfirmedBlocks {
    chain: Box<dyn ChainRetriever>,
    depth: u64,
    blocks: Mutex<VecDeque<UnconfirmedBlock>>,
}

impl UnconfirmedBlocks {
    pub fn new(chain: Box<dyn ChainRetriever>, depth: u64) -> Self {
        Self {
            chain,
            depth,
            blocks: Mutex::new(VecDeque::new()),
        }
    }

    /// Track a freshly mined block, first settling any that are deep enough.
    pub fn insert(&self, index: u64, hash: B256) {
        self.shift(index);
        self.blocks.lock().push_back(UnconfirmedBlock { index, hash });
        info!(number = index, %hash, "mined potential block");
    }

    /// Drop every entry with `index + depth <= height`, logging whether it
    /// became canonical, an uncle, or was lost.
    pub fn shift(&self, height: u64) {
        let mut blocks = self.blocks.lock();
        while let Some(next) = blocks.front().copied() {
            if next.index + self.depth > height {
                break;
            }
            match self.chain.get_header_by_number(next.index) {
                None => warn!(number = next.index, hash = %next.hash, "failed to retrieve header of mined block"),
                Some(header) if header.hash() == next.hash => {
                    info!(number = next.index, hash = %next.hash, "block reached canonical chain")
                }
                Some(_) => {
                    if self.is_uncle(next, height) {
                        info!(number = next.index, hash = %next.hash, "block became an uncle");
                    } else {
                        warn!(number = next.index, hash = %next.hash, "block lost to a side chain");
                    }
                }
            }
            blocks.pop_front();
        }
    }

    fn is_uncle(&self, block: UnconfirmedBlock, height: u64) -> bool {
        (block.index..block.index + self.depth)
            .take_while(|n| *n <= height)
            .filter_map(|n| self.chain.get_block_by_number(n))
            .any(|b| b.uncles().iter().any(|u| u.hash() == block.hash))
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    #[cfg(test)]
    fn indexes(&self) -> Vec<u64> {
        self.blocks.lock().iter().map(|b| b.index).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopChain;

    impl ChainRetriever for NoopChain {
        fn get_header_by_number(&self, _number: u64) -> Option<Header> {
            None
        }

        fn get_block_by_number(&self, _number: u64) -> Option<Arc<Block>> {
            None
        }
    }

    fn hash(a: u64, b: u64) -> B256 {
        let mut h = B256::ZERO;
        h.0[0] = a as u8;
        h.0[1] = b as u8;
        h
    }

    #[test]
    fn insert_keeps_only_blocks_within_depth() {
        let limit = 10;
        let pool = UnconfirmedBlocks::new(Box::new(NoopChain), limit);
        for depth in 0..2 * limit {
            for i in 0..depth {
                pool.insert(depth, hash(depth, i));
            }
            for index in pool.indexes() {
                assert!(index + limit > depth, "block {index} left at height {depth}");
            }
        }
    }

    #[test]
    fn shift_drops_blocks_past_depth() {
        let (limit, start) = (10u64, 25u64);
        let pool = UnconfirmedBlocks::new(Box::new(NoopChain), limit);
        for depth in start..start + limit {
            pool.insert(depth, hash(depth, 0));
        }

        pool.shift(start + limit - 1);
        assert_eq!(pool.len(), limit as usize);

        pool.shift(start + limit - 1 + limit / 2);
        assert_eq!(pool.len(), limit as usize / 2);

        pool.shift(start + 2 * limit);
        assert!(pool.is_empty());

        pool.shift(start + 3 * limit);
        assert!(pool.is_empty());
    }
}
