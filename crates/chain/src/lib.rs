//! Chain data model, in-memory chain storage and the value-transfer processor.

pub mod blockchain;
pub mod events;
pub mod gas;
pub mod genesis;
pub mod processor;
pub mod rlp;
pub mod state;
pub mod types;

pub use blockchain::{BlockChain, ChainError, ChainHeaderReader, Finalizer, MemoryChain, WriteStatus};
pub use events::{ChainHeadEvent, ChainSideEvent, NewMinedBlockEvent, NewTxsEvent, PendingLogsEvent};
pub use genesis::Genesis;
pub use processor::{apply_transaction, ApplyError, GasPool};
pub use state::{Account, StateDb};
pub use types::{Block, BlockBody, Header, Log, Receipt, Transaction};
