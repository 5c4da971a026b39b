use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::rlp;

/// 8-byte nonce used in PoW.
pub type BlockNonce = [u8; 8];

pub fn keccak256(data: impl AsRef<[u8]>) -> B256 {
    B256::from_slice(&Keccak256::digest(data.as_ref()))
}

/// Keccak of the RLP-encoded empty list.
pub fn empty_uncle_hash() -> B256 {
    keccak256([0xc0])
}

/// Keccak of the RLP-encoded empty string; the root of an empty item list.
pub fn empty_root_hash() -> B256 {
    keccak256([0x80])
}

/// Commitment over an ordered list of RLP-encoded items (transactions, receipts).
pub fn derive_root(items: &[Vec<u8>]) -> B256 {
    if items.is_empty() {
        return empty_root_hash();
    }
    keccak256(rlp::encode_list(items))
}

/// Block header with all PoW fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub parent_hash: B256,
    pub uncle_hash: B256,
    pub coinbase: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub mix_hash: B256,
    pub nonce: BlockNonce,
    pub base_fee: Option<U256>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            parent_hash: B256::ZERO,
            uncle_hash: empty_uncle_hash(),
            coinbase: Address::ZERO,
            state_root: B256::ZERO,
            transactions_root: empty_root_hash(),
            receipts_root: empty_root_hash(),
            difficulty: U256::ZERO,
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra_data: Vec::new(),
            mix_hash: B256::ZERO,
            nonce: [0u8; 8],
            base_fee: None,
        }
    }
}

impl Header {
    /// Keccak of the full RLP encoding.
    pub fn hash(&self) -> B256 {
        keccak256(self.rlp_encode())
    }

    pub fn rlp_encode(&self) -> Vec<u8> {
        let mut fields = self.unsealed_fields();
        // mix and nonce sit between extra data and the base fee
        fields.insert(12, rlp::encode_b256(&self.mix_hash));
        fields.insert(13, rlp::encode_bytes(&self.nonce));
        rlp::encode_list(&fields)
    }

    /// Hash of the header without `mix_hash` and `nonce`: the sealing input.
    pub fn seal_hash(&self) -> B256 {
        keccak256(rlp::encode_list(&self.unsealed_fields()))
    }

    fn unsealed_fields(&self) -> Vec<Vec<u8>> {
        let mut fields = Vec::with_capacity(16);
        fields.push(rlp::encode_b256(&self.parent_hash));
        fields.push(rlp::encode_b256(&self.uncle_hash));
        fields.push(rlp::encode_address(&self.coinbase));
        fields.push(rlp::encode_b256(&self.state_root));
        fields.push(rlp::encode_b256(&self.transactions_root));
        fields.push(rlp::encode_b256(&self.receipts_root));
        fields.push(rlp::encode_u256(&self.difficulty));
        fields.push(rlp::encode_u64(self.number));
        fields.push(rlp::encode_u64(self.gas_limit));
        fields.push(rlp::encode_u64(self.gas_used));
        fields.push(rlp::encode_u64(self.timestamp));
        fields.push(rlp::encode_bytes(&self.extra_data));
        if let Some(base_fee) = &self.base_fee {
            fields.push(rlp::encode_u256(base_fee));
        }
        fields
    }
}

/// Compute the uncle hash for a list of uncle headers.
pub fn compute_uncle_hash(uncles: &[Header]) -> B256 {
    if uncles.is_empty() {
        return empty_uncle_hash();
    }
    let encoded: Vec<Vec<u8>> = uncles.iter().map(Header::rlp_encode).collect();
    keccak256(rlp::encode_list(&encoded))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxError {
    #[error("max fee per gas less than block base fee: fee cap {fee_cap}, base fee {base_fee}")]
    FeeCapTooLow { fee_cap: U256, base_fee: U256 },
}

/// A transaction with its sender already resolved. Signature handling is the
/// pool's business; block building only needs the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// `Some` for replay-protected transactions.
    pub chain_id: Option<u64>,
    pub nonce: u64,
    /// Legacy gas price, or the fee cap of a dynamic-fee transaction.
    pub gas_price: U256,
    /// Priority fee of a dynamic-fee transaction.
    pub gas_tip_cap: Option<U256>,
    pub gas: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Vec<u8>,
    pub from: Address,
}

impl Transaction {
    pub fn hash(&self) -> B256 {
        keccak256(self.rlp_encode())
    }

    pub fn rlp_encode(&self) -> Vec<u8> {
        let mut fields = vec![
            rlp::encode_u64(self.nonce),
            rlp::encode_u256(&self.gas_price),
        ];
        if let Some(tip) = &self.gas_tip_cap {
            fields.push(rlp::encode_u256(tip));
        }
        fields.extend([
            rlp::encode_u64(self.gas),
            rlp::encode_opt_address(&self.to),
            rlp::encode_u256(&self.value),
            rlp::encode_bytes(&self.data),
            rlp::encode_address(&self.from),
        ]);
        if let Some(id) = self.chain_id {
            fields.push(rlp::encode_u64(id));
        }
        rlp::encode_list(&fields)
    }

    pub fn protected(&self) -> bool {
        self.chain_id.is_some()
    }

    pub fn gas_fee_cap(&self) -> U256 {
        self.gas_price
    }

    pub fn gas_tip_cap(&self) -> U256 {
        self.gas_tip_cap.unwrap_or(self.gas_price)
    }

    /// Tip paid to the block producer per unit of gas under `base_fee`.
    pub fn effective_gas_tip(&self, base_fee: Option<U256>) -> Result<U256, TxError> {
        let Some(base_fee) = base_fee else {
            return Ok(self.gas_tip_cap());
        };
        let fee_cap = self.gas_fee_cap();
        if fee_cap < base_fee {
            return Err(TxError::FeeCapTooLow { fee_cap, base_fee });
        }
        Ok(self.gas_tip_cap().min(fee_cap - base_fee))
    }

    /// Price actually charged per unit of gas.
    pub fn effective_gas_price(&self, base_fee: Option<U256>) -> U256 {
        match base_fee {
            Some(base_fee) => (base_fee + self.gas_tip_cap()).min(self.gas_fee_cap()),
            None => self.gas_price,
        }
    }

    /// Maximum the sender can be charged: `gas * fee_cap + value`.
    pub fn cost(&self) -> U256 {
        U256::from(self.gas) * self.gas_fee_cap() + self.value
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub tx_hash: B256,
    pub tx_index: u64,
    pub block_hash: B256,
    pub index: u64,
    pub removed: bool,
}

impl Log {
    fn rlp_encode(&self) -> Vec<u8> {
        let topics: Vec<Vec<u8>> = self.topics.iter().map(rlp::encode_b256).collect();
        rlp::encode_list(&[
            rlp::encode_address(&self.address),
            rlp::encode_list(&topics),
            rlp::encode_bytes(&self.data),
        ])
    }
}

pub const RECEIPT_STATUS_FAILED: u64 = 0;
pub const RECEIPT_STATUS_SUCCESSFUL: u64 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt {
    pub status: u64,
    pub cumulative_gas_used: u64,
    pub logs: Vec<Log>,
    pub tx_hash: B256,
    pub contract_address: Option<Address>,
    pub gas_used: u64,
    pub block_hash: B256,
    pub block_number: u64,
    pub transaction_index: u64,
}

impl Receipt {
    /// Consensus encoding: status, cumulative gas and logs.
    pub fn rlp_encode(&self) -> Vec<u8> {
        let logs: Vec<Vec<u8>> = self.logs.iter().map(Log::rlp_encode).collect();
        rlp::encode_list(&[
            rlp::encode_u64(self.status),
            rlp::encode_u64(self.cumulative_gas_used),
            rlp::encode_list(&logs),
        ])
    }
}

pub fn receipts_root(receipts: &[Receipt]) -> B256 {
    let encoded: Vec<Vec<u8>> = receipts.iter().map(Receipt::rlp_encode).collect();
    derive_root(&encoded)
}

pub fn transactions_root(txs: &[Arc<Transaction>]) -> B256 {
    let encoded: Vec<Vec<u8>> = txs.iter().map(|tx| tx.rlp_encode()).collect();
    derive_root(&encoded)
}

/// Transactions and uncles of a block, as delivered by peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockBody {
    pub transactions: Vec<Arc<Transaction>>,
    pub uncles: Vec<Header>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    header: Header,
    transactions: Vec<Arc<Transaction>>,
    uncles: Vec<Header>,
}

impl Block {
    /// Assemble a block, filling in the header's transaction, uncle and
    /// receipt commitments.
    pub fn new(
        mut header: Header,
        transactions: Vec<Arc<Transaction>>,
        uncles: Vec<Header>,
        receipts: &[Receipt],
    ) -> Self {
        header.transactions_root = transactions_root(&transactions);
        header.uncle_hash = compute_uncle_hash(&uncles);
        header.receipts_root = receipts_root(receipts);
        Self {
            header,
            transactions,
            uncles,
        }
    }

    /// Rebuild a block from a header and a body that was already checked against it.
    pub fn from_parts(header: Header, body: BlockBody) -> Self {
        Self {
            header,
            transactions: body.transactions,
            uncles: body.uncles,
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Replace the header, e.g. with a sealed copy.
    pub fn with_seal(&self, header: Header) -> Self {
        Self {
            header,
            transactions: self.transactions.clone(),
            uncles: self.uncles.clone(),
        }
    }

    pub fn hash(&self) -> B256 {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> B256 {
        self.header.parent_hash
    }

    pub fn gas_used(&self) -> u64 {
        self.header.gas_used
    }

    pub fn base_fee(&self) -> Option<U256> {
        self.header.base_fee
    }

    pub fn transactions(&self) -> &[Arc<Transaction>] {
        &self.transactions
    }

    pub fn uncles(&self) -> &[Header] {
        &self.uncles
    }

    pub fn body(&self) -> BlockBody {
        BlockBody {
            transactions: self.transactions.clone(),
            uncles: self.uncles.clone(),
        }
    }
}
