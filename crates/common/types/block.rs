use bytes::{BufMut, Bytes};
use ethereum_types::{Address, Bloom, H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    constants::EMPTY_LIST_HASH,
    rlp::{Encoder, RLPEncode},
    utils::keccak,
};

use super::Receipt;

pub type BlockNumber = u64;
pub type BlockHash = H256;

/// Header part of a block on the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub parent_hash: H256,
    #[serde(rename = "sha3Uncles")]
    pub ommers_hash: H256,
    #[serde(rename = "miner")]
    pub coinbase: Address,
    pub state_root: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: BlockNumber,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Bytes,
    #[serde(rename = "mixHash")]
    pub prev_randao: H256,
    pub nonce: u64,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            parent_hash: H256::zero(),
            ommers_hash: EMPTY_LIST_HASH,
            coinbase: Address::zero(),
            state_root: H256::zero(),
            transactions_root: EMPTY_LIST_HASH,
            receipts_root: EMPTY_LIST_HASH,
            logs_bloom: Bloom::zero(),
            difficulty: U256::zero(),
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra_data: Bytes::new(),
            prev_randao: H256::zero(),
            nonce: 0,
        }
    }
}

impl RLPEncode for BlockHeader {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.parent_hash)
            .encode_field(&self.ommers_hash)
            .encode_field(&self.coinbase)
            .encode_field(&self.state_root)
            .encode_field(&self.transactions_root)
            .encode_field(&self.receipts_root)
            .encode_field(&self.logs_bloom)
            .encode_field(&self.difficulty)
            .encode_field(&self.number)
            .encode_field(&self.gas_limit)
            .encode_field(&self.gas_used)
            .encode_field(&self.timestamp)
            .encode_field(&self.extra_data)
            .encode_field(&self.prev_randao)
            .encode_field(&self.nonce.to_be_bytes())
            .finish();
    }
}

impl BlockHeader {
    /// keccak256 of the RLP encoded header.
    pub fn hash(&self) -> BlockHash {
        keccak(self.encode_to_vec())
    }

    /// Whether the block carries no transactions and no ommers, so its body
    /// can be reconstructed without asking a peer.
    pub fn has_empty_body(&self) -> bool {
        self.transactions_root == EMPTY_LIST_HASH && self.ommers_hash == EMPTY_LIST_HASH
    }

    /// Whether the block produced no receipts.
    pub fn has_empty_receipts(&self) -> bool {
        self.receipts_root == EMPTY_LIST_HASH
    }
}

/// The body of a block on the chain.
/// Transactions are kept in their encoded form, decoding them is the job of the execution layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    pub transactions: Vec<Bytes>,
    #[serde(rename = "uncles")]
    pub ommers: Vec<BlockHeader>,
}

impl BlockBody {
    pub const fn empty() -> Self {
        Self {
            transactions: Vec::new(),
            ommers: Vec::new(),
        }
    }

    pub fn compute_transactions_root(&self) -> H256 {
        compute_transactions_root(&self.transactions)
    }

    pub fn compute_ommers_hash(&self) -> H256 {
        compute_ommers_hash(&self.ommers)
    }
}

impl RLPEncode for BlockBody {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.transactions)
            .encode_field(&self.ommers)
            .finish();
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    pub fn new(header: BlockHeader, body: BlockBody) -> Self {
        Self { header, body }
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }
}

pub fn compute_transactions_root(transactions: &[Bytes]) -> H256 {
    keccak(transactions.to_vec().encode_to_vec())
}

pub fn compute_ommers_hash(ommers: &[BlockHeader]) -> H256 {
    keccak(ommers.to_vec().encode_to_vec())
}

pub fn compute_receipts_root(receipts: &[Receipt]) -> H256 {
    keccak(receipts.to_vec().encode_to_vec())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidBlockBodyError {
    #[error("Transactions root does not match the one in the header, expected {expected:#x}, got {computed:#x}")]
    TransactionsRootMismatch { expected: H256, computed: H256 },
    #[error("Ommers hash does not match the one in the header, expected {expected:#x}, got {computed:#x}")]
    OmmersHashMismatch { expected: H256, computed: H256 },
    #[error("Receipts root does not match the one in the header, expected {expected:#x}, got {computed:#x}")]
    ReceiptsRootMismatch { expected: H256, computed: H256 },
}

/// Checks that the body matches the commitments of its header.
pub fn validate_block_body(header: &BlockHeader, body: &BlockBody) -> Result<(), InvalidBlockBodyError> {
    let computed = body.compute_transactions_root();
    if computed != header.transactions_root {
        return Err(InvalidBlockBodyError::TransactionsRootMismatch {
            expected: header.transactions_root,
            computed,
        });
    }
    let computed = body.compute_ommers_hash();
    if computed != header.ommers_hash {
        return Err(InvalidBlockBodyError::OmmersHashMismatch {
            expected: header.ommers_hash,
            computed,
        });
    }
    Ok(())
}

/// Checks that the receipts match the receipts root of their header.
pub fn validate_receipts(header: &BlockHeader, receipts: &[Receipt]) -> Result<(), InvalidBlockBodyError> {
    let computed = compute_receipts_root(receipts);
    if computed != header.receipts_root {
        return Err(InvalidBlockBodyError::ReceiptsRootMismatch {
            expected: header.receipts_root,
            computed,
        });
    }
    Ok(())
}
