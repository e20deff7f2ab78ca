//! Interfaces to the storage side of the node.
//!
//! The sync core never touches the database directly: validated data is handed
//! to a [`ChainSink`] and state trie nodes to a [`StateStore`]. Both are
//! blocking interfaces and are driven from `spawn_blocking` tasks.

use ethsync_common::{
    Bytes, H256, U256,
    types::{Block, BlockHeader, Receipt},
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Parent block {0:#x} not found")]
    ParentNotFound(H256),
    #[error("Missing receipts for block {0}")]
    MissingReceipts(u64),
    #[error("DB error: {0}")]
    Store(String),
}

/// Rejection of a batch handed to the sink. `index` is the position of the
/// first item that could not be inserted, everything before it was imported.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Insertion failed at index {index}: {error}")]
pub struct InsertError {
    pub index: usize,
    pub error: ChainError,
}

impl InsertError {
    pub fn new(index: usize, error: ChainError) -> Self {
        Self { index, error }
    }
}

pub trait ChainSink: Send + Sync + 'static {
    /// Head of the local canonical chain.
    fn current_header(&self) -> Result<BlockHeader, ChainError>;

    fn get_header_by_hash(&self, hash: H256) -> Result<Option<BlockHeader>, ChainError>;

    /// Total difficulty of the chain ending at `hash`, if the block is known.
    fn total_difficulty(&self, hash: H256) -> Result<Option<U256>, ChainError>;

    /// Imports headers only. Used by light sync.
    fn insert_header_chain(&self, headers: &[BlockHeader]) -> Result<(), InsertError>;

    /// Imports and executes full blocks.
    fn insert_chain(&self, blocks: &[Block]) -> Result<(), InsertError>;

    /// Imports blocks together with their receipts, without executing them.
    /// Used for the part of a snap sync below the pivot.
    fn insert_receipt_chain(
        &self,
        blocks: &[Block],
        receipts: &[Vec<Receipt>],
    ) -> Result<(), InsertError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateStoreError {
    #[error("Malformed trie node {0:#x}")]
    MalformedNode(H256),
    #[error("DB error: {0}")]
    Store(String),
}

/// Node level access to the state trie database.
pub trait StateStore: Send + Sync + 'static {
    fn has_node(&self, hash: H256) -> Result<bool, StateStoreError>;

    /// Hashes referenced by an encoded trie node, including the storage roots
    /// and code hashes of account leaves.
    fn child_hashes(&self, hash: H256, node: &[u8]) -> Result<Vec<H256>, StateStoreError>;

    fn commit_nodes(&self, nodes: Vec<(H256, Bytes)>) -> Result<(), StateStoreError>;
}
