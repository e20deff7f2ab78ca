use ethereum_types::H256;
use hex_literal::hex;

/// keccak256(rlp([])), the ommers hash of a block without ommers.
pub const EMPTY_LIST_HASH: H256 = H256(hex!(
    "1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347"
));

/// keccak256(rlp("")), the root of an empty trie.
pub const EMPTY_TRIE_HASH: H256 = H256(hex!(
    "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
));

/// Difficulty floor of proof-of-work blocks.
pub const MINIMUM_DIFFICULTY: u64 = 131_072;

/// Divisor bounding how far difficulty may move between consecutive blocks.
pub const DIFFICULTY_BOUND_DIVISOR: u64 = 2048;
