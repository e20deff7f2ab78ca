use ethereum_types::H256;
use sha3::{Digest, Keccak256};

/// Computes the keccak256 hash of the given data.
pub fn keccak(data: impl AsRef<[u8]>) -> H256 {
    H256::from_slice(&Keccak256::digest(data.as_ref()))
}
