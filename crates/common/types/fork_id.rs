//! Fork identifier as specified by EIP-2124.

use std::fmt;

use bytes::BufMut;
use crc32fast::Hasher;
use ethereum_types::{H32, H256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rlp::{Encoder, RLPEncode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForkId {
    /// CRC32 checksum of the genesis hash and all passed fork blocks.
    pub fork_hash: H32,
    /// Block number of the next upcoming fork, 0 if none is scheduled.
    pub fork_next: u64,
}

impl ForkId {
    /// Computes the fork id of a node at `head`.
    /// `forks` must be sorted, deduplicated and must not contain genesis forks,
    /// see [`crate::types::ChainConfig::gather_forks`].
    pub fn new(genesis_hash: H256, forks: &[u64], head: u64) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(genesis_hash.as_bytes());
        let mut fork_next = 0;
        for fork in forks {
            if *fork > head {
                fork_next = *fork;
                break;
            }
            hasher.update(&fork.to_be_bytes());
        }
        Self {
            fork_hash: H32::from(hasher.finalize().to_be_bytes()),
            fork_next,
        }
    }
}

impl fmt::Display for ForkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{}/{}",
            hex::encode(self.fork_hash.as_bytes()),
            self.fork_next
        )
    }
}

impl RLPEncode for ForkId {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.fork_hash.0)
            .encode_field(&self.fork_next)
            .finish();
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ForkIdError {
    /// The remote node is on an older fork and doesn't know about our next one.
    #[error("Remote fork id {0} is stale, it needs a software update")]
    RemoteStale(ForkId),
    /// The remote node runs a different chain, or we are the ones lagging behind.
    #[error("Remote fork id {0} is incompatible or the local node is stale")]
    LocalIncompatibleOrStale(ForkId),
}

/// Validates remote fork ids against the local chain schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForkFilter {
    forks: Vec<u64>,
    /// `sums[i]` is the fork hash after applying `forks[..i]`.
    sums: Vec<H32>,
    head: u64,
}

impl ForkFilter {
    pub fn new(genesis_hash: H256, forks: Vec<u64>, head: u64) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(genesis_hash.as_bytes());
        let mut sums = Vec::with_capacity(forks.len() + 1);
        sums.push(H32::from(hasher.clone().finalize().to_be_bytes()));
        for fork in &forks {
            hasher.update(&fork.to_be_bytes());
            sums.push(H32::from(hasher.clone().finalize().to_be_bytes()));
        }
        Self { forks, sums, head }
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    /// Moves the local head, returns the fork id for the new head.
    pub fn set_head(&mut self, head: u64) -> ForkId {
        self.head = head;
        self.current()
    }

    /// Fork id of the local node at the current head.
    pub fn current(&self) -> ForkId {
        let index = self.current_index();
        ForkId {
            fork_hash: self.sums[index],
            fork_next: self.forks.get(index).copied().unwrap_or(0),
        }
    }

    /// Index of the first fork not yet passed by the local head.
    fn current_index(&self) -> usize {
        self.forks
            .iter()
            .position(|fork| self.head < *fork)
            .unwrap_or(self.forks.len())
    }

    pub fn validate(&self, remote: ForkId) -> Result<(), ForkIdError> {
        let index = self.current_index();

        // Same fork: compatible unless the remote announced a fork we already passed.
        if self.sums[index] == remote.fork_hash {
            if remote.fork_next > 0 && self.head >= remote.fork_next {
                return Err(ForkIdError::LocalIncompatibleOrStale(remote));
            }
            return Ok(());
        }
        // Remote is on one of our past forks: it must know about the fork that followed.
        for (past, sum) in self.sums[..index].iter().enumerate() {
            if *sum == remote.fork_hash {
                if self.forks[past] != remote.fork_next {
                    return Err(ForkIdError::RemoteStale(remote));
                }
                return Ok(());
            }
        }
        // Remote is ahead of us on the same schedule.
        if self.sums[index + 1..].contains(&remote.fork_hash) {
            return Ok(());
        }
        Err(ForkIdError::LocalIncompatibleOrStale(remote))
    }
}
