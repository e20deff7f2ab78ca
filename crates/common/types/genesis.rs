use ethereum_types::H256;
use serde::{Deserialize, Serialize};

use super::ForkId;

/// Chain parameters the sync core needs: the chain id and the block numbers
/// at which protocol upgrades activate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    /// Current chain identifier
    pub chain_id: u64,

    /// Block numbers for the block where each fork was activated.
    /// Order and duplicates don't matter, 0 means the fork is active since genesis.
    #[serde(default)]
    pub fork_activation_blocks: Vec<u64>,
}

impl ChainConfig {
    /// Sorted and deduplicated fork blocks, without the ones active since genesis.
    pub fn gather_forks(&self) -> Vec<u64> {
        let mut forks: Vec<u64> = self
            .fork_activation_blocks
            .iter()
            .copied()
            .filter(|block| *block != 0)
            .collect();
        forks.sort_unstable();
        forks.dedup();
        forks
    }

    /// Fork identifier of a node on this chain whose head is at `head`.
    pub fn fork_id(&self, genesis_hash: H256, head: u64) -> ForkId {
        ForkId::new(genesis_hash, &self.gather_forks(), head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_forks_sorts_and_deduplicates() {
        let config = ChainConfig {
            chain_id: 1,
            fork_activation_blocks: vec![0, 7_280_000, 1_150_000, 7_280_000, 0],
        };
        assert_eq!(config.gather_forks(), vec![1_150_000, 7_280_000]);
    }

    #[test]
    fn chain_config_deserializes_from_json() {
        let config: ChainConfig =
            serde_json::from_str(r#"{"chainId": 5, "forkActivationBlocks": [10, 20]}"#)
                .expect("valid config");
        assert_eq!(config.chain_id, 5);
        assert_eq!(config.fork_activation_blocks, vec![10, 20]);
    }
}
