//! Header verification rules of the supported consensus engines.
//!
//! The engine is a closed set selected when the node starts, so it is modelled
//! as an enum instead of a trait object. Sealing is not part of the sync core.

use ethsync_common::{
    Address, U256,
    constants::{DIFFICULTY_BOUND_DIVISOR, MINIMUM_DIFFICULTY},
    types::BlockHeader,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum extra data allowed in proof of work headers.
pub const MAX_EXTRA_DATA_SIZE: usize = 32;
/// Clique vanity prefix.
pub const CLIQUE_EXTRA_VANITY: usize = 32;
/// Clique signer seal suffix.
pub const CLIQUE_EXTRA_SEAL: usize = 65;

const DIFFICULTY_IN_TURN: u64 = 2;
const DIFFICULTY_NO_TURN: u64 = 1;
// The largest step the difficulty formula can take from one block to the next.
const MAX_DIFFICULTY_STEP: u64 = 99;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthashConfig {
    pub minimum_difficulty: u64,
}

impl Default for EthashConfig {
    fn default() -> Self {
        Self {
            minimum_difficulty: MINIMUM_DIFFICULTY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliqueConfig {
    /// Seconds between blocks
    pub period: u64,
    /// Blocks after which votes are reset and a checkpoint is taken
    pub epoch: u64,
}

impl Default for CliqueConfig {
    fn default() -> Self {
        Self {
            period: 15,
            epoch: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "snake_case")]
pub enum ConsensusEngine {
    Ethash(EthashConfig),
    Clique(CliqueConfig),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Block number {number} does not follow parent number {parent}")]
    NonSequentialNumber { number: u64, parent: u64 },
    #[error("Parent hash mismatch at block {number}")]
    ParentHashMismatch { number: u64 },
    #[error("Timestamp {timestamp} is not after parent timestamp {parent}")]
    TimestampOrder { timestamp: u64, parent: u64 },
    #[error("Gas used {gas_used} exceeds gas limit {gas_limit}")]
    GasUsedOverLimit { gas_used: u64, gas_limit: u64 },
    #[error("Extra data too long: {len} bytes")]
    ExtraDataTooLong { len: usize },
    #[error("Extra data too short: {len} bytes")]
    ExtraDataTooShort { len: usize },
    #[error("Difficulty {difficulty} below minimum {minimum}")]
    DifficultyTooLow { difficulty: U256, minimum: u64 },
    #[error("Difficulty {difficulty} out of bounds for parent difficulty {parent}")]
    DifficultyOutOfBounds { difficulty: U256, parent: U256 },
    #[error("Invalid clique difficulty {0}")]
    InvalidCliqueDifficulty(U256),
    #[error("Block period violated: {timestamp} is earlier than {earliest}")]
    PeriodViolation { timestamp: u64, earliest: u64 },
}

impl ConsensusEngine {
    pub fn name(&self) -> &'static str {
        match self {
            ConsensusEngine::Ethash(_) => "ethash",
            ConsensusEngine::Clique(_) => "clique",
        }
    }

    /// Beneficiary of the block. Clique signers are recovered from the seal,
    /// which is left to the consensus crate, so no author is reported for them.
    pub fn author(&self, header: &BlockHeader) -> Option<Address> {
        match self {
            ConsensusEngine::Ethash(_) => Some(header.coinbase),
            ConsensusEngine::Clique(_) => None,
        }
    }

    /// RPC namespaces the engine contributes.
    pub fn apis(&self) -> &'static [&'static str] {
        match self {
            ConsensusEngine::Ethash(_) => &["ethash"],
            ConsensusEngine::Clique(_) => &["clique"],
        }
    }

    /// Verifies `header` against its `parent`. Seals are not checked.
    pub fn verify_header(
        &self,
        header: &BlockHeader,
        parent: &BlockHeader,
    ) -> Result<(), ConsensusError> {
        verify_common(header, parent)?;
        match self {
            ConsensusEngine::Ethash(config) => verify_ethash(config, header, parent),
            ConsensusEngine::Clique(config) => verify_clique(config, header, parent),
        }
    }
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        ConsensusEngine::Ethash(EthashConfig::default())
    }
}

fn verify_common(header: &BlockHeader, parent: &BlockHeader) -> Result<(), ConsensusError> {
    if parent.number.checked_add(1) != Some(header.number) {
        return Err(ConsensusError::NonSequentialNumber {
            number: header.number,
            parent: parent.number,
        });
    }
    if header.parent_hash != parent.hash() {
        return Err(ConsensusError::ParentHashMismatch {
            number: header.number,
        });
    }
    if header.gas_used > header.gas_limit {
        return Err(ConsensusError::GasUsedOverLimit {
            gas_used: header.gas_used,
            gas_limit: header.gas_limit,
        });
    }
    Ok(())
}

fn verify_ethash(
    config: &EthashConfig,
    header: &BlockHeader,
    parent: &BlockHeader,
) -> Result<(), ConsensusError> {
    if header.timestamp <= parent.timestamp {
        return Err(ConsensusError::TimestampOrder {
            timestamp: header.timestamp,
            parent: parent.timestamp,
        });
    }
    if header.extra_data.len() > MAX_EXTRA_DATA_SIZE {
        return Err(ConsensusError::ExtraDataTooLong {
            len: header.extra_data.len(),
        });
    }
    if header.difficulty < U256::from(config.minimum_difficulty) {
        return Err(ConsensusError::DifficultyTooLow {
            difficulty: header.difficulty,
            minimum: config.minimum_difficulty,
        });
    }
    let max_step = parent.difficulty / U256::from(DIFFICULTY_BOUND_DIVISOR)
        * U256::from(MAX_DIFFICULTY_STEP);
    let delta = if header.difficulty > parent.difficulty {
        header.difficulty - parent.difficulty
    } else {
        parent.difficulty - header.difficulty
    };
    if delta > max_step {
        return Err(ConsensusError::DifficultyOutOfBounds {
            difficulty: header.difficulty,
            parent: parent.difficulty,
        });
    }
    Ok(())
}

fn verify_clique(
    config: &CliqueConfig,
    header: &BlockHeader,
    parent: &BlockHeader,
) -> Result<(), ConsensusError> {
    let earliest = parent.timestamp.saturating_add(config.period);
    if header.timestamp < earliest {
        return Err(ConsensusError::PeriodViolation {
            timestamp: header.timestamp,
            earliest,
        });
    }
    if header.extra_data.len() < CLIQUE_EXTRA_VANITY + CLIQUE_EXTRA_SEAL {
        return Err(ConsensusError::ExtraDataTooShort {
            len: header.extra_data.len(),
        });
    }
    if header.difficulty != U256::from(DIFFICULTY_IN_TURN)
        && header.difficulty != U256::from(DIFFICULTY_NO_TURN)
    {
        return Err(ConsensusError::InvalidCliqueDifficulty(header.difficulty));
    }
    Ok(())
}
