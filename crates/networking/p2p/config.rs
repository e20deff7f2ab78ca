use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use thiserror::Error;

/// Tunables of the sync core. Every field has a default, so partial
/// configuration files deserialize fine. Durations are in milliseconds.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Headers per fill batch, also the distance between skeleton headers
    pub header_batch_size: u64,
    /// Skeleton headers requested from the master peer per segment
    pub skeleton_size: u64,
    pub max_block_bodies: u64,
    pub max_receipts: u64,
    pub max_state_nodes: u64,
    /// Concurrent requests a single peer may serve per data category
    pub max_in_flight_per_peer: usize,
    /// Round trip a request is sized to take
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub target_rtt: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_request_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_request_timeout: Duration,
    /// Consecutive timeouts after which a peer is dropped
    pub max_peer_timeouts: u32,
    /// How long a fetch waits for a usable peer before giving up.
    /// `None` waits until the session is cancelled.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub peer_wait_timeout: Option<Duration>,
    /// Upper bound for the snap state download before falling back to full import
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_state_fetch: Duration,
    /// Distance of the snap pivot below the target
    pub pivot_distance: u64,
    /// Deepest reorganisation accepted when negotiating the common ancestor
    pub max_fork_ancestry: u64,
    pub max_master_attempts: u32,
    /// State nodes buffered before being flushed to the store
    pub state_commit_batch: usize,
    /// Distinct peers whose fill batch must fail to anchor before the
    /// skeleton itself is blamed
    pub skeleton_mismatch_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            header_batch_size: 192,
            skeleton_size: 128,
            max_block_bodies: 128,
            max_receipts: 256,
            max_state_nodes: 384,
            max_in_flight_per_peer: 1,
            target_rtt: Duration::from_secs(1),
            min_request_timeout: Duration::from_secs(2),
            max_request_timeout: Duration::from_secs(15),
            max_peer_timeouts: 3,
            peer_wait_timeout: Some(Duration::from_secs(60)),
            max_state_fetch: Duration::from_secs(60 * 60),
            pivot_distance: 64,
            max_fork_ancestry: 90_000,
            max_master_attempts: 3,
            state_commit_batch: 1024,
            skeleton_mismatch_limit: 2,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("min_request_timeout ({min:?}) is above max_request_timeout ({max:?})")]
    TimeoutBounds { min: Duration, max: Duration },
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("header_batch_size", self.header_batch_size),
            ("skeleton_size", self.skeleton_size),
            ("max_block_bodies", self.max_block_bodies),
            ("max_receipts", self.max_receipts),
            ("max_state_nodes", self.max_state_nodes),
            ("max_in_flight_per_peer", self.max_in_flight_per_peer as u64),
            ("max_peer_timeouts", u64::from(self.max_peer_timeouts)),
            ("max_master_attempts", u64::from(self.max_master_attempts)),
            ("state_commit_batch", self.state_commit_batch as u64),
            ("skeleton_mismatch_limit", self.skeleton_mismatch_limit as u64),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }
        if self.target_rtt.is_zero() {
            return Err(ConfigError::Zero("target_rtt"));
        }
        if self.min_request_timeout > self.max_request_timeout {
            return Err(ConfigError::TimeoutBounds {
                min: self.min_request_timeout,
                max: self.max_request_timeout,
            });
        }
        Ok(())
    }

    /// Headers covered by one skeleton segment.
    pub fn segment_len(&self) -> u64 {
        self.header_batch_size * self.skeleton_size
    }
}
