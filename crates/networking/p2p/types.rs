//! Core types shared by the peer set, the fetch queues and the metrics.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Categories of data retrieved from peers during sync.
///
/// Peer concurrency limits, throughput estimates and metrics are all tracked
/// per category, so a peer that is slow serving state can still be a good
/// source of headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    /// Block headers, fetched by number range
    Headers,
    /// Block bodies, fetched by block hash
    Bodies,
    /// Block receipts, fetched by block hash
    Receipts,
    /// State trie nodes, fetched by node hash
    StateNodes,
}

impl DataCategory {
    /// Returns all categories.
    pub fn all() -> &'static [DataCategory] {
        &[
            DataCategory::Headers,
            DataCategory::Bodies,
            DataCategory::Receipts,
            DataCategory::StateNodes,
        ]
    }

    /// Returns a short name for logging and metric names.
    pub fn short_name(self) -> &'static str {
        match self {
            DataCategory::Headers => "headers",
            DataCategory::Bodies => "bodies",
            DataCategory::Receipts => "receipts",
            DataCategory::StateNodes => "states",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

/// A contiguous run of items, `count` items starting at `start`.
/// For headers, bodies and receipts the positions are block numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FetchRange {
    pub start: u64,
    pub count: u64,
}

impl FetchRange {
    pub fn new(start: u64, count: u64) -> Self {
        Self { start, count }
    }

    /// First position after the range.
    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    pub fn contains(&self, position: u64) -> bool {
        self.start <= position && position < self.end()
    }

    pub fn overlaps(&self, other: &FetchRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Display for FetchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count == 0 {
            return write!(f, "[{}, empty)", self.start);
        }
        write!(f, "[{}..={}]", self.start, self.end() - 1)
    }
}

/// Identifier carried by every request sent to a peer.
///
/// Responses are matched against the ids currently in flight, anything else
/// (a late answer to a request already declared lost, or an answer belonging
/// to a previous session) is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId {
    pub session: u64,
    pub attempt: u64,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session, self.attempt)
    }
}
