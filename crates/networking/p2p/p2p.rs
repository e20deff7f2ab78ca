//! # ethsync P2P Sync
//!
//! Block synchronisation core of an Ethereum client.
//!
//! ## Overview
//!
//! This crate downloads the canonical chain from many unreliable peers at once:
//! - **Peer set**: Tracks what every peer advertised and how fast it serves data
//! - **Fetch queues**: Split work into batches, hand them to idle peers, reassign on failure
//! - **Downloader**: Negotiates the common ancestor and drives light, full and snap sync
//! - **Discovery glue**: Fork id node record entry and fork filtered candidate sources
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Downloader                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────┐  │
//! │  │   Ancestor   │  │  Skeleton +  │  │ Bodies / Receipts │  │
//! │  │  negotiation │  │  header fill │  │    / State nodes  │  │
//! │  └──────────────┘  └──────────────┘  └───────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────┐
//! │     PeerSet     │ │   ChainSink     │ │   StateStore    │
//! └─────────────────┘ └─────────────────┘ └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`peer_set`] | Registered peers, request slots, throughput and round trip estimates |
//! | [`peer`] | Request surface of a connected peer |
//! | [`sync`] | Downloader, fetch queues and sync sessions |
//! | [`chain`] | Chain insertion and state store interfaces |
//! | [`consensus`] | Header verification for the supported consensus engines |
//! | [`discovery`] | Node record "eth" entry and discovery sources |
//! | [`events`] | Publish/subscribe registry |
//! | [`metrics`] | Prometheus downloader meters |
//! | [`config`] | Sync tunables |
//! | [`types`] | Data categories, fetch ranges and request ids |
//!
//! ## Quick Start
//!
//! ```ignore
//! use ethsync_p2p::{Downloader, PeerSet, SyncConfig, SyncMode, metrics::SyncMetrics};
//!
//! let config = SyncConfig::default();
//! let peers = PeerSet::new(&config);
//! let downloader = Downloader::new(
//!     config,
//!     chain,
//!     Some(state_store),
//!     peers.clone(),
//!     ConsensusEngine::default(),
//!     Arc::new(SyncMetrics::new()?),
//! )?;
//!
//! // Peers are registered by the wire layer once their handshake completes
//! peers.register(peer_info)?;
//!
//! downloader.start_sync(SyncMode::Snap, None).await?;
//! ```
//!
//! ## Sync Modes
//!
//! - **Light Sync**: Headers only
//! - **Full Sync**: Download and execute every block
//! - **Snap Sync**: Store blocks and receipts up to a pivot, download the pivot state, execute the rest

pub mod chain;
pub mod config;
pub mod consensus;
pub mod discovery;
pub mod events;
pub mod metrics;
pub mod peer;
pub mod peer_set;
pub mod sync;
pub mod types;

pub use chain::{ChainSink, StateStore};
pub use config::SyncConfig;
pub use consensus::ConsensusEngine;
pub use peer_set::{PeerInfo, PeerSet};
pub use sync::{ChainHeadEvent, Downloader, SyncError, SyncMode, SyncPhase, SyncProgress};
