//! # shardcoord
//!
//! Cluster coordination and shard allocation for a distributed search cluster:
//! - Quorum-based leader election with pre-voting and term bookkeeping
//! - Two-phase publication of immutable cluster states
//! - Follower checks, leader timeouts and voting configuration upkeep
//! - Balanced, decider-driven shard allocation
//! - Side-effect-free explanations of any shard's allocation
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 ClusterNode                  │
//! │                                              │
//! │  Discovery ──► Coordinator ──► StateHolder   │
//! │  (seeds,        (elections,     (applied     │
//! │   strategy)      publish)        state)      │
//! │                    ▲                         │
//! │                    │ proposals               │
//! │            ManagementExecutor                │
//! │                    │                         │
//! │            AllocationService                 │
//! │        (deciders + balanced allocator)       │
//! │                    │                         │
//! │             Explain service                  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Validate a node configuration
//! ```bash
//! shardcoord-node check-config --config ./node.toml
//! ```
//!
//! ### Run a single-node cluster
//! ```bash
//! shardcoord-node serve --config ./node.toml --discovery-type single-node
//! ```
//!
//! ### Explain allocation in an in-process cluster
//! ```bash
//! shardcoord local-cluster --nodes 3 --index logs:2:1
//! shardcoord local-cluster --nodes 1 --index logs:1:1 --shard logs:0:replica
//! ```

pub mod allocation;
pub mod cluster;
pub mod common;
pub mod coordinator;
pub mod discovery;
pub mod explain;
pub mod node;

// Re-export commonly used types
pub use cluster::{ClusterState, ClusterStateDiff, ClusterStateView, DiscoveryNode, IndexMetadata};
pub use common::{Config, Error, Result};
pub use coordinator::{Coordinator, LocalTransport, Mode};
pub use explain::{ClusterAllocationExplainRequest, ClusterAllocationExplanation};
pub use node::ClusterNode;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
