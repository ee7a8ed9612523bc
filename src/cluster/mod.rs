//! Cluster state data model

pub mod blocks;
pub mod holder;
pub mod metadata;
pub mod node;
pub mod routing;
pub mod state;

pub use blocks::{ClusterBlock, ClusterBlockLevel, ClusterBlocks};
pub use holder::{ClusterStateHolder, ClusterStateView};
pub use metadata::{CoordinationMetadata, IndexMetadata, Metadata, VotingConfiguration};
pub use node::{DiscoveryNode, DiscoveryNodes, NodeRole};
pub use routing::{
    AllocationStatus, IndexRoutingTable, IndexShardRoutingTable, RoutingTable, ShardId,
    ShardRouting, ShardRoutingState, UnassignedInfo, UnassignedReason,
};
pub use state::{ClusterState, ClusterStateDiff};
