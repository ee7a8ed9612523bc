//! Shard allocation
//!
//! A round copies the routing table into [`RoutingNodes`], lets the
//! [`BalancedShardsAllocator`] assign, move and rebalance copies under the
//! [`AllocationDeciders`], and produces a new routing table. The
//! [`ManagementExecutor`] serializes rounds and publishes their results.

pub mod allocator;
pub mod cluster_info;
pub mod deciders;
pub mod decision;
pub mod management;
pub mod routing_allocation;
pub mod routing_nodes;
pub mod service;

pub use allocator::{BalancedShardsAllocator, ShardsAllocator, WeightFunction};
pub use cluster_info::{
    ClusterInfo, ClusterInfoService, DiskUsage, InMemoryClusterInfoService,
    InMemorySnapshotsInfoService, SnapshotShardSizeInfo, SnapshotsInfoService,
};
pub use deciders::{AllocationDecider, AllocationDeciders};
pub use decision::{
    AllocateUnassignedDecision, AllocationDecision, DebugMode, Decision, DecisionType,
    MoveDecision, NodeAllocationResult, ShardAllocationDecision,
};
pub use management::{AllocationTask, ManagementExecutor, RerouteService, StateProposer};
pub use routing_allocation::RoutingAllocation;
pub use routing_nodes::{RoutingNode, RoutingNodes};
pub use service::{AllocationService, FailedShard};
