//! Context of one allocation round

use crate::allocation::cluster_info::{ClusterInfo, SnapshotShardSizeInfo};
use crate::allocation::decision::DebugMode;
use crate::allocation::deciders::AllocationDeciders;
use crate::allocation::routing_nodes::RoutingNodes;
use crate::cluster::{ClusterState, DiscoveryNodes, IndexMetadata, Metadata, ShardRouting};
use crate::common::AllocationConfig;

/// Everything deciders and the allocator look at during one round.
/// Owns its [`RoutingNodes`]; the cluster state is only borrowed.
pub struct RoutingAllocation<'a> {
    deciders: &'a AllocationDeciders,
    routing_nodes: RoutingNodes,
    state: &'a ClusterState,
    cluster_info: ClusterInfo,
    snapshot_shard_sizes: SnapshotShardSizeInfo,
    settings: AllocationConfig,
    debug_mode: DebugMode,
}

impl<'a> RoutingAllocation<'a> {
    /// `settings` should already include the state's dynamic cluster settings
    pub fn new(
        deciders: &'a AllocationDeciders,
        state: &'a ClusterState,
        cluster_info: ClusterInfo,
        snapshot_shard_sizes: SnapshotShardSizeInfo,
        settings: AllocationConfig,
        debug_mode: DebugMode,
    ) -> Self {
        Self {
            deciders,
            routing_nodes: RoutingNodes::from_state(state),
            state,
            cluster_info,
            snapshot_shard_sizes,
            settings,
            debug_mode,
        }
    }

    pub fn deciders(&self) -> &'a AllocationDeciders {
        self.deciders
    }

    pub fn routing_nodes(&self) -> &RoutingNodes {
        &self.routing_nodes
    }

    pub fn routing_nodes_mut(&mut self) -> &mut RoutingNodes {
        &mut self.routing_nodes
    }

    pub fn into_routing_nodes(self) -> RoutingNodes {
        self.routing_nodes
    }

    pub fn state(&self) -> &'a ClusterState {
        self.state
    }

    pub fn nodes(&self) -> &'a DiscoveryNodes {
        &self.state.nodes
    }

    pub fn metadata(&self) -> &'a Metadata {
        &self.state.metadata
    }

    pub fn index_metadata(&self, index: &str) -> Option<&'a IndexMetadata> {
        self.state.metadata.index(index)
    }

    pub fn cluster_info(&self) -> &ClusterInfo {
        &self.cluster_info
    }

    pub fn settings(&self) -> &AllocationConfig {
        &self.settings
    }

    pub fn debug_mode(&self) -> DebugMode {
        self.debug_mode
    }

    pub fn set_debug_mode(&mut self, debug_mode: DebugMode) {
        self.debug_mode = debug_mode;
    }

    pub fn debug_decision(&self) -> bool {
        self.debug_mode.enabled()
    }

    /// Best known size: measured, else from a snapshot being restored
    pub fn shard_size(&self, shard: &ShardRouting) -> Option<u64> {
        self.cluster_info
            .shard_size(shard)
            .or_else(|| self.snapshot_shard_sizes.shard_size(shard))
    }

    /// Data nodes of the state, in id order
    pub fn data_node_ids(&self) -> Vec<String> {
        self.state.nodes.data_nodes().map(|n| n.id().to_string()).collect()
    }
}
