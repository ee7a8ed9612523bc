//! Allocation rounds over a cluster state
//!
//! Every entry point builds a fresh [`RoutingAllocation`] from an immutable
//! state, mutates the working copy, runs the allocator and hands back the
//! resulting routing table. Nothing here touches the state it was given.

use crate::allocation::allocator::{BalancedShardsAllocator, ShardsAllocator};
use crate::allocation::cluster_info::{ClusterInfo, ClusterInfoService, SnapshotsInfoService};
use crate::allocation::deciders::AllocationDeciders;
use crate::allocation::decision::{DebugMode, ShardAllocationDecision};
use crate::allocation::routing_allocation::RoutingAllocation;
use crate::cluster::{ClusterState, RoutingTable, ShardRouting, UnassignedInfo, UnassignedReason};
use crate::common::{AllocationConfig, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A shard copy reported as failed, with the reporter's reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedShard {
    pub routing: ShardRouting,
    pub message: String,
}

impl FailedShard {
    pub fn new(routing: ShardRouting, message: impl Into<String>) -> Self {
        Self {
            routing,
            message: message.into(),
        }
    }
}

pub struct AllocationService {
    deciders: AllocationDeciders,
    allocator: Arc<dyn ShardsAllocator>,
    cluster_info: Arc<dyn ClusterInfoService>,
    snapshots: Arc<dyn SnapshotsInfoService>,
    settings: AllocationConfig,
}

impl AllocationService {
    pub fn new(
        settings: AllocationConfig,
        cluster_info: Arc<dyn ClusterInfoService>,
        snapshots: Arc<dyn SnapshotsInfoService>,
    ) -> Self {
        Self {
            deciders: AllocationDeciders::builtin(),
            allocator: Arc::new(BalancedShardsAllocator::new()),
            cluster_info,
            snapshots,
            settings,
        }
    }

    pub fn with_deciders(mut self, deciders: AllocationDeciders) -> Self {
        self.deciders = deciders;
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn ShardsAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn deciders(&self) -> &AllocationDeciders {
        &self.deciders
    }

    pub fn cluster_info(&self) -> ClusterInfo {
        self.cluster_info.cluster_info()
    }

    /// Static settings with the state's dynamic cluster settings applied
    pub fn effective_settings(&self, state: &ClusterState) -> AllocationConfig {
        self.settings.with_overrides(&state.metadata.cluster_settings)
    }

    /// A disposable allocation over `state`
    pub fn routing_allocation<'a>(
        &'a self,
        state: &'a ClusterState,
        debug_mode: DebugMode,
    ) -> RoutingAllocation<'a> {
        RoutingAllocation::new(
            &self.deciders,
            state,
            self.cluster_info.cluster_info(),
            self.snapshots.snapshot_shard_sizes(),
            self.effective_settings(state),
            debug_mode,
        )
    }

    fn round(
        &self,
        state: &ClusterState,
        reason: &str,
        prepare: impl FnOnce(&mut RoutingAllocation<'_>) -> Result<()>,
    ) -> Result<RoutingTable> {
        let mut allocation = self.routing_allocation(state, DebugMode::Off);
        prepare(&mut allocation)?;
        self.allocator.allocate(&mut allocation)?;
        let routing_table = allocation.into_routing_nodes().to_routing_table();
        routing_table.validate(&state.metadata)?;
        tracing::debug!(
            reason,
            term = state.term,
            version = state.version,
            changed = routing_table != state.routing_table,
            "allocation round finished"
        );
        Ok(routing_table)
    }

    /// Plain allocation round
    pub fn reroute(&self, state: &ClusterState, reason: &str) -> Result<RoutingTable> {
        self.round(state, reason, |_| Ok(()))
    }

    pub fn apply_started_shards(
        &self,
        state: &ClusterState,
        started: &[ShardRouting],
    ) -> Result<RoutingTable> {
        self.execute_round(state, started, &[], "shards started")
    }

    pub fn apply_failed_shards(&self, state: &ClusterState, failed: &[FailedShard]) -> Result<RoutingTable> {
        self.execute_round(state, &[], failed, "shards failed")
    }

    /// Fails every copy on a node that is no longer part of `state`, then
    /// optionally reroutes. `state` must already have the nodes removed.
    pub fn disassociate_dead_nodes(
        &self,
        state: &ClusterState,
        reroute: bool,
        reason: &str,
    ) -> Result<RoutingTable> {
        if !reroute {
            let mut allocation = self.routing_allocation(state, DebugMode::Off);
            fail_dead_node_shards(&mut allocation)?;
            return Ok(allocation.into_routing_nodes().to_routing_table());
        }
        self.round(state, reason, fail_dead_node_shards)
    }

    /// Started and failed reports, dead node cleanup and a reroute, all in
    /// one round
    pub fn execute_round(
        &self,
        state: &ClusterState,
        started: &[ShardRouting],
        failed: &[FailedShard],
        reason: &str,
    ) -> Result<RoutingTable> {
        self.round(state, reason, |allocation| {
            for shard in started {
                start_reported_shard(allocation, shard)?;
            }
            for failure in failed {
                fail_reported_shard(allocation, failure)?;
            }
            fail_dead_node_shards(allocation)
        })
    }

    /// Decision for one copy, made in debug mode on a throwaway allocation
    pub fn explain_shard_allocation(
        &self,
        shard: &ShardRouting,
        state: &ClusterState,
        debug_mode: DebugMode,
    ) -> ShardAllocationDecision {
        let allocation = self.routing_allocation(state, debug_mode);
        self.allocator.decide_shard_allocation(shard, &allocation)
    }
}

/// Current copy of a reported shard, matched by node and shard id
fn current_copy(allocation: &RoutingAllocation<'_>, shard: &ShardRouting) -> Option<ShardRouting> {
    let node_id = shard.current_node_id()?;
    allocation
        .routing_nodes()
        .node(node_id)
        .and_then(|n| n.get_by_shard_id(&shard.shard_id))
        .cloned()
}

fn start_reported_shard(allocation: &mut RoutingAllocation<'_>, shard: &ShardRouting) -> Result<()> {
    match current_copy(allocation, shard) {
        Some(current) if current.initializing() => {
            let started = allocation.routing_nodes_mut().start_shard(&current)?;
            tracing::debug!(shard = %started, "shard started");
        }
        _ => tracing::debug!(shard = %shard, "ignoring stale shard started report"),
    }
    Ok(())
}

fn fail_reported_shard(allocation: &mut RoutingAllocation<'_>, failure: &FailedShard) -> Result<()> {
    let Some(current) = current_copy(allocation, &failure.routing) else {
        tracing::debug!(shard = %failure.routing, "ignoring failure of unknown shard copy");
        return Ok(());
    };
    tracing::warn!(shard = %current, message = %failure.message, "failing shard");
    let info = UnassignedInfo::new(UnassignedReason::AllocationFailed, Some(failure.message.clone()));
    let nodes = allocation.nodes();
    allocation.routing_nodes_mut().fail_shard(&current, info, nodes)
}

fn fail_dead_node_shards(allocation: &mut RoutingAllocation<'_>) -> Result<()> {
    let nodes = allocation.nodes();
    let dead: Vec<String> = allocation
        .routing_nodes()
        .node_ids()
        .into_iter()
        .filter(|id| !nodes.contains(id))
        .collect();

    for node_id in dead {
        let shards: Vec<ShardRouting> = allocation
            .routing_nodes()
            .node(&node_id)
            .map(|n| n.shards().to_vec())
            .unwrap_or_default();
        for shard in shards {
            // an earlier failure may already have removed this copy
            let Some(current) = allocation
                .routing_nodes()
                .node(&node_id)
                .and_then(|n| n.get_by_shard_id(&shard.shard_id))
                .cloned()
            else {
                continue;
            };
            let info = UnassignedInfo::new(
                UnassignedReason::NodeLeft,
                Some(format!("node_left [{}]", node_id)),
            );
            allocation.routing_nodes_mut().fail_shard(&current, info, nodes)?;
        }
        tracing::info!(node = %node_id, "disassociated shards of departed node");
    }
    Ok(())
}
