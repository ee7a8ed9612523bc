//! Explains the allocation of a single shard copy

use crate::allocation::decision::{DebugMode, ShardAllocationDecision};
use crate::allocation::service::AllocationService;
use crate::cluster::{ClusterBlockLevel, ClusterState, ShardRouting};
use crate::common::{Error, Result};
use crate::explain::explanation::ClusterAllocationExplanation;
use crate::explain::request::{ClusterAllocationExplainRequest, ShardSelector};
use std::sync::Arc;

pub struct ClusterAllocationExplainService {
    allocation: Arc<AllocationService>,
}

impl ClusterAllocationExplainService {
    pub fn new(allocation: Arc<AllocationService>) -> Self {
        Self { allocation }
    }

    /// Runs the allocator's decision logic for the selected copy against
    /// `state`. Nothing is changed; the same inputs give the same answer.
    pub fn explain(
        &self,
        state: &ClusterState,
        request: &ClusterAllocationExplainRequest,
    ) -> Result<ClusterAllocationExplanation> {
        state.blocks.global_block_error(ClusterBlockLevel::MetadataRead)?;

        let shard = find_shard_to_explain(state, request)?;
        tracing::debug!(%request, shard = %shard, "explaining shard allocation");

        let debug_mode = if request.include_yes_decisions {
            DebugMode::On
        } else {
            DebugMode::ExcludeYesDecisions
        };
        // a copy that is recovering or moving has its decision already made
        let decision = if shard.initializing() || shard.relocating() {
            ShardAllocationDecision::NOT_TAKEN
        } else {
            self.allocation.explain_shard_allocation(&shard, state, debug_mode)
        };

        let current_node = shard.current_node_id().and_then(|id| state.nodes.get(id));
        let relocation_target = shard.relocating_node_id().and_then(|id| state.nodes.get(id));
        let cluster_info = request
            .include_disk_info
            .then(|| self.allocation.cluster_info());

        Ok(ClusterAllocationExplanation::new(
            &shard,
            current_node,
            relocation_target,
            cluster_info,
            decision,
        ))
    }
}

/// Resolves the request's selector to one copy in `state`
pub fn find_shard_to_explain(
    state: &ClusterState,
    request: &ClusterAllocationExplainRequest,
) -> Result<ShardRouting> {
    let (index, shard, primary, current_node) = match &request.selector {
        ShardSelector::AnyUnassigned => {
            return state
                .routing_table
                .all_shards()
                .find(|s| s.unassigned())
                .cloned()
                .ok_or(Error::NoUnassignedShards);
        }
        ShardSelector::Shard {
            index,
            shard,
            primary,
            current_node,
        } => (index, *shard, *primary, current_node.as_deref()),
    };

    let table = state.routing_table.shard_routing_table(index, shard)?;
    let node_id = match current_node {
        Some(id_or_name) => Some(state.nodes.resolve_node(id_or_name)?.id().to_string()),
        None => None,
    };

    if primary {
        let copy = table
            .primary_shard()
            .ok_or_else(|| Error::NoShardToExplain(format!("[{}][{}] primary", index, shard)))?;
        if let Some(node_id) = &node_id {
            if copy.current_node_id() != Some(node_id.as_str()) {
                return Err(Error::PrimaryNotOnNode(node_id.clone()));
            }
        }
        return Ok(copy.clone());
    }

    let replicas = table.replica_shards();
    if let Some(node_id) = &node_id {
        return replicas
            .into_iter()
            .find(|r| r.current_node_id() == Some(node_id.as_str()))
            .cloned()
            .ok_or_else(|| Error::ReplicaNotOnNode(node_id.clone()));
    }

    // prefer the copy most likely to need explaining
    replicas
        .iter()
        .find(|r| r.unassigned())
        .or_else(|| replicas.iter().find(|r| r.started()))
        .or_else(|| replicas.first())
        .map(|r| (*r).clone())
        .ok_or_else(|| Error::NoShardToExplain(format!("[{}][{}] replica", index, shard)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::allocator::ShardsAllocator;
    use crate::allocation::cluster_info::{DiskUsage, InMemoryClusterInfoService, InMemorySnapshotsInfoService};
    use crate::allocation::decision::{AllocateUnassignedDecision, AllocationDecision};
    use crate::allocation::routing_allocation::RoutingAllocation;
    use crate::cluster::{
        AllocationStatus, ClusterBlock, ClusterBlocks, ClusterStateDiff, DiscoveryNode, IndexMetadata, NodeRole,
        RoutingTable, ShardRoutingState,
    };
    use crate::common::AllocationConfig;

    fn node(id: &str, name: &str) -> DiscoveryNode {
        DiscoveryNode::new(id, name, format!("{}:9300", id), [NodeRole::Master, NodeRole::Data])
    }

    fn state(nodes: Vec<DiscoveryNode>, index: IndexMetadata) -> ClusterState {
        let base = ClusterState::empty("test");
        let mut diff = ClusterStateDiff::new(&base).upsert_index(index);
        for n in nodes {
            diff = diff.add_node(n);
        }
        diff.apply(&base, 1, 1).unwrap()
    }

    fn explain_service(info: Arc<InMemoryClusterInfoService>) -> ClusterAllocationExplainService {
        ClusterAllocationExplainService::new(Arc::new(AllocationService::new(
            AllocationConfig::default(),
            info,
            Arc::new(InMemorySnapshotsInfoService::new()),
        )))
    }

    /// Allocates and starts everything the deciders allow
    fn settle(service: &ClusterAllocationExplainService, mut state: ClusterState) -> ClusterState {
        for _ in 0..6 {
            let started: Vec<ShardRouting> = state
                .routing_table
                .shards_with_state(ShardRoutingState::Initializing)
                .into_iter()
                .cloned()
                .collect();
            let table = service
                .allocation
                .execute_round(&state, &started, &[], "test")
                .unwrap();
            state = ClusterStateDiff::new(&state)
                .with_routing_table(table)
                .apply(&state, state.term, state.version + 1)
                .unwrap();
        }
        state
    }

    /// Any decision taken would show up in the explanation
    struct AlwaysDecides;

    impl ShardsAllocator for AlwaysDecides {
        fn allocate(&self, _allocation: &mut RoutingAllocation<'_>) -> Result<()> {
            Ok(())
        }

        fn decide_shard_allocation(
            &self,
            _shard: &ShardRouting,
            _allocation: &RoutingAllocation<'_>,
        ) -> ShardAllocationDecision {
            ShardAllocationDecision {
                allocate_decision: Some(AllocateUnassignedDecision::no(AllocationStatus::DecidersNo, None)),
                move_decision: None,
            }
        }
    }

    #[test]
    fn test_moving_copies_are_not_redecided_by_any_allocator() {
        let allocation = AllocationService::new(
            AllocationConfig::default(),
            Arc::new(InMemoryClusterInfoService::new()),
            Arc::new(InMemorySnapshotsInfoService::new()),
        )
        .with_allocator(Arc::new(AlwaysDecides));
        let service = ClusterAllocationExplainService::new(Arc::new(allocation));

        let base = state(
            vec![node("n1", "alpha"), node("n2", "beta"), node("n3", "gamma")],
            IndexMetadata::new("idx", 2, 0),
        );
        let copies: Vec<ShardRouting> = base.routing_table.all_shards().cloned().collect();
        let relocating = copies[0]
            .initialize("n1", None)
            .unwrap()
            .move_to_started()
            .unwrap()
            .relocate("n2", None)
            .unwrap();
        let initializing = copies[1].initialize("n3", None).unwrap();
        let moving = ClusterStateDiff::new(&base)
            .with_routing_table(RoutingTable::from_shards(vec![relocating, initializing]))
            .apply(&base, 1, 2)
            .unwrap();

        for shard in [0, 1] {
            let explanation = service
                .explain(&moving, &ClusterAllocationExplainRequest::shard("idx", shard, true))
                .unwrap();
            assert!(!explanation.is_decision_taken(), "shard {} was re-decided", shard);
        }
    }

    #[test]
    fn test_unassigned_replica_on_single_node() {
        let service = explain_service(Arc::new(InMemoryClusterInfoService::new()));
        let state = settle(&service, state(vec![node("n1", "alpha")], IndexMetadata::new("idx", 1, 1)));

        let explanation = service
            .explain(&state, &ClusterAllocationExplainRequest::any_unassigned())
            .unwrap();
        assert!(!explanation.primary);
        assert_eq!(explanation.current_state, ShardRoutingState::Unassigned);

        let allocate = explanation.decision.allocate_decision.unwrap();
        assert_eq!(allocate.final_decision, AllocationDecision::No);
        let nodes = allocate.node_decisions.unwrap();
        assert_eq!(nodes.len(), 1);
        let deciders = nodes[0].decision.as_ref().unwrap().decisions();
        assert!(deciders.iter().any(|d| d.label() == Some("same_shard") && d.is_no()));
        // yes decisions are left out unless asked for
        assert!(deciders.iter().all(|d| !d.is_yes()));
    }

    #[test]
    fn test_started_primary_can_remain() {
        let service = explain_service(Arc::new(InMemoryClusterInfoService::new()));
        let state = settle(
            &service,
            state(vec![node("n1", "alpha"), node("n2", "beta")], IndexMetadata::new("idx", 1, 1)),
        );
        let primary_node = state
            .routing_table
            .all_shards()
            .find(|s| s.primary)
            .and_then(|s| s.current_node_id())
            .unwrap()
            .to_string();

        let request = ClusterAllocationExplainRequest::shard("idx", 0, true)
            .with_current_node(primary_node.clone())
            .include_yes_decisions(true);
        let explanation = service.explain(&state, &request).unwrap();
        assert_eq!(explanation.current_node.as_ref().unwrap().id, primary_node);
        let moves = explanation.decision.move_decision.unwrap();
        assert!(moves.can_remain());
        assert!(explanation.decision.allocate_decision.is_none());
    }

    #[test]
    fn test_explain_is_deterministic() {
        let service = explain_service(Arc::new(InMemoryClusterInfoService::new()));
        let state = settle(&service, state(vec![node("n1", "alpha")], IndexMetadata::new("idx", 2, 1)));
        let request = ClusterAllocationExplainRequest::any_unassigned().include_yes_decisions(true);
        let first = service.explain(&state, &request).unwrap();
        let second = service.explain(&state, &request).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    }

    #[test]
    fn test_selector_errors() {
        let service = explain_service(Arc::new(InMemoryClusterInfoService::new()));
        let state = settle(
            &service,
            state(vec![node("n1", "alpha"), node("n2", "beta")], IndexMetadata::new("idx", 1, 0)),
        );

        assert_eq!(
            service
                .explain(&state, &ClusterAllocationExplainRequest::any_unassigned())
                .unwrap_err(),
            Error::NoUnassignedShards
        );
        assert!(matches!(
            service.explain(&state, &ClusterAllocationExplainRequest::shard("missing", 0, true)),
            Err(Error::IndexNotFound(_))
        ));
        assert!(matches!(
            service.explain(&state, &ClusterAllocationExplainRequest::shard("idx", 3, true)),
            Err(Error::ShardNotFound { .. })
        ));
        assert!(matches!(
            service.explain(&state, &ClusterAllocationExplainRequest::shard("idx", 0, false)),
            Err(Error::NoShardToExplain(_))
        ));
        assert!(matches!(
            service.explain(
                &state,
                &ClusterAllocationExplainRequest::shard("idx", 0, true).with_current_node("gamma")
            ),
            Err(Error::UnknownNode(_))
        ));

        let primary_node = state
            .routing_table
            .all_shards()
            .next()
            .and_then(|s| s.current_node_id())
            .unwrap();
        let other = if primary_node == "n1" { "beta" } else { "alpha" };
        assert!(matches!(
            service.explain(
                &state,
                &ClusterAllocationExplainRequest::shard("idx", 0, true).with_current_node(other)
            ),
            Err(Error::PrimaryNotOnNode(_))
        ));
    }

    #[test]
    fn test_disk_info_and_blocks() {
        let info = Arc::new(InMemoryClusterInfoService::new());
        info.set_disk_usage(DiskUsage::new("n1", 100, 50));
        let service = explain_service(info);
        let state = settle(&service, state(vec![node("n1", "alpha")], IndexMetadata::new("idx", 1, 1)));

        let request = ClusterAllocationExplainRequest::any_unassigned().include_disk_info(true);
        let explanation = service.explain(&state, &request).unwrap();
        let cluster_info = explanation.cluster_info.unwrap();
        assert!(cluster_info.node_disk_usage("n1").is_some());

        let blocked = ClusterStateDiff::new(&state)
            .with_blocks(ClusterBlocks::new().with_global_block(ClusterBlock::new(
                1,
                "state not recovered",
                true,
                [ClusterBlockLevel::MetadataRead],
            )))
            .apply(&state, state.term, state.version + 1)
            .unwrap();
        assert!(matches!(
            service.explain(&blocked, &request),
            Err(Error::ClusterBlocked(_))
        ));
    }
}
