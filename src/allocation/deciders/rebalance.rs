//! Deciders that gate rebalancing

use super::AllocationDecider;
use crate::allocation::decision::Decision;
use crate::allocation::routing_allocation::RoutingAllocation;
use crate::cluster::ShardRouting;
use crate::common::ClusterRebalanceType;

/// Only rebalance a shard once all of its copies are active
pub struct RebalanceOnlyWhenActiveAllocationDecider;

impl RebalanceOnlyWhenActiveAllocationDecider {
    pub const NAME: &'static str = "rebalance_only_when_active";
}

impl AllocationDecider for RebalanceOnlyWhenActiveAllocationDecider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_rebalance(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Decision {
        let expected = allocation
            .index_metadata(&shard.shard_id.index)
            .map(|m| m.copies_per_shard())
            .unwrap_or(1);
        if allocation.routing_nodes().all_copies_active(&shard.shard_id, expected) {
            Decision::yes(Self::NAME, "rebalancing is allowed as all copies of this shard are active")
        } else {
            Decision::no(Self::NAME, "rebalancing is not allowed until all copies of this shard are active")
        }
    }
}

/// Holds rebalancing back until the cluster has settled enough
pub struct ClusterRebalanceAllocationDecider;

impl ClusterRebalanceAllocationDecider {
    pub const NAME: &'static str = "cluster_rebalance";
}

impl AllocationDecider for ClusterRebalanceAllocationDecider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_rebalance(&self, _shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Decision {
        self.can_rebalance_cluster(allocation)
    }

    fn can_rebalance_cluster(&self, allocation: &RoutingAllocation<'_>) -> Decision {
        let routing_nodes = allocation.routing_nodes();
        match allocation.settings().allow_rebalance {
            ClusterRebalanceType::Always => {
                Decision::yes(Self::NAME, "all rebalancing is allowed")
            }
            ClusterRebalanceType::IndicesPrimariesActive => {
                if routing_nodes.has_inactive_primaries() {
                    Decision::no(
                        Self::NAME,
                        "the cluster has inactive primary shards and allow_rebalance is set to [indices_primaries_active]",
                    )
                } else {
                    Decision::yes(Self::NAME, "all primary shards are active")
                }
            }
            ClusterRebalanceType::IndicesAllActive => {
                if routing_nodes.has_unassigned_shards() {
                    Decision::no(
                        Self::NAME,
                        "the cluster has unassigned shards and allow_rebalance is set to [indices_all_active]",
                    )
                } else if routing_nodes.has_inactive_shards() {
                    Decision::no(
                        Self::NAME,
                        "the cluster has inactive shards and allow_rebalance is set to [indices_all_active]",
                    )
                } else {
                    Decision::yes(Self::NAME, "all shards are active")
                }
            }
        }
    }
}

/// Caps relocations running at once across the cluster
pub struct ConcurrentRebalanceAllocationDecider;

impl ConcurrentRebalanceAllocationDecider {
    pub const NAME: &'static str = "concurrent_rebalance";
}

impl AllocationDecider for ConcurrentRebalanceAllocationDecider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_rebalance(&self, _shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Decision {
        self.can_rebalance_cluster(allocation)
    }

    fn can_rebalance_cluster(&self, allocation: &RoutingAllocation<'_>) -> Decision {
        let limit = allocation.settings().cluster_concurrent_rebalance;
        let relocating = allocation.routing_nodes().relocating_shards();
        if relocating >= limit {
            Decision::throttle(
                Self::NAME,
                format!(
                    "reached the limit of concurrently rebalancing shards [{}], cluster_concurrent_rebalance=[{}]",
                    relocating, limit
                ),
            )
        } else {
            Decision::yes(
                Self::NAME,
                format!(
                    "below threshold [{}] for concurrent rebalances, current rebalance shard count [{}]",
                    limit, relocating
                ),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::deciders::test_support::*;
    use crate::allocation::deciders::AllocationDeciders;
    use crate::allocation::decision::DebugMode;
    use crate::cluster::IndexMetadata;
    use crate::common::AllocationConfig;

    #[test]
    fn test_rebalance_waits_for_active_shards() {
        let state = state_with(
            vec![data_node("n1"), data_node("n2")],
            vec![IndexMetadata::new("logs", 1, 0)],
        );
        let deciders = AllocationDeciders::new(vec![]);
        let mut allocation = RoutingAllocation::new(
            &deciders,
            &state,
            Default::default(),
            Default::default(),
            AllocationConfig::default(),
            DebugMode::Off,
        );
        assert!(ClusterRebalanceAllocationDecider.can_rebalance_cluster(&allocation).is_no());

        let shard = allocation.routing_nodes().unassigned()[0].clone();
        let init = allocation
            .routing_nodes_mut()
            .initialize_shard(&shard, "n1", None)
            .unwrap();
        assert!(ClusterRebalanceAllocationDecider.can_rebalance_cluster(&allocation).is_no());
        assert!(RebalanceOnlyWhenActiveAllocationDecider
            .can_rebalance(&init, &allocation)
            .is_no());

        let started = allocation.routing_nodes_mut().start_shard(&init).unwrap();
        assert!(ClusterRebalanceAllocationDecider.can_rebalance_cluster(&allocation).is_yes());
        assert!(RebalanceOnlyWhenActiveAllocationDecider
            .can_rebalance(&started, &allocation)
            .is_yes());
    }

    #[test]
    fn test_concurrent_rebalance_limit() {
        let state = state_with(
            vec![data_node("n1"), data_node("n2")],
            vec![IndexMetadata::new("logs", 1, 0)],
        );
        let deciders = AllocationDeciders::new(vec![]);
        let settings = AllocationConfig {
            cluster_concurrent_rebalance: 1,
            ..AllocationConfig::default()
        };
        let mut allocation = RoutingAllocation::new(
            &deciders,
            &state,
            Default::default(),
            Default::default(),
            settings,
            DebugMode::Off,
        );
        let shard = allocation.routing_nodes().unassigned()[0].clone();
        let init = allocation
            .routing_nodes_mut()
            .initialize_shard(&shard, "n1", None)
            .unwrap();
        let started = allocation.routing_nodes_mut().start_shard(&init).unwrap();
        assert!(ConcurrentRebalanceAllocationDecider.can_rebalance_cluster(&allocation).is_yes());

        allocation
            .routing_nodes_mut()
            .relocate_shard(&started, "n2", None)
            .unwrap();
        assert!(ConcurrentRebalanceAllocationDecider
            .can_rebalance_cluster(&allocation)
            .is_throttle());
    }
}
