//! Replicas wait for an active primary to recover from

use super::AllocationDecider;
use crate::allocation::decision::Decision;
use crate::allocation::routing_allocation::RoutingAllocation;
use crate::allocation::routing_nodes::RoutingNode;
use crate::cluster::ShardRouting;

pub struct ReplicaAfterPrimaryActiveAllocationDecider;

impl ReplicaAfterPrimaryActiveAllocationDecider {
    pub const NAME: &'static str = "replica_after_primary_active";
}

impl AllocationDecider for ReplicaAfterPrimaryActiveAllocationDecider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        _node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        if shard.primary {
            return Decision::yes(Self::NAME, "shard is primary and can be allocated");
        }
        match allocation.routing_nodes().active_primary(&shard.shard_id) {
            Some(_) => Decision::yes(Self::NAME, "primary shard for this replica is already active"),
            None => Decision::no(Self::NAME, "primary shard for this replica is not yet active"),
        }
    }
}
