//! Never two copies of the same shard on one node

use super::AllocationDecider;
use crate::allocation::decision::Decision;
use crate::allocation::routing_allocation::RoutingAllocation;
use crate::allocation::routing_nodes::RoutingNode;
use crate::cluster::ShardRouting;

pub struct SameShardAllocationDecider;

impl SameShardAllocationDecider {
    pub const NAME: &'static str = "same_shard";
}

impl AllocationDecider for SameShardAllocationDecider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        _allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        match node.get_by_shard_id(&shard.shard_id) {
            Some(existing) => Decision::no(
                Self::NAME,
                format!(
                    "a copy of this shard is already allocated to this node [{}]",
                    existing
                ),
            ),
            None => Decision::yes(
                Self::NAME,
                "this node does not hold a copy of this shard",
            ),
        }
    }
}
