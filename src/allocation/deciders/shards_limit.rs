//! Caps how many shards one node may hold

use super::AllocationDecider;
use crate::allocation::decision::Decision;
use crate::allocation::routing_allocation::RoutingAllocation;
use crate::allocation::routing_nodes::RoutingNode;
use crate::cluster::ShardRouting;

pub struct ShardsLimitAllocationDecider;

impl ShardsLimitAllocationDecider {
    pub const NAME: &'static str = "shards_limit";

    /// `at_most` is false when checking whether one more shard fits
    fn decide(
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
        at_most: bool,
    ) -> Decision {
        let over = |count: usize, limit: u32| {
            if at_most {
                count > limit as usize
            } else {
                count >= limit as usize
            }
        };

        let index_limit = allocation
            .index_metadata(&shard.shard_id.index)
            .and_then(|m| m.total_shards_per_node());
        if let Some(limit) = index_limit {
            let count = node.owned_shard_count_for_index(&shard.shard_id.index);
            if over(count, limit) {
                return Decision::no(
                    Self::NAME,
                    format!(
                        "too many shards [{}] of index [{}] on this node, limit is [{}]",
                        count, shard.shard_id.index, limit
                    ),
                );
            }
        }
        if let Some(limit) = allocation.settings().total_shards_per_node {
            let count = node.owned_shard_count();
            if over(count, limit) {
                return Decision::no(
                    Self::NAME,
                    format!("too many shards [{}] on this node, cluster limit is [{}]", count, limit),
                );
            }
        }
        if index_limit.is_none() && allocation.settings().total_shards_per_node.is_none() {
            return Decision::yes(Self::NAME, "total shard limits are disabled");
        }
        Decision::yes(Self::NAME, "the shard count on this node is under the limits")
    }
}

impl AllocationDecider for ShardsLimitAllocationDecider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        Self::decide(shard, node, allocation, false)
    }

    fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        Self::decide(shard, node, allocation, true)
    }
}
