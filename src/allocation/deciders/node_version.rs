//! Keeps copies from recovering onto nodes older than their source

use super::AllocationDecider;
use crate::allocation::decision::Decision;
use crate::allocation::routing_allocation::RoutingAllocation;
use crate::allocation::routing_nodes::RoutingNode;
use crate::cluster::ShardRouting;

pub struct NodeVersionAllocationDecider;

impl NodeVersionAllocationDecider {
    pub const NAME: &'static str = "node_version";

    fn check(
        source_node_id: &str,
        target: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
        what: &str,
    ) -> Decision {
        let nodes = allocation.nodes();
        let (Some(source), Some(target)) = (nodes.get(source_node_id), nodes.get(target.node_id()))
        else {
            return Decision::yes(Self::NAME, "node versions are unknown");
        };
        if target.version() >= source.version() {
            Decision::yes(
                Self::NAME,
                format!(
                    "can {} from a node with version [{}] to a node with equal-or-newer version [{}]",
                    what,
                    source.version(),
                    target.version()
                ),
            )
        } else {
            Decision::no(
                Self::NAME,
                format!(
                    "cannot {} from a node with version [{}] to a node with older version [{}]",
                    what,
                    source.version(),
                    target.version()
                ),
            )
        }
    }
}

impl AllocationDecider for NodeVersionAllocationDecider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        if shard.primary {
            return match shard.current_node_id() {
                Some(source) => Self::check(source, node, allocation, "relocate primary shard"),
                None => Decision::yes(Self::NAME, "the primary shard is new or already existed on the node"),
            };
        }
        match allocation
            .routing_nodes()
            .active_primary(&shard.shard_id)
            .and_then(|p| p.current_node_id())
        {
            Some(primary_node) => Self::check(primary_node, node, allocation, "allocate replica shard"),
            None => Decision::yes(Self::NAME, "no active primary shard yet"),
        }
    }
}
