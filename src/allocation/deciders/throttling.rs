//! Limits concurrent recoveries per node

use super::AllocationDecider;
use crate::allocation::decision::Decision;
use crate::allocation::routing_allocation::RoutingAllocation;
use crate::allocation::routing_nodes::RoutingNode;
use crate::cluster::ShardRouting;

pub struct ThrottlingAllocationDecider;

impl ThrottlingAllocationDecider {
    pub const NAME: &'static str = "throttling";
}

impl AllocationDecider for ThrottlingAllocationDecider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        let settings = allocation.settings();
        if shard.primary && shard.unassigned() {
            // primaries start from local data, not from a peer
            let initializing = node.initializing_primaries();
            if initializing >= settings.node_initial_primaries_recoveries {
                return Decision::throttle(
                    Self::NAME,
                    format!(
                        "reached the limit of ongoing initial primary recoveries [{}], node_initial_primaries_recoveries=[{}]",
                        initializing, settings.node_initial_primaries_recoveries
                    ),
                );
            }
            return Decision::yes(Self::NAME, "below primary recovery limit");
        }

        let incoming = node.incoming_recoveries();
        if incoming >= settings.node_concurrent_incoming_recoveries {
            return Decision::throttle(
                Self::NAME,
                format!(
                    "reached the limit of incoming shard recoveries [{}], node_concurrent_incoming_recoveries=[{}]",
                    incoming, settings.node_concurrent_incoming_recoveries
                ),
            );
        }
        Decision::yes(Self::NAME, "below shard recovery limit")
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
    fn test_primary_recoveries_throttle() {
        let state = state_with(vec![data_node("n1")], vec![IndexMetadata::new("logs", 2, 0)]);
        let deciders = AllocationDeciders::new(vec![]);
        let settings = AllocationConfig {
            node_initial_primaries_recoveries: 1,
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
        let first = allocation.routing_nodes().unassigned()[0].clone();
        allocation
            .routing_nodes_mut()
            .initialize_shard(&first, "n1", None)
            .unwrap();
        let second = allocation.routing_nodes().unassigned()[0].clone();
        let node = allocation.routing_nodes().node("n1").unwrap();
        assert!(ThrottlingAllocationDecider.can_allocate(&second, node, &allocation).is_throttle());
    }
}
