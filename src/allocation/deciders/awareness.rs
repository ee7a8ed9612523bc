//! Spreads the copies of a shard across attribute values (zones, racks)

use super::AllocationDecider;
use crate::allocation::decision::Decision;
use crate::allocation::routing_allocation::RoutingAllocation;
use crate::allocation::routing_nodes::RoutingNode;
use crate::cluster::ShardRouting;
use std::collections::{BTreeMap, BTreeSet};

pub struct AwarenessAllocationDecider;

impl AwarenessAllocationDecider {
    pub const NAME: &'static str = "awareness";

    fn decide(
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
        move_to_node: bool,
    ) -> Decision {
        let attributes = &allocation.settings().awareness_attributes;
        if attributes.is_empty() {
            return Decision::yes(Self::NAME, "allocation awareness is not enabled");
        }
        let Some(metadata) = allocation.index_metadata(&shard.shard_id.index) else {
            return Decision::yes(Self::NAME, "index metadata is unavailable");
        };
        let copies = metadata.copies_per_shard();
        let nodes = allocation.nodes();
        let attr_of = |node_id: &str, attr: &str| -> Option<String> {
            nodes.get(node_id).and_then(|n| n.attribute(attr)).map(str::to_string)
        };

        for attr in attributes {
            let Some(node_value) = attr_of(node.node_id(), attr) else {
                return Decision::no(
                    Self::NAME,
                    format!("node does not contain the awareness attribute [{}]", attr),
                );
            };

            let values: BTreeSet<String> = allocation
                .routing_nodes()
                .nodes()
                .filter_map(|n| attr_of(n.node_id(), attr))
                .collect();

            // relocation targets count at their destination, sources do not
            let mut per_value: BTreeMap<String, i64> = BTreeMap::new();
            for copy in allocation.routing_nodes().assigned_shards(&shard.shard_id) {
                if !(copy.started() || copy.initializing()) {
                    continue;
                }
                if let Some(value) = copy.current_node_id().and_then(|id| attr_of(id, attr)) {
                    *per_value.entry(value).or_default() += 1;
                }
            }

            if move_to_node {
                let from = if shard.relocating() {
                    shard.relocating_node_id()
                } else {
                    shard.current_node_id()
                };
                match from {
                    Some(from) if from == node.node_id() => {}
                    Some(from) => {
                        if let Some(value) = attr_of(from, attr) {
                            *per_value.entry(value).or_default() -= 1;
                        }
                        *per_value.entry(node_value.clone()).or_default() += 1;
                    }
                    None => *per_value.entry(node_value.clone()).or_default() += 1,
                }
            }

            let current = per_value.get(&node_value).copied().unwrap_or(0);
            let distinct = values.len().max(1);
            let maximum = copies.div_ceil(distinct) as i64;
            if current > maximum {
                return Decision::no(
                    Self::NAME,
                    format!(
                        "there are too many copies of the shard allocated to nodes with attribute [{}], there are [{}] total configured shard copies for this shard id and [{}] total attribute values, expected the allocated shard count per attribute [{}] to be less than or equal to the upper bound of the required number of shards per attribute [{}]",
                        attr, copies, distinct, current, maximum
                    ),
                );
            }
        }
        Decision::yes(Self::NAME, "node meets all awareness attribute requirements")
    }
}

impl AllocationDecider for AwarenessAllocationDecider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        Self::decide(shard, node, allocation, true)
    }

    fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        Self::decide(shard, node, allocation, false)
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
    fn test_second_copy_goes_to_other_zone() {
        let state = state_with(
            vec![
                data_node("a1").with_attribute("zone", "a"),
                data_node("a2").with_attribute("zone", "a"),
                data_node("b1").with_attribute("zone", "b"),
                data_node("x"),
            ],
            vec![IndexMetadata::new("logs", 1, 1)],
        );
        let deciders = AllocationDeciders::new(vec![]);
        let settings = AllocationConfig {
            awareness_attributes: vec!["zone".into()],
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
        let primary = allocation
            .routing_nodes()
            .unassigned()
            .iter()
            .find(|s| s.primary)
            .unwrap()
            .clone();
        {
            let x = allocation.routing_nodes().node("x").unwrap();
            assert!(AwarenessAllocationDecider.can_allocate(&primary, x, &allocation).is_no());
        }
        allocation
            .routing_nodes_mut()
            .initialize_shard(&primary, "a1", None)
            .unwrap();
        let replica = allocation.routing_nodes().unassigned()[0].clone();

        let a2 = allocation.routing_nodes().node("a2").unwrap();
        let b1 = allocation.routing_nodes().node("b1").unwrap();
        assert!(AwarenessAllocationDecider.can_allocate(&replica, a2, &allocation).is_no());
        assert!(AwarenessAllocationDecider.can_allocate(&replica, b1, &allocation).is_yes());
    }
}
