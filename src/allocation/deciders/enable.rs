//! Cluster-wide switch for which shards may be allocated

use super::AllocationDecider;
use crate::allocation::decision::Decision;
use crate::allocation::routing_allocation::RoutingAllocation;
use crate::allocation::routing_nodes::RoutingNode;
use crate::cluster::{ShardRouting, UnassignedReason};
use crate::common::EnableAllocation;

pub struct EnableAllocationDecider;

impl EnableAllocationDecider {
    pub const NAME: &'static str = "enable";
}

impl AllocationDecider for EnableAllocationDecider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        _node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        match allocation.settings().enable {
            EnableAllocation::All => Decision::yes(Self::NAME, "all allocations are allowed"),
            EnableAllocation::None => Decision::no(Self::NAME, "no allocations are allowed"),
            EnableAllocation::Primaries if shard.primary => {
                Decision::yes(Self::NAME, "primary allocations are allowed")
            }
            EnableAllocation::Primaries => {
                Decision::no(Self::NAME, "replica allocations are forbidden")
            }
            EnableAllocation::NewPrimaries => {
                let new_primary = shard.primary
                    && shard
                        .unassigned_info
                        .as_ref()
                        .map(|i| i.reason == UnassignedReason::IndexCreated)
                        .unwrap_or(false);
                if new_primary {
                    Decision::yes(Self::NAME, "new primary allocations are allowed")
                } else {
                    Decision::no(Self::NAME, "non-new primary allocations are forbidden")
                }
            }
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
    fn test_modes() {
        let state = state_with(vec![data_node("n1")], vec![IndexMetadata::new("logs", 1, 1)]);
        let deciders = AllocationDeciders::new(vec![]);

        let cases = [
            (EnableAllocation::All, true, true),
            (EnableAllocation::None, false, false),
            (EnableAllocation::Primaries, true, false),
            (EnableAllocation::NewPrimaries, true, false),
        ];
        for (mode, primary_ok, replica_ok) in cases {
            let settings = AllocationConfig {
                enable: mode,
                ..AllocationConfig::default()
            };
            let allocation = RoutingAllocation::new(
                &deciders,
                &state,
                Default::default(),
                Default::default(),
                settings,
                DebugMode::Off,
            );
            let node = allocation.routing_nodes().node("n1").unwrap();
            for shard in allocation.routing_nodes().unassigned() {
                let expected = if shard.primary { primary_ok } else { replica_ok };
                let decision = EnableAllocationDecider.can_allocate(shard, node, &allocation);
                assert_eq!(decision.is_yes(), expected, "{:?} {}", mode, shard);
            }
        }
    }
}
