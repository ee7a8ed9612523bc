//! Stops retrying a shard that keeps failing to allocate

use super::AllocationDecider;
use crate::allocation::decision::Decision;
use crate::allocation::routing_allocation::RoutingAllocation;
use crate::allocation::routing_nodes::RoutingNode;
use crate::cluster::ShardRouting;

pub struct MaxRetryAllocationDecider;

impl MaxRetryAllocationDecider {
    pub const NAME: &'static str = "max_retry";
}

impl AllocationDecider for MaxRetryAllocationDecider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        _node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        let Some(info) = shard.unassigned_info.as_ref() else {
            return Decision::yes(Self::NAME, "shard has no previous failures");
        };
        let max_retries = allocation
            .index_metadata(&shard.shard_id.index)
            .and_then(|m| m.max_retries())
            .unwrap_or(allocation.settings().max_retries);

        if info.failed_allocations >= max_retries {
            Decision::no(
                Self::NAME,
                format!(
                    "shard has exceeded the maximum number of retries [{}] on failed allocation attempts, last failure [{}]",
                    max_retries,
                    info.message.as_deref().unwrap_or("unknown")
                ),
            )
        } else if info.failed_allocations > 0 {
            Decision::yes(
                Self::NAME,
                format!(
                    "shard has failed allocating [{}] times but [{}] retries are allowed",
                    info.failed_allocations, max_retries
                ),
            )
        } else {
            Decision::yes(Self::NAME, "shard has no previous failures")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::deciders::test_support::*;
    use crate::allocation::deciders::AllocationDeciders;
    use crate::allocation::decision::DebugMode;
    use crate::cluster::metadata::INDEX_MAX_RETRIES;
    use crate::cluster::IndexMetadata;
    use crate::common::AllocationConfig;

    #[test]
    fn test_index_setting_overrides_default() {
        let state = state_with(
            vec![data_node("n1")],
            vec![IndexMetadata::new("logs", 1, 0).with_setting(INDEX_MAX_RETRIES, "1")],
        );
        let deciders = AllocationDeciders::new(vec![]);
        let allocation = RoutingAllocation::new(
            &deciders,
            &state,
            Default::default(),
            Default::default(),
            AllocationConfig::default(),
            DebugMode::Off,
        );
        let mut shard = allocation.routing_nodes().unassigned()[0].clone();
        let node = allocation.routing_nodes().node("n1").unwrap();
        assert!(MaxRetryAllocationDecider.can_allocate(&shard, node, &allocation).is_yes());

        if let Some(info) = shard.unassigned_info.as_mut() {
            info.failed_allocations = 1;
        }
        assert!(MaxRetryAllocationDecider.can_allocate(&shard, node, &allocation).is_no());
    }
}
