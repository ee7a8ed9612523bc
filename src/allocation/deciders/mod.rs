//! Allocation deciders
//!
//! Each decider is one placement rule. [`AllocationDeciders`] runs them in
//! registration order and combines the answers.

pub mod awareness;
pub mod disk_threshold;
pub mod enable;
pub mod filter;
pub mod max_retry;
pub mod node_version;
pub mod rebalance;
pub mod replica_after_primary_active;
pub mod same_shard;
pub mod shards_limit;
pub mod throttling;

use crate::allocation::decision::{DebugMode, Decision};
use crate::allocation::routing_allocation::RoutingAllocation;
use crate::allocation::routing_nodes::RoutingNode;
use crate::cluster::ShardRouting;
use std::sync::Arc;

pub use awareness::AwarenessAllocationDecider;
pub use disk_threshold::DiskThresholdDecider;
pub use enable::EnableAllocationDecider;
pub use filter::FilterAllocationDecider;
pub use max_retry::MaxRetryAllocationDecider;
pub use node_version::NodeVersionAllocationDecider;
pub use rebalance::{
    ClusterRebalanceAllocationDecider, ConcurrentRebalanceAllocationDecider,
    RebalanceOnlyWhenActiveAllocationDecider,
};
pub use replica_after_primary_active::ReplicaAfterPrimaryActiveAllocationDecider;
pub use same_shard::SameShardAllocationDecider;
pub use shards_limit::ShardsLimitAllocationDecider;
pub use throttling::ThrottlingAllocationDecider;

/// One placement rule. Unimplemented checks answer [`Decision::ALWAYS`].
pub trait AllocationDecider: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_allocate(
        &self,
        _shard: &ShardRouting,
        _node: &RoutingNode,
        _allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        Decision::ALWAYS
    }

    fn can_remain(
        &self,
        _shard: &ShardRouting,
        _node: &RoutingNode,
        _allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        Decision::ALWAYS
    }

    fn can_rebalance(&self, _shard: &ShardRouting, _allocation: &RoutingAllocation<'_>) -> Decision {
        Decision::ALWAYS
    }

    fn can_rebalance_cluster(&self, _allocation: &RoutingAllocation<'_>) -> Decision {
        Decision::ALWAYS
    }
}

/// The decider chain
#[derive(Clone)]
pub struct AllocationDeciders {
    deciders: Vec<Arc<dyn AllocationDecider>>,
}

impl Default for AllocationDeciders {
    fn default() -> Self {
        Self::builtin()
    }
}

impl AllocationDeciders {
    pub fn new(deciders: Vec<Arc<dyn AllocationDecider>>) -> Self {
        Self { deciders }
    }

    /// Every built-in decider, in evaluation order
    pub fn builtin() -> Self {
        Self::new(vec![
            Arc::new(MaxRetryAllocationDecider),
            Arc::new(ReplicaAfterPrimaryActiveAllocationDecider),
            Arc::new(RebalanceOnlyWhenActiveAllocationDecider),
            Arc::new(ClusterRebalanceAllocationDecider),
            Arc::new(ConcurrentRebalanceAllocationDecider),
            Arc::new(EnableAllocationDecider),
            Arc::new(NodeVersionAllocationDecider),
            Arc::new(FilterAllocationDecider),
            Arc::new(SameShardAllocationDecider),
            Arc::new(DiskThresholdDecider),
            Arc::new(ThrottlingAllocationDecider),
            Arc::new(ShardsLimitAllocationDecider),
            Arc::new(AwarenessAllocationDecider),
        ])
    }

    /// Appends a custom decider after the built-ins
    pub fn with_decider(mut self, decider: Arc<dyn AllocationDecider>) -> Self {
        self.deciders.push(decider);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.deciders.iter().map(|d| d.name()).collect()
    }

    pub fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        self.combine(allocation, |d| d.can_allocate(shard, node, allocation))
    }

    pub fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        self.combine(allocation, |d| d.can_remain(shard, node, allocation))
    }

    pub fn can_rebalance(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Decision {
        self.combine(allocation, |d| d.can_rebalance(shard, allocation))
    }

    pub fn can_rebalance_cluster(&self, allocation: &RoutingAllocation<'_>) -> Decision {
        self.combine(allocation, |d| d.can_rebalance_cluster(allocation))
    }

    /// Outside debug mode the first NO is returned as is. In debug mode every
    /// decider runs and all answers are kept, minus YES ones when excluded.
    fn combine(
        &self,
        allocation: &RoutingAllocation<'_>,
        decide: impl Fn(&dyn AllocationDecider) -> Decision,
    ) -> Decision {
        let mut combined = Decision::multi();
        for decider in &self.deciders {
            let decision = decide(decider.as_ref());
            if decision.is_no() && !allocation.debug_decision() {
                tracing::trace!(decider = decider.name(), %decision, "decider said no");
                return decision;
            }
            if decision == Decision::ALWAYS {
                continue;
            }
            if allocation.debug_mode() == DebugMode::ExcludeYesDecisions && decision.is_yes() {
                continue;
            }
            combined = combined.add(decision);
        }
        combined
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::allocation::decision::DecisionType;
    use crate::cluster::IndexMetadata;
    use crate::common::AllocationConfig;

    struct Fixed(&'static str, DecisionType);

    impl AllocationDecider for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        fn can_allocate(&self, _: &ShardRouting, _: &RoutingNode, _: &RoutingAllocation<'_>) -> Decision {
            Decision::single(self.1, self.0, "fixed")
        }
    }

    fn chain() -> AllocationDeciders {
        AllocationDeciders::new(vec![
            Arc::new(Fixed("first", DecisionType::Yes)),
            Arc::new(Fixed("second", DecisionType::No)),
            Arc::new(Fixed("third", DecisionType::Throttle)),
        ])
    }

    #[test]
    fn test_first_no_short_circuits() {
        let state = state_with(vec![data_node("n1")], vec![IndexMetadata::new("logs", 1, 0)]);
        let deciders = chain();
        let allocation = RoutingAllocation::new(
            &deciders,
            &state,
            Default::default(),
            Default::default(),
            AllocationConfig::default(),
            DebugMode::Off,
        );
        let shard = allocation.routing_nodes().unassigned()[0].clone();
        let node = allocation.routing_nodes().node("n1").unwrap();
        let decision = deciders.can_allocate(&shard, node, &allocation);
        assert_eq!(decision.label(), Some("second"));
        assert_eq!(decision.decisions().len(), 1);
    }

    #[test]
    fn test_debug_mode_collects_everything() {
        let state = state_with(vec![data_node("n1")], vec![IndexMetadata::new("logs", 1, 0)]);
        let deciders = chain();
        for (mode, expected) in [(DebugMode::On, 3), (DebugMode::ExcludeYesDecisions, 2)] {
            let allocation = RoutingAllocation::new(
                &deciders,
                &state,
                Default::default(),
                Default::default(),
                AllocationConfig::default(),
                mode,
            );
            let shard = allocation.routing_nodes().unassigned()[0].clone();
            let node = allocation.routing_nodes().node("n1").unwrap();
            let decision = deciders.can_allocate(&shard, node, &allocation);
            assert_eq!(decision.decision_type(), DecisionType::No);
            assert_eq!(decision.decisions().len(), expected);
        }
    }
}
