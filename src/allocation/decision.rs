//! Allocation decisions
//!
//! A [`Decision`] is what one decider (or a chain of them) says about a
//! shard/node pair. The `*Decision` structs further down are what the
//! allocator concluded, with per-node detail when run in debug mode.

use crate::cluster::{AllocationStatus, DiscoveryNode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionType {
    Yes,
    Throttle,
    No,
}

impl DecisionType {
    fn restrictiveness(self) -> u8 {
        match self {
            DecisionType::Yes => 0,
            DecisionType::Throttle => 1,
            DecisionType::No => 2,
        }
    }

    /// NO beats THROTTLE beats YES
    pub fn most_restrictive(self, other: DecisionType) -> DecisionType {
        if other.restrictiveness() > self.restrictiveness() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for DecisionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionType::Yes => write!(f, "YES"),
            DecisionType::Throttle => write!(f, "THROTTLE"),
            DecisionType::No => write!(f, "NO"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    Single {
        decision: DecisionType,
        label: Option<String>,
        explanation: String,
    },
    Multi { decisions: Vec<Decision> },
}

impl Decision {
    /// Unlabelled YES; never recorded in a multi decision
    pub const ALWAYS: Decision = Decision::Single {
        decision: DecisionType::Yes,
        label: None,
        explanation: String::new(),
    };

    pub fn single(decision: DecisionType, label: &str, explanation: impl Into<String>) -> Self {
        Decision::Single {
            decision,
            label: Some(label.to_string()),
            explanation: explanation.into(),
        }
    }

    pub fn yes(label: &str, explanation: impl Into<String>) -> Self {
        Self::single(DecisionType::Yes, label, explanation)
    }

    pub fn no(label: &str, explanation: impl Into<String>) -> Self {
        Self::single(DecisionType::No, label, explanation)
    }

    pub fn throttle(label: &str, explanation: impl Into<String>) -> Self {
        Self::single(DecisionType::Throttle, label, explanation)
    }

    pub fn multi() -> Self {
        Decision::Multi {
            decisions: Vec::new(),
        }
    }

    /// Appends to a multi decision; a single decision is wrapped first
    pub fn add(self, decision: Decision) -> Self {
        match self {
            Decision::Multi { mut decisions } => {
                decisions.push(decision);
                Decision::Multi { decisions }
            }
            single => Decision::Multi {
                decisions: vec![single, decision],
            },
        }
    }

    /// Combined type; an empty multi decision is YES
    pub fn decision_type(&self) -> DecisionType {
        match self {
            Decision::Single { decision, .. } => *decision,
            Decision::Multi { decisions } => decisions
                .iter()
                .map(Decision::decision_type)
                .fold(DecisionType::Yes, DecisionType::most_restrictive),
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Decision::Single { label, .. } => label.as_deref(),
            Decision::Multi { .. } => None,
        }
    }

    /// Flattened single decisions
    pub fn decisions(&self) -> Vec<&Decision> {
        match self {
            Decision::Single { .. } => vec![self],
            Decision::Multi { decisions } => decisions.iter().flat_map(|d| d.decisions()).collect(),
        }
    }

    pub fn is_yes(&self) -> bool {
        self.decision_type() == DecisionType::Yes
    }

    pub fn is_no(&self) -> bool {
        self.decision_type() == DecisionType::No
    }

    pub fn is_throttle(&self) -> bool {
        self.decision_type() == DecisionType::Throttle
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Single {
                decision,
                label,
                explanation,
            } => match label {
                Some(label) => write!(f, "[{}]: {}({})", label, decision, explanation),
                None => write!(f, "{}", decision),
            },
            Decision::Multi { decisions } => {
                let parts: Vec<String> = decisions.iter().map(ToString::to_string).collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

/// How much detail an allocation round records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugMode {
    /// Stop at the first NO and keep no per-node detail
    Off,
    /// Run every decider and keep every decision
    On,
    /// Run every decider but drop YES entries
    ExcludeYesDecisions,
}

impl DebugMode {
    pub fn enabled(self) -> bool {
        self != DebugMode::Off
    }
}

/// Final outcome of an allocation or move decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationDecision {
    Yes,
    Throttled,
    No,
    WorseBalance,
    NoAttempt,
}

impl AllocationDecision {
    pub fn from_decision_type(decision: DecisionType) -> Self {
        match decision {
            DecisionType::Yes => AllocationDecision::Yes,
            DecisionType::Throttle => AllocationDecision::Throttled,
            DecisionType::No => AllocationDecision::No,
        }
    }

    pub fn from_allocation_status(status: AllocationStatus) -> Self {
        match status {
            AllocationStatus::DecidersThrottled => AllocationDecision::Throttled,
            AllocationStatus::DecidersNo => AllocationDecision::No,
            AllocationStatus::NoAttempt => AllocationDecision::NoAttempt,
        }
    }
}

/// What the deciders said about one candidate node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAllocationResult {
    pub node_id: String,
    pub node_name: String,
    pub node_decision: AllocationDecision,
    pub decision: Option<Decision>,
    /// 1 is the node the balancer likes best
    pub weight_ranking: usize,
}

impl NodeAllocationResult {
    pub fn new(
        node: &DiscoveryNode,
        node_decision: AllocationDecision,
        decision: Option<Decision>,
        weight_ranking: usize,
    ) -> Self {
        Self {
            node_id: node.id().to_string(),
            node_name: node.name().to_string(),
            node_decision,
            decision,
            weight_ranking,
        }
    }
}

/// Decision for an unassigned shard copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocateUnassignedDecision {
    pub allocation_status: Option<AllocationStatus>,
    pub final_decision: AllocationDecision,
    pub target_node: Option<String>,
    pub node_decisions: Option<Vec<NodeAllocationResult>>,
    pub explanation: String,
}

impl AllocateUnassignedDecision {
    pub fn yes(target_node: &str, node_decisions: Option<Vec<NodeAllocationResult>>) -> Self {
        Self {
            allocation_status: None,
            final_decision: AllocationDecision::Yes,
            target_node: Some(target_node.to_string()),
            node_decisions,
            explanation: "can allocate the shard".to_string(),
        }
    }

    pub fn no(status: AllocationStatus, node_decisions: Option<Vec<NodeAllocationResult>>) -> Self {
        let explanation = match status {
            AllocationStatus::DecidersThrottled => {
                "allocation temporarily throttled, no node can take the shard right now"
            }
            AllocationStatus::DecidersNo => {
                "cannot allocate because allocation is not permitted to any of the nodes"
            }
            AllocationStatus::NoAttempt => "no attempt was made to allocate the shard",
        };
        Self {
            allocation_status: Some(status),
            final_decision: AllocationDecision::from_allocation_status(status),
            target_node: None,
            node_decisions,
            explanation: explanation.to_string(),
        }
    }

    pub fn is_yes(&self) -> bool {
        self.final_decision == AllocationDecision::Yes
    }
}

/// Decision for an assigned, started shard copy: stay, move or rebalance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveDecision {
    pub can_remain_decision: Option<Decision>,
    pub can_rebalance_cluster_decision: Option<Decision>,
    pub final_decision: AllocationDecision,
    pub target_node: Option<String>,
    pub node_decisions: Option<Vec<NodeAllocationResult>>,
    pub current_node_ranking: usize,
    pub explanation: String,
}

impl MoveDecision {
    /// The shard may remain and no rebalance was considered
    pub fn stay(can_remain_decision: Decision) -> Self {
        Self {
            can_remain_decision: Some(can_remain_decision),
            can_rebalance_cluster_decision: None,
            final_decision: AllocationDecision::NoAttempt,
            target_node: None,
            node_decisions: None,
            current_node_ranking: 0,
            explanation: "shard can remain on its current node".to_string(),
        }
    }

    pub fn can_remain(&self) -> bool {
        self.can_remain_decision
            .as_ref()
            .map(|d| !d.is_no())
            .unwrap_or(true)
    }

    pub fn force_move(&self) -> bool {
        !self.can_remain() && self.final_decision == AllocationDecision::Yes
    }
}

/// Allocate and/or move decision for one shard copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardAllocationDecision {
    pub allocate_decision: Option<AllocateUnassignedDecision>,
    pub move_decision: Option<MoveDecision>,
}

impl ShardAllocationDecision {
    /// Neither decision was taken, e.g. for a shard that is already moving
    pub const NOT_TAKEN: ShardAllocationDecision = ShardAllocationDecision {
        allocate_decision: None,
        move_decision: None,
    };

    pub fn is_decision_taken(&self) -> bool {
        self.allocate_decision.is_some() || self.move_decision.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_takes_most_restrictive() {
        let multi = Decision::multi()
            .add(Decision::yes("a", "fine"))
            .add(Decision::throttle("b", "busy"));
        assert_eq!(multi.decision_type(), DecisionType::Throttle);

        let multi = multi.add(Decision::no("c", "never"));
        assert_eq!(multi.decision_type(), DecisionType::No);
        assert_eq!(multi.decisions().len(), 3);

        assert_eq!(Decision::multi().decision_type(), DecisionType::Yes);
    }

    #[test]
    fn test_display() {
        let d = Decision::no("same_shard", "copy already here");
        assert_eq!(d.to_string(), "[same_shard]: NO(copy already here)");
        assert_eq!(Decision::ALWAYS.to_string(), "YES");
    }

    #[test]
    fn test_not_taken() {
        assert!(!ShardAllocationDecision::NOT_TAKEN.is_decision_taken());
    }
}
