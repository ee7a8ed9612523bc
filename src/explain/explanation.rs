//! Explain output

use crate::allocation::cluster_info::ClusterInfo;
use crate::allocation::decision::ShardAllocationDecision;
use crate::cluster::{DiscoveryNode, ShardRouting, ShardRoutingState, UnassignedInfo};
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: String,
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl From<&DiscoveryNode> for NodeSummary {
    fn from(node: &DiscoveryNode) -> Self {
        Self {
            id: node.id().to_string(),
            name: node.name().to_string(),
            address: node.address().to_string(),
            attributes: node.attributes().clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAllocationExplanation {
    pub index: String,
    pub shard: u32,
    pub primary: bool,
    pub current_state: ShardRoutingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<NodeSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relocation_target_node: Option<NodeSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unassigned_info: Option<UnassignedInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_info: Option<ClusterInfo>,
    pub decision: ShardAllocationDecision,
}

impl ClusterAllocationExplanation {
    pub fn new(
        shard: &ShardRouting,
        current_node: Option<&DiscoveryNode>,
        relocation_target_node: Option<&DiscoveryNode>,
        cluster_info: Option<ClusterInfo>,
        decision: ShardAllocationDecision,
    ) -> Self {
        Self {
            index: shard.shard_id.index.clone(),
            shard: shard.shard_id.id,
            primary: shard.primary,
            current_state: shard.state,
            current_node: current_node.map(NodeSummary::from),
            relocation_target_node: relocation_target_node.map(NodeSummary::from),
            unassigned_info: shard.unassigned_info.clone(),
            cluster_info,
            decision,
        }
    }

    /// True when the decision was not computed, e.g. for a moving shard
    pub fn is_decision_taken(&self) -> bool {
        self.decision.is_decision_taken()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("failed to serialize explanation: {}", e)))
    }
}
