//! Explain requests

use serde::{Deserialize, Serialize};

/// Which shard copy to explain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShardSelector {
    /// The first unassigned copy in the routing table
    AnyUnassigned,
    Shard {
        index: String,
        shard: u32,
        primary: bool,
        /// Node id or name the copy must be on
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_node: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAllocationExplainRequest {
    pub selector: ShardSelector,
    #[serde(default)]
    pub include_yes_decisions: bool,
    #[serde(default)]
    pub include_disk_info: bool,
}

impl Default for ClusterAllocationExplainRequest {
    fn default() -> Self {
        Self::any_unassigned()
    }
}

impl ClusterAllocationExplainRequest {
    pub fn any_unassigned() -> Self {
        Self {
            selector: ShardSelector::AnyUnassigned,
            include_yes_decisions: false,
            include_disk_info: false,
        }
    }

    pub fn shard(index: impl Into<String>, shard: u32, primary: bool) -> Self {
        Self {
            selector: ShardSelector::Shard {
                index: index.into(),
                shard,
                primary,
                current_node: None,
            },
            include_yes_decisions: false,
            include_disk_info: false,
        }
    }

    /// Only meaningful for a shard selector
    pub fn with_current_node(mut self, node: impl Into<String>) -> Self {
        if let ShardSelector::Shard { current_node, .. } = &mut self.selector {
            *current_node = Some(node.into());
        }
        self
    }

    pub fn include_yes_decisions(mut self, include: bool) -> Self {
        self.include_yes_decisions = include;
        self
    }

    pub fn include_disk_info(mut self, include: bool) -> Self {
        self.include_disk_info = include;
        self
    }
}

impl std::fmt::Display for ClusterAllocationExplainRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.selector {
            ShardSelector::AnyUnassigned => write!(f, "ClusterAllocationExplainRequest[useAnyUnassignedShard=true")?,
            ShardSelector::Shard {
                index,
                shard,
                primary,
                current_node,
            } => {
                write!(f, "ClusterAllocationExplainRequest[index={},shard={},primary?={}", index, shard, primary)?;
                if let Some(node) = current_node {
                    write!(f, ",currentNode={}", node)?;
                }
            }
        }
        write!(f, ",includeYesDecisions?={}]", self.include_yes_decisions)
    }
}
