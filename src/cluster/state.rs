//! Cluster state and the diffs that produce new states

use crate::cluster::blocks::ClusterBlocks;
use crate::cluster::metadata::{CoordinationMetadata, IndexMetadata, Metadata};
use crate::cluster::node::{DiscoveryNode, DiscoveryNodes};
use crate::cluster::routing::RoutingTable;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable, versioned description of the whole cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster_name: String,
    pub term: u64,
    pub version: u64,
    pub state_uuid: String,
    pub nodes: DiscoveryNodes,
    pub routing_table: RoutingTable,
    pub metadata: Metadata,
    pub blocks: ClusterBlocks,
}

impl ClusterState {
    /// Term 0, version 0: the state every node starts from
    pub fn empty(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            term: 0,
            version: 0,
            state_uuid: "_na_".to_string(),
            nodes: DiscoveryNodes::new(),
            routing_table: RoutingTable::new(),
            metadata: Metadata::default(),
            blocks: ClusterBlocks::new(),
        }
    }

    /// Strictly newer: higher term, or same term and higher version
    pub fn supersedes(&self, other: &ClusterState) -> bool {
        (self.term, self.version) > (other.term, other.version)
    }

    pub fn last_committed_config(&self) -> &crate::cluster::VotingConfiguration {
        &self.metadata.coordination.last_committed_config
    }

    pub fn last_accepted_config(&self) -> &crate::cluster::VotingConfiguration {
        &self.metadata.coordination.last_accepted_config
    }

    /// Copy carrying a new term/version and a fresh uuid
    pub fn next(&self, term: u64, version: u64) -> ClusterState {
        ClusterState {
            term,
            version,
            state_uuid: uuid::Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }

    /// Routing must reference known nodes and respect the copy invariants
    pub fn validate(&self) -> Result<()> {
        for index in self.metadata.indices.values() {
            index.validate()?;
        }
        self.routing_table.validate(&self.metadata)?;
        for shard in self.routing_table.all_shards() {
            for node in shard.current_node_id.iter().chain(shard.relocating_node_id.iter()) {
                if !self.nodes.contains(node) {
                    return Err(Error::InvalidState(format!(
                        "shard {} assigned to unknown node [{}]",
                        shard.shard_id, node
                    )));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cluster [{}] term {} version {} uuid {} ({} nodes, leader {})",
            self.cluster_name,
            self.term,
            self.version,
            self.state_uuid,
            self.nodes.len(),
            self.nodes.leader_node_id().unwrap_or("none")
        )
    }
}

/// A change to a specific base state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStateDiff {
    pub base_term: u64,
    pub base_version: u64,
    #[serde(default)]
    pub nodes_added: Vec<DiscoveryNode>,
    #[serde(default)]
    pub nodes_removed: Vec<String>,
    #[serde(default)]
    pub indices_upserted: Vec<IndexMetadata>,
    #[serde(default)]
    pub indices_removed: Vec<String>,
    pub routing_table: Option<RoutingTable>,
    pub blocks: Option<ClusterBlocks>,
    pub cluster_settings: Option<BTreeMap<String, String>>,
    pub coordination: Option<CoordinationMetadata>,
}

impl ClusterStateDiff {
    pub fn new(base: &ClusterState) -> Self {
        Self {
            base_term: base.term,
            base_version: base.version,
            ..Default::default()
        }
    }

    pub fn add_node(mut self, node: DiscoveryNode) -> Self {
        self.nodes_added.push(node);
        self
    }

    pub fn remove_node(mut self, node_id: impl Into<String>) -> Self {
        self.nodes_removed.push(node_id.into());
        self
    }

    pub fn upsert_index(mut self, index: IndexMetadata) -> Self {
        self.indices_upserted.push(index);
        self
    }

    pub fn remove_index(mut self, name: impl Into<String>) -> Self {
        self.indices_removed.push(name.into());
        self
    }

    pub fn with_routing_table(mut self, routing_table: RoutingTable) -> Self {
        self.routing_table = Some(routing_table);
        self
    }

    pub fn with_blocks(mut self, blocks: ClusterBlocks) -> Self {
        self.blocks = Some(blocks);
        self
    }

    pub fn with_cluster_settings(mut self, settings: BTreeMap<String, String>) -> Self {
        self.cluster_settings = Some(settings);
        self
    }

    pub fn with_coordination(mut self, coordination: CoordinationMetadata) -> Self {
        self.coordination = Some(coordination);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.nodes_added.is_empty()
            && self.nodes_removed.is_empty()
            && self.indices_upserted.is_empty()
            && self.indices_removed.is_empty()
            && self.routing_table.is_none()
            && self.blocks.is_none()
            && self.cluster_settings.is_none()
            && self.coordination.is_none()
    }

    pub fn check_base(&self, base: &ClusterState) -> Result<()> {
        if self.base_term != base.term || self.base_version != base.version {
            return Err(Error::StaleState {
                base_term: self.base_term,
                base_version: self.base_version,
                term: base.term,
                version: base.version,
            });
        }
        Ok(())
    }

    /// Applies the diff to `base`, producing an unvalidated state with the
    /// given term and version. A base mismatch is `StaleState`.
    pub fn apply(&self, base: &ClusterState, term: u64, version: u64) -> Result<ClusterState> {
        self.check_base(base)?;
        let mut state = base.next(term, version);

        for node_id in &self.nodes_removed {
            state.nodes.remove(node_id);
        }
        for node in &self.nodes_added {
            state.nodes.add(node.clone());
        }

        for name in &self.indices_removed {
            state.metadata.indices.remove(name);
            state.routing_table.remove_index(name);
            state.blocks.remove_index(name);
        }
        for index in &self.indices_upserted {
            index.validate()?;
            if let Some(existing) = state.metadata.index(&index.name) {
                if existing.number_of_shards != index.number_of_shards {
                    return Err(Error::InvalidState(format!(
                        "cannot change number_of_shards of index [{}]",
                        index.name
                    )));
                }
            }
            state.metadata.indices.insert(index.name.clone(), index.clone());
        }

        match &self.routing_table {
            Some(routing_table) => state.routing_table = routing_table.clone(),
            None => {
                for index in &self.indices_upserted {
                    if state.routing_table.has_index(&index.name) {
                        state.routing_table.update_number_of_replicas(index);
                    } else {
                        state.routing_table.add_as_new(index);
                    }
                }
            }
        }
        if let Some(blocks) = &self.blocks {
            state.blocks = blocks.clone();
        }
        if let Some(settings) = &self.cluster_settings {
            state.metadata.cluster_settings = settings.clone();
        }
        if let Some(coordination) = &self.coordination {
            state.metadata.coordination = coordination.clone();
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::NodeRole;
    use crate::cluster::routing::{ShardRouting, UnassignedReason};

    fn node(id: &str) -> DiscoveryNode {
        DiscoveryNode::new(id, id, format!("{}:9300", id), [NodeRole::Master, NodeRole::Data])
    }

    #[test]
    fn test_apply_creates_routing_for_new_index() {
        let base = ClusterState::empty("test");
        let diff = ClusterStateDiff::new(&base)
            .add_node(node("n1"))
            .upsert_index(IndexMetadata::new("logs", 2, 1));
        let state = diff.apply(&base, 1, 1).unwrap();

        assert_eq!(state.term, 1);
        assert_eq!(state.version, 1);
        assert_ne!(state.state_uuid, base.state_uuid);
        assert_eq!(state.routing_table.all_shards().count(), 4);
        state.validate().unwrap();
    }

    #[test]
    fn test_stale_base_rejected() {
        let base = ClusterState::empty("test");
        let next = ClusterStateDiff::new(&base).apply(&base, 1, 1).unwrap();
        let stale = ClusterStateDiff::new(&base).add_node(node("n1"));
        assert!(matches!(
            stale.apply(&next, 1, 2),
            Err(Error::StaleState { base_version: 0, version: 1, .. })
        ));
    }

    #[test]
    fn test_remove_index_clears_routing() {
        let base = ClusterState::empty("test");
        let with_index = ClusterStateDiff::new(&base)
            .upsert_index(IndexMetadata::new("logs", 1, 0))
            .apply(&base, 1, 1)
            .unwrap();
        let without = ClusterStateDiff::new(&with_index)
            .remove_index("logs")
            .apply(&with_index, 1, 2)
            .unwrap();
        assert!(!without.metadata.has_index("logs"));
        assert!(!without.routing_table.has_index("logs"));
    }

    #[test]
    fn test_validate_rejects_unknown_node() {
        let base = ClusterState::empty("test");
        let index = IndexMetadata::new("logs", 1, 0);
        let mut state = ClusterStateDiff::new(&base)
            .upsert_index(index)
            .apply(&base, 1, 1)
            .unwrap();
        let primary = state.routing_table.all_shards().next().unwrap().clone();
        state.routing_table =
            RoutingTable::from_shards(vec![primary.initialize("ghost", None).unwrap()]);
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_replica_count_changes_reshape_routing() {
        let base = ClusterState::empty("test");
        let created = ClusterStateDiff::new(&base)
            .add_node(node("n1"))
            .add_node(node("n2"))
            .add_node(node("n3"))
            .upsert_index(IndexMetadata::new("logs", 1, 2))
            .apply(&base, 1, 1)
            .unwrap();
        // primary on n1, one replica on n2, the other still unassigned
        let copies: Vec<ShardRouting> = created.routing_table.all_shards().cloned().collect();
        let primary = copies[0].initialize("n1", None).unwrap().move_to_started().unwrap();
        let replica = copies[1].initialize("n2", None).unwrap().move_to_started().unwrap();
        let placed = ClusterStateDiff::new(&created)
            .with_routing_table(RoutingTable::from_shards(vec![primary, replica, copies[2].clone()]))
            .apply(&created, 1, 2)
            .unwrap();
        placed.validate().unwrap();

        let lowered = ClusterStateDiff::new(&placed)
            .upsert_index(IndexMetadata::new("logs", 1, 1))
            .apply(&placed, 1, 3)
            .unwrap();
        lowered.validate().unwrap();
        let shard = lowered.routing_table.shard_routing_table("logs", 0).unwrap();
        assert_eq!(shard.copies().len(), 2);
        assert!(shard.copies().iter().all(|c| c.started()));

        let raised = ClusterStateDiff::new(&lowered)
            .upsert_index(IndexMetadata::new("logs", 1, 3))
            .apply(&lowered, 1, 4)
            .unwrap();
        raised.validate().unwrap();
        let shard = raised.routing_table.shard_routing_table("logs", 0).unwrap();
        assert_eq!(shard.copies().len(), 4);
        let added: Vec<&ShardRouting> = shard.copies().iter().filter(|c| c.unassigned()).collect();
        assert_eq!(added.len(), 2);
        assert!(added.iter().all(|c| !c.primary
            && c.unassigned_info.as_ref().map(|i| i.reason) == Some(UnassignedReason::ReplicaAdded)));

        let none = ClusterStateDiff::new(&raised)
            .upsert_index(IndexMetadata::new("logs", 1, 0))
            .apply(&raised, 1, 5)
            .unwrap();
        none.validate().unwrap();
        let shard = none.routing_table.shard_routing_table("logs", 0).unwrap();
        assert_eq!(shard.copies().len(), 1);
        assert_eq!(shard.primary_shard().unwrap().current_node_id(), Some("n1"));
    }

    #[test]
    fn test_supersedes_orders_by_term_then_version() {
        let a = ClusterState::empty("test").next(1, 10);
        let b = a.next(2, 1);
        assert!(b.supersedes(&a));
        assert!(!a.supersedes(&b));
        assert!(!a.supersedes(&a));
    }
}
