//! Discovery nodes: the identity of every cluster member

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Node roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Master-eligible: may vote and be elected
    Master,
    /// May hold shard copies
    Data,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Data => write!(f, "data"),
        }
    }
}

/// A cluster member. Identity is the id; the address may change across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    id: String,
    name: String,
    address: String,
    roles: BTreeSet<NodeRole>,
    attributes: BTreeMap<String, String>,
    version: semver::Version,
}

impl DiscoveryNode {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        roles: impl IntoIterator<Item = NodeRole>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            roles: roles.into_iter().collect(),
            attributes: BTreeMap::new(),
            version: current_version(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn with_version(mut self, version: semver::Version) -> Self {
        self.version = version;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn roles(&self) -> &BTreeSet<NodeRole> {
        &self.roles
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn version(&self) -> &semver::Version {
        &self.version
    }

    pub fn is_master_eligible(&self) -> bool {
        self.roles.contains(&NodeRole::Master)
    }

    pub fn is_data_node(&self) -> bool {
        self.roles.contains(&NodeRole::Data)
    }
}

impl std::fmt::Display for DiscoveryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}{{{}}}{{{}}}", self.name, self.id, self.address)
    }
}

/// Version of this build, used for nodes created without an explicit version
pub fn current_version() -> semver::Version {
    semver::Version::parse(crate::VERSION).unwrap_or_else(|_| semver::Version::new(0, 0, 0))
}

/// The node set of a cluster state, keyed (and iterated) by node id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    nodes: BTreeMap<String, DiscoveryNode>,
    leader_node_id: Option<String>,
}

impl DiscoveryNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&DiscoveryNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn data_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|n| n.is_data_node())
    }

    pub fn master_eligible_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|n| n.is_master_eligible())
    }

    pub fn leader_node_id(&self) -> Option<&str> {
        self.leader_node_id.as_deref()
    }

    pub fn leader(&self) -> Option<&DiscoveryNode> {
        self.leader_node_id.as_deref().and_then(|id| self.nodes.get(id))
    }

    pub fn find_by_address(&self, address: &str) -> Option<&DiscoveryNode> {
        self.nodes.values().find(|n| n.address() == address)
    }

    /// Resolve a node by id first, then by name
    pub fn resolve_node(&self, id_or_name: &str) -> Result<&DiscoveryNode> {
        if let Some(node) = self.nodes.get(id_or_name) {
            return Ok(node);
        }
        let mut by_name = self.nodes.values().filter(|n| n.name() == id_or_name);
        match (by_name.next(), by_name.next()) {
            (Some(node), None) => Ok(node),
            (Some(_), Some(_)) => Err(Error::UnknownNode(format!(
                "{} (matches multiple nodes)",
                id_or_name
            ))),
            _ => Err(Error::UnknownNode(id_or_name.to_string())),
        }
    }

    pub fn min_version(&self) -> Option<&semver::Version> {
        self.nodes.values().map(|n| n.version()).min()
    }

    pub fn max_version(&self) -> Option<&semver::Version> {
        self.nodes.values().map(|n| n.version()).max()
    }

    pub fn with_node(mut self, node: DiscoveryNode) -> Self {
        self.add(node);
        self
    }

    pub fn with_leader(mut self, leader_node_id: Option<String>) -> Self {
        self.leader_node_id = leader_node_id;
        self
    }

    pub(crate) fn add(&mut self, node: DiscoveryNode) {
        self.nodes.insert(node.id().to_string(), node);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<DiscoveryNode> {
        let removed = self.nodes.remove(id);
        if self.leader_node_id.as_deref() == Some(id) {
            self.leader_node_id = None;
        }
        removed
    }

    pub(crate) fn set_leader(&mut self, leader_node_id: Option<String>) {
        self.leader_node_id = leader_node_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, name: &str) -> DiscoveryNode {
        DiscoveryNode::new(id, name, format!("{}:9300", id), [NodeRole::Master, NodeRole::Data])
    }

    #[test]
    fn test_resolve_by_id_then_name() {
        let nodes = DiscoveryNodes::new()
            .with_node(node("a1b2", "alpha"))
            .with_node(node("c3d4", "beta"));

        assert_eq!(nodes.resolve_node("a1b2").unwrap().name(), "alpha");
        assert_eq!(nodes.resolve_node("beta").unwrap().id(), "c3d4");
        assert_eq!(
            nodes.resolve_node("gamma").unwrap_err(),
            Error::UnknownNode("gamma".into())
        );
    }

    #[test]
    fn test_ambiguous_name() {
        let nodes = DiscoveryNodes::new()
            .with_node(node("n1", "same"))
            .with_node(node("n2", "same"));
        assert!(nodes.resolve_node("same").is_err());
    }

    #[test]
    fn test_roles_and_leader_removal() {
        let data_only = DiscoveryNode::new("d1", "d1", "d1:9300", [NodeRole::Data]);
        let mut nodes = DiscoveryNodes::new()
            .with_node(node("m1", "m1"))
            .with_node(data_only)
            .with_leader(Some("m1".into()));

        assert_eq!(nodes.master_eligible_nodes().count(), 1);
        assert_eq!(nodes.data_nodes().count(), 2);
        assert_eq!(nodes.leader().unwrap().id(), "m1");

        nodes.remove("m1");
        assert!(nodes.leader_node_id().is_none());
    }
}
