//! Cluster metadata: index definitions, voting configurations, dynamic settings

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const INDEX_ROUTING_REQUIRE_PREFIX: &str = "index.routing.allocation.require.";
pub const INDEX_ROUTING_INCLUDE_PREFIX: &str = "index.routing.allocation.include.";
pub const INDEX_ROUTING_EXCLUDE_PREFIX: &str = "index.routing.allocation.exclude.";
pub const INDEX_TOTAL_SHARDS_PER_NODE: &str = "index.routing.allocation.total_shards_per_node";
pub const INDEX_MAX_RETRIES: &str = "index.allocation.max_retries";

/// Definition of one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl IndexMetadata {
    pub fn new(name: impl Into<String>, number_of_shards: u32, number_of_replicas: u32) -> Self {
        Self {
            name: name.into(),
            number_of_shards,
            number_of_replicas,
            settings: BTreeMap::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.starts_with('_') || self.name.contains(['/', ' ', ',']) {
            return Err(Error::InvalidState(format!("invalid index name [{}]", self.name)));
        }
        if self.number_of_shards == 0 {
            return Err(Error::InvalidState(format!(
                "index [{}] must have at least one shard",
                self.name
            )));
        }
        if let Some(raw) = self.settings.get(INDEX_TOTAL_SHARDS_PER_NODE) {
            raw.parse::<u32>().map_err(|_| {
                Error::InvalidState(format!("{} must be a number, got [{}]", INDEX_TOTAL_SHARDS_PER_NODE, raw))
            })?;
        }
        Ok(())
    }

    /// Copies per shard: one primary plus the replicas
    pub fn copies_per_shard(&self) -> usize {
        1 + self.number_of_replicas as usize
    }

    pub fn require_filters(&self) -> BTreeMap<String, String> {
        settings_with_prefix(&self.settings, INDEX_ROUTING_REQUIRE_PREFIX)
    }

    pub fn include_filters(&self) -> BTreeMap<String, String> {
        settings_with_prefix(&self.settings, INDEX_ROUTING_INCLUDE_PREFIX)
    }

    pub fn exclude_filters(&self) -> BTreeMap<String, String> {
        settings_with_prefix(&self.settings, INDEX_ROUTING_EXCLUDE_PREFIX)
    }

    pub fn total_shards_per_node(&self) -> Option<u32> {
        self.settings
            .get(INDEX_TOTAL_SHARDS_PER_NODE)
            .and_then(|v| v.parse().ok())
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.settings.get(INDEX_MAX_RETRIES).and_then(|v| v.parse().ok())
    }
}

/// Entries under `prefix`, keyed by the remainder of the setting name
pub fn settings_with_prefix(
    settings: &BTreeMap<String, String>,
    prefix: &str,
) -> BTreeMap<String, String> {
    settings
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(prefix).map(|attr| (attr.to_string(), v.clone())))
        .collect()
}

/// Set of master-eligible node ids whose votes count
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingConfiguration(BTreeSet<String>);

impl VotingConfiguration {
    pub fn new<I, S>(node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(node_ids.into_iter().map(Into::into).collect())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.0.contains(node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Strict majority of this configuration is among `votes`
    pub fn has_quorum<'a>(&self, votes: impl IntoIterator<Item = &'a str>) -> bool {
        let mut counted = BTreeSet::new();
        for vote in votes {
            if self.0.contains(vote) {
                counted.insert(vote);
            }
        }
        counted.len() * 2 > self.0.len()
    }
}

impl std::fmt::Display for VotingConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Voting configurations carried in the cluster state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationMetadata {
    pub last_committed_config: VotingConfiguration,
    pub last_accepted_config: VotingConfiguration,
    #[serde(default)]
    pub voting_exclusions: BTreeSet<String>,
}

/// Metadata section of the cluster state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub indices: BTreeMap<String, IndexMetadata>,
    pub coordination: CoordinationMetadata,
    /// Dynamic cluster settings, override the node's allocation config
    #[serde(default)]
    pub cluster_settings: BTreeMap<String, String>,
}

impl Metadata {
    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indices.get(name)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_requires_strict_majority() {
        let config = VotingConfiguration::new(["a", "b", "c"]);
        assert!(config.has_quorum(["a", "b"]));
        assert!(!config.has_quorum(["a"]));
        // votes outside the configuration never count
        assert!(!config.has_quorum(["a", "x", "y"]));
        // duplicate votes count once
        assert!(!config.has_quorum(["a", "a"]));

        let even = VotingConfiguration::new(["a", "b", "c", "d"]);
        assert!(!even.has_quorum(["a", "b"]));
        assert!(even.has_quorum(["a", "b", "c"]));

        assert!(!VotingConfiguration::empty().has_quorum(["a"]));
    }

    #[test]
    fn test_index_routing_filters() {
        let index = IndexMetadata::new("logs", 2, 1)
            .with_setting("index.routing.allocation.require.zone", "a")
            .with_setting("index.routing.allocation.exclude._name", "n3")
            .with_setting(INDEX_TOTAL_SHARDS_PER_NODE, "2");

        assert_eq!(index.require_filters().get("zone").unwrap(), "a");
        assert_eq!(index.exclude_filters().get("_name").unwrap(), "n3");
        assert!(index.include_filters().is_empty());
        assert_eq!(index.total_shards_per_node(), Some(2));
        assert_eq!(index.copies_per_shard(), 2);
    }

    #[test]
    fn test_index_validation() {
        assert!(IndexMetadata::new("ok", 1, 0).validate().is_ok());
        assert!(IndexMetadata::new("", 1, 0).validate().is_err());
        assert!(IndexMetadata::new("_hidden", 1, 0).validate().is_err());
        assert!(IndexMetadata::new("none", 0, 0).validate().is_err());
        assert!(IndexMetadata::new("bad", 1, 0)
            .with_setting(INDEX_TOTAL_SHARDS_PER_NODE, "many")
            .validate()
            .is_err());
    }
}
