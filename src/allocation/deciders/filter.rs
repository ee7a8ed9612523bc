//! Node filters from index settings and cluster settings
//!
//! `require` needs every listed attribute to match, `include` needs any one
//! of them, `exclude` rejects the node if any one matches. Values are comma
//! separated and may use `*` wildcards. Besides custom attributes the keys
//! `_id`, `_name` and `_address` match the node's own fields.

use super::AllocationDecider;
use crate::allocation::decision::Decision;
use crate::allocation::routing_allocation::RoutingAllocation;
use crate::allocation::routing_nodes::RoutingNode;
use crate::cluster::{DiscoveryNode, ShardRouting};
use std::collections::BTreeMap;

pub struct FilterAllocationDecider;

impl FilterAllocationDecider {
    pub const NAME: &'static str = "filter";

    fn decide(shard: &ShardRouting, node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Decision {
        let Some(discovery_node) = allocation.nodes().get(node.node_id()) else {
            return Decision::no(Self::NAME, "node is not part of the cluster");
        };

        if let Some(metadata) = allocation.index_metadata(&shard.shard_id.index) {
            if let Some(decision) = Self::check_filters(
                discovery_node,
                "index setting [index.routing.allocation",
                &metadata.require_filters(),
                &metadata.include_filters(),
                &metadata.exclude_filters(),
            ) {
                return decision;
            }
        }

        let settings = allocation.settings();
        if let Some(decision) = Self::check_filters(
            discovery_node,
            "cluster setting [cluster.routing.allocation",
            &settings.require,
            &settings.include,
            &settings.exclude,
        ) {
            return decision;
        }
        Decision::yes(Self::NAME, "node passes include/exclude/require filters")
    }

    fn check_filters(
        node: &DiscoveryNode,
        source: &str,
        require: &BTreeMap<String, String>,
        include: &BTreeMap<String, String>,
        exclude: &BTreeMap<String, String>,
    ) -> Option<Decision> {
        if let Some((key, value)) = require.iter().find(|(k, v)| !node_matches(node, k, v)) {
            return Some(Decision::no(
                Self::NAME,
                format!("node does not match {}.require.{}:\"{}\"]", source, key, value),
            ));
        }
        if !include.is_empty() && !include.iter().any(|(k, v)| node_matches(node, k, v)) {
            let filters: Vec<String> = include.iter().map(|(k, v)| format!("{}:\"{}\"", k, v)).collect();
            return Some(Decision::no(
                Self::NAME,
                format!("node does not match {}.include] filters [{}]", source, filters.join(",")),
            ));
        }
        if let Some((key, value)) = exclude.iter().find(|(k, v)| node_matches(node, k, v)) {
            return Some(Decision::no(
                Self::NAME,
                format!("node matches {}.exclude.{}:\"{}\"]", source, key, value),
            ));
        }
        None
    }
}

impl AllocationDecider for FilterAllocationDecider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        Self::decide(shard, node, allocation)
    }

    fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        Self::decide(shard, node, allocation)
    }
}

fn node_matches(node: &DiscoveryNode, key: &str, values: &str) -> bool {
    let actual = match key {
        "_id" => Some(node.id()),
        "_name" => Some(node.name()),
        "_address" | "_host" | "_ip" => Some(node.address()),
        attr => node.attribute(attr),
    };
    let Some(actual) = actual else {
        return false;
    };
    values
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .any(|pattern| {
            simple_match(pattern, actual)
                || (key == "_address" && simple_match(pattern, host_part(actual)))
        })
}

fn host_part(address: &str) -> &str {
    match address.rsplit_once(':') {
        Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
        None => address,
    }
}

/// Glob match where `*` stands for any run of characters
pub fn simple_match(pattern: &str, value: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == value,
        Some((prefix, rest)) => {
            let Some(value) = value.strip_prefix(prefix) else {
                return false;
            };
            if rest.is_empty() {
                return true;
            }
            value
                .char_indices()
                .map(|(i, _)| i)
                .chain(std::iter::once(value.len()))
                .any(|i| simple_match(rest, &value[i..]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::deciders::test_support::*;
    use crate::allocation::deciders::AllocationDeciders;
    use crate::allocation::decision::DebugMode;
    use crate::cluster::metadata::{INDEX_ROUTING_EXCLUDE_PREFIX, INDEX_ROUTING_REQUIRE_PREFIX};
    use crate::cluster::IndexMetadata;
    use crate::common::AllocationConfig;

    #[test]
    fn test_simple_match() {
        assert!(simple_match("rack1", "rack1"));
        assert!(!simple_match("rack1", "rack10"));
        assert!(simple_match("rack*", "rack10"));
        assert!(simple_match("*1", "rack1"));
        assert!(simple_match("r*k*", "rack1"));
        assert!(simple_match("*", ""));
        assert!(!simple_match("a*b", "acd"));
    }

    fn decide_for(index: IndexMetadata, settings: AllocationConfig) -> Vec<(String, bool)> {
        let state = state_with(
            vec![
                data_node("n1").with_attribute("zone", "a"),
                data_node("n2").with_attribute("zone", "b"),
                data_node("n3"),
            ],
            vec![index],
        );
        let deciders = AllocationDeciders::new(vec![]);
        let allocation = RoutingAllocation::new(
            &deciders,
            &state,
            Default::default(),
            Default::default(),
            settings,
            DebugMode::Off,
        );
        let shard = allocation.routing_nodes().unassigned()[0].clone();
        allocation
            .routing_nodes()
            .nodes()
            .map(|n| {
                let d = FilterAllocationDecider.can_allocate(&shard, n, &allocation);
                (n.node_id().to_string(), d.is_yes())
            })
            .collect()
    }

    #[test]
    fn test_require_and_exclude() {
        let index = IndexMetadata::new("logs", 1, 0)
            .with_setting(format!("{}zone", INDEX_ROUTING_REQUIRE_PREFIX), "a,b");
        let result = decide_for(index, AllocationConfig::default());
        assert_eq!(
            result,
            vec![("n1".into(), true), ("n2".into(), true), ("n3".into(), false)]
        );

        let index = IndexMetadata::new("logs", 1, 0)
            .with_setting(format!("{}_id", INDEX_ROUTING_EXCLUDE_PREFIX), "n1");
        let result = decide_for(index, AllocationConfig::default());
        assert_eq!(
            result,
            vec![("n1".into(), false), ("n2".into(), true), ("n3".into(), true)]
        );
    }

    #[test]
    fn test_cluster_include() {
        let mut settings = AllocationConfig::default();
        settings.include.insert("_name".into(), "n2,n3".into());
        let result = decide_for(IndexMetadata::new("logs", 1, 0), settings);
        assert_eq!(
            result,
            vec![("n1".into(), false), ("n2".into(), true), ("n3".into(), true)]
        );
    }
}
