//! Shared helpers for in-process cluster tests

#![allow(dead_code)]

use shardcoord::cluster::{ShardRouting, ShardRoutingState};
use shardcoord::{ClusterNode, Config, LocalTransport};
use std::time::Duration;

pub fn address(name: &str) -> String {
    format!("{}:9300", name)
}

/// Fast timings so elections and failure detection finish within a test
pub fn node_config(name: &str, voters: &[&str]) -> Config {
    let mut config = Config::default();
    config.node.id = Some(name.to_string());
    config.node.name = name.to_string();
    config.node.address = address(name);
    config.discovery.seed_hosts = voters.iter().map(|v| address(v)).collect();
    config.discovery.initial_voting_nodes = voters.iter().map(|v| v.to_string()).collect();
    config.cluster.election_initial_timeout_ms = 20;
    config.cluster.election_back_off_ms = 20;
    config.cluster.election_max_timeout_ms = 300;
    config.cluster.follower_check_interval_ms = 50;
    config.cluster.follower_check_timeout_ms = 100;
    config.cluster.leader_timeout_ms = 500;
    config.cluster.publish_timeout_ms = 1_000;
    config.cluster.join_retry_delay_ms = 50;
    config.cluster.join_retry_max_delay_ms = 500;
    config
}

pub async fn start_cluster(transport: &LocalTransport, names: &[&str]) -> Vec<ClusterNode> {
    let mut nodes = Vec::new();
    for name in names {
        nodes.push(ClusterNode::start(node_config(name, names), transport).await.unwrap());
    }
    nodes
}

/// Polls `condition` every 10ms; false if it never held within `timeout`
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn leader(nodes: &[ClusterNode]) -> Option<&ClusterNode> {
    nodes.iter().find(|n| n.is_leader())
}

/// One leader known to every node, every node in the applied state
pub fn formed(nodes: &[ClusterNode]) -> bool {
    let Some(leader) = leader(nodes) else {
        return false;
    };
    nodes.iter().all(|n| {
        let view = n.current_state_view();
        !view.stale
            && view.state.nodes.len() == nodes.len()
            && view.state.nodes.leader_node_id() == Some(leader.local_node().id())
    })
}

pub fn initializing(node: &ClusterNode) -> Vec<ShardRouting> {
    node.current_state()
        .routing_table
        .shards_with_state(ShardRoutingState::Initializing)
        .into_iter()
        .cloned()
        .collect()
}

/// Reports every initializing copy as started until none are left
pub async fn start_all_shards(leader: &ClusterNode) {
    for _ in 0..50 {
        let pending = initializing(leader);
        if pending.is_empty() {
            return;
        }
        leader.shards_started(pending).await.unwrap();
    }
    panic!("shards kept initializing");
}

pub async fn shutdown_all(nodes: &[ClusterNode]) {
    for node in nodes {
        node.shutdown().await;
    }
}
