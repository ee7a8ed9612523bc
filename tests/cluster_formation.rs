//! Cluster formation, publication ordering and allocation across three nodes

mod support;

use shardcoord::cluster::ShardRoutingState;
use shardcoord::explain::ClusterAllocationExplainRequest;
use shardcoord::{Error, IndexMetadata, LocalTransport, Mode};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::*;

#[tokio::test]
async fn test_three_nodes_form_a_cluster() {
    let transport = LocalTransport::new();
    let nodes = start_cluster(&transport, &["n1", "n2", "n3"]).await;
    assert!(wait_until(Duration::from_secs(10), || formed(&nodes)).await);

    let leader = leader(&nodes).unwrap();
    let term = leader.coordinator().current_term();
    assert!(term > 0);
    for node in &nodes {
        assert_eq!(node.coordinator().current_term(), term);
        if node.local_node().id() != leader.local_node().id() {
            assert_eq!(node.mode(), Mode::Follower);
        }
        let config = node.current_state().last_committed_config().clone();
        assert_eq!(config.len(), 3);
    }

    shutdown_all(&nodes).await;
}

#[tokio::test]
async fn test_applied_states_only_move_forward() {
    let transport = LocalTransport::new();
    let nodes = start_cluster(&transport, &["n1", "n2", "n3"]).await;
    assert!(wait_until(Duration::from_secs(10), || formed(&nodes)).await);

    // record what one follower applies while the leader is busy
    let follower = nodes.iter().find(|n| !n.is_leader()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut rx = follower.coordinator().state_holder().subscribe();
    let recorder = {
        let seen = seen.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                seen.lock().unwrap().push((state.term, state.version));
            }
        })
    };

    let leader = leader(&nodes).unwrap();
    for i in 0..5 {
        leader.create_index(IndexMetadata::new(format!("index-{}", i), 2, 1)).await.unwrap();
    }
    start_all_shards(leader).await;
    assert!(
        wait_until(Duration::from_secs(5), || {
            follower.current_state().routing_table.shards_with_state(ShardRoutingState::Started).len() == 20
        })
        .await
    );

    recorder.abort();
    shutdown_all(&nodes).await;
    let seen = seen.lock().unwrap().clone();
    assert!(!seen.is_empty());
    for pair in seen.windows(2) {
        assert!(pair[1] > pair[0], "applied {:?} after {:?}", pair[1], pair[0]);
    }
}

#[tokio::test]
async fn test_indices_are_allocated_across_the_cluster() {
    let transport = LocalTransport::new();
    let nodes = start_cluster(&transport, &["n1", "n2", "n3"]).await;
    assert!(wait_until(Duration::from_secs(10), || formed(&nodes)).await);

    let leader = leader(&nodes).unwrap();
    leader.create_index(IndexMetadata::new("logs", 3, 1)).await.unwrap();
    start_all_shards(leader).await;

    let state = leader.current_state();
    assert_eq!(state.routing_table.shards_with_state(ShardRoutingState::Started).len(), 6);
    for index in state.routing_table.indices() {
        for shard in index.shards() {
            assert_eq!(shard.copies().iter().filter(|c| c.primary).count(), 1);
            let holders: BTreeSet<_> = shard.copies().iter().filter_map(|c| c.current_node_id()).collect();
            assert_eq!(holders.len(), 2);
        }
    }

    // every member converges on the same committed state
    assert!(
        wait_until(Duration::from_secs(5), || {
            nodes.iter().all(|n| n.current_state().version == state.version)
        })
        .await
    );

    // nothing is unassigned, on any member
    for node in &nodes {
        let err = node
            .explain_allocation(&ClusterAllocationExplainRequest::any_unassigned())
            .unwrap_err();
        assert_eq!(err, Error::NoUnassignedShards);
    }
    let explanation = nodes[0]
        .explain_allocation(&ClusterAllocationExplainRequest::shard("logs", 0, true))
        .unwrap();
    assert_eq!(explanation.current_state, ShardRoutingState::Started);
    assert!(explanation.decision.move_decision.as_ref().unwrap().can_remain());

    shutdown_all(&nodes).await;
}

#[tokio::test]
async fn test_followers_refuse_proposals() {
    let transport = LocalTransport::new();
    let nodes = start_cluster(&transport, &["n1", "n2", "n3"]).await;
    assert!(wait_until(Duration::from_secs(10), || formed(&nodes)).await);

    let leader_id = leader(&nodes).unwrap().local_node().id().to_string();
    let follower = nodes.iter().find(|n| !n.is_leader()).unwrap();
    let err = follower.create_index(IndexMetadata::new("logs", 1, 0)).await.unwrap_err();
    assert_eq!(err, Error::NotLeader(leader_id));

    shutdown_all(&nodes).await;
}
