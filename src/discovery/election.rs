//! Election strategies: when does a set of votes win?

use crate::cluster::{DiscoveryNode, VotingConfiguration};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Votes tallied by node id; a second vote from the same node is a no-op
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCollection {
    votes: BTreeMap<String, DiscoveryNode>,
}

impl VoteCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the node had already voted
    pub fn add_vote(&mut self, node: DiscoveryNode) -> bool {
        if self.votes.contains_key(node.id()) {
            return false;
        }
        self.votes.insert(node.id().to_string(), node);
        true
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.votes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.votes.keys().map(String::as_str)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.votes.values()
    }

    pub fn is_quorum(&self, config: &VotingConfiguration) -> bool {
        config.has_quorum(self.node_ids())
    }

    pub fn clear(&mut self) {
        self.votes.clear();
    }
}

/// Pluggable quorum policy, stateless given its inputs
pub trait ElectionStrategy: Send + Sync {
    /// Extra constraints a custom strategy may impose on top of the double majority
    #[allow(clippy::too_many_arguments)]
    fn satisfies_additional_quorum_constraints(
        &self,
        _local_node: &DiscoveryNode,
        _local_current_term: u64,
        _local_accepted_term: u64,
        _local_accepted_version: u64,
        _last_committed_config: &VotingConfiguration,
        _last_accepted_config: &VotingConfiguration,
        _join_votes: &VoteCollection,
    ) -> bool {
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn is_election_quorum(
        &self,
        local_node: &DiscoveryNode,
        local_current_term: u64,
        local_accepted_term: u64,
        local_accepted_version: u64,
        last_committed_config: &VotingConfiguration,
        last_accepted_config: &VotingConfiguration,
        join_votes: &VoteCollection,
    ) -> bool {
        local_node.is_master_eligible()
            && is_good_quorum(last_committed_config, last_accepted_config, join_votes)
            && self.satisfies_additional_quorum_constraints(
                local_node,
                local_current_term,
                local_accepted_term,
                local_accepted_version,
                last_committed_config,
                last_accepted_config,
                join_votes,
            )
    }

    fn is_publish_quorum(
        &self,
        votes: &VoteCollection,
        last_committed_config: &VotingConfiguration,
        latest_published_config: &VotingConfiguration,
    ) -> bool {
        is_good_quorum(last_committed_config, latest_published_config, votes)
    }
}

/// Majority of both configurations
pub fn is_good_quorum(
    last_committed_config: &VotingConfiguration,
    last_accepted_config: &VotingConfiguration,
    votes: &VoteCollection,
) -> bool {
    votes.is_quorum(last_committed_config) && votes.is_quorum(last_accepted_config)
}

/// Majority of the last committed and last accepted configurations
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultElectionStrategy;

impl ElectionStrategy for DefaultElectionStrategy {}
