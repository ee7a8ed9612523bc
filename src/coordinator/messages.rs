//! Messages exchanged by coordinators

use crate::cluster::{ClusterState, DiscoveryNode};
use serde::{Deserialize, Serialize};

/// Asks a peer who it knows about and whether it has a leader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeersRequest {
    pub source: DiscoveryNode,
    pub known_peers: Vec<DiscoveryNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeersResponse {
    pub node: DiscoveryNode,
    pub leader: Option<DiscoveryNode>,
    pub known_peers: Vec<DiscoveryNode>,
    pub current_term: u64,
}

/// Would the receiver vote for the source if it started an election?
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreVoteRequest {
    pub source: DiscoveryNode,
    pub current_term: u64,
    pub last_accepted_term: u64,
    pub last_accepted_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreVoteResponse {
    pub granted: bool,
    pub current_term: u64,
}

/// Sent by a candidate: join me in `term`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartJoinRequest {
    pub source: DiscoveryNode,
    pub term: u64,
}

/// A vote for `target` in `term`, carrying the voter's accepted state position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub source: DiscoveryNode,
    pub target: DiscoveryNode,
    pub term: u64,
    pub last_accepted_term: u64,
    pub last_accepted_version: u64,
}

/// Asks the leader to add the source to the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub source: DiscoveryNode,
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub source: DiscoveryNode,
    pub state: ClusterState,
}

impl PublishRequest {
    pub fn term(&self) -> u64 {
        self.state.term
    }

    pub fn version(&self) -> u64 {
        self.state.version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub term: u64,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyCommitRequest {
    pub source: DiscoveryNode,
    pub term: u64,
    pub version: u64,
}

/// Leader heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowerCheckRequest {
    pub source: DiscoveryNode,
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TransportRequest {
    Peers(PeersRequest),
    PreVote(PreVoteRequest),
    StartJoin(StartJoinRequest),
    Join(JoinRequest),
    Publish(PublishRequest),
    Commit(ApplyCommitRequest),
    FollowerCheck(FollowerCheckRequest),
}

impl TransportRequest {
    pub fn action(&self) -> &'static str {
        match self {
            TransportRequest::Peers(_) => "peers",
            TransportRequest::PreVote(_) => "pre_vote",
            TransportRequest::StartJoin(_) => "start_join",
            TransportRequest::Join(_) => "join",
            TransportRequest::Publish(_) => "publish",
            TransportRequest::Commit(_) => "commit",
            TransportRequest::FollowerCheck(_) => "follower_check",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportResponse {
    Peers(PeersResponse),
    PreVote(PreVoteResponse),
    /// Answer to a start-join: the receiver's vote
    Join(Join),
    Publish(PublishResponse),
    Ack,
}
