//! Error types for shardcoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown discovery type [{0}]")]
    UnknownDiscoveryType(String),

    #[error("Unknown seed providers {0:?}")]
    UnknownSeedProviders(Vec<String>),

    #[error("Unknown election strategy {0}")]
    UnknownElectionStrategy(String),

    #[error("Cannot register {kind} [{name}] twice")]
    DuplicateRegistration { kind: &'static str, name: String },

    // === Consensus Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Consensus timeout after {0}ms")]
    ConsensusTimeout(u64),

    #[error("Stale cluster state: diff based on term {base_term} version {base_version}, current is term {term} version {version}")]
    StaleState {
        base_term: u64,
        base_version: u64,
        term: u64,
        version: u64,
    },

    #[error("Coordination state rejected: {0}")]
    CoordinationStateRejected(String),

    #[error("Publication failed: {0}")]
    PublicationFailed(String),

    #[error("Join rejected: {0}")]
    JoinRejected(String),

    #[error("Invalid cluster state: {0}")]
    InvalidState(String),

    // === Explain Errors ===
    #[error("unable to find any unassigned shards to explain")]
    NoUnassignedShards,

    #[error("unable to find primary shard assigned to node [{0}]")]
    PrimaryNotOnNode(String),

    #[error("unable to find a replica shard assigned to node [{0}]")]
    ReplicaNotOnNode(String),

    #[error("unable to find any shards to explain [{0}] in the routing table")]
    NoShardToExplain(String),

    #[error("no such index [{0}]")]
    IndexNotFound(String),

    #[error("no such shard [{index}][{shard}]")]
    ShardNotFound { index: String, shard: u32 },

    #[error("failed to resolve [{0}], no matching nodes")]
    UnknownNode(String),

    #[error("blocked by: [{0}]")]
    ClusterBlocked(String),

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Node {0} is shutting down")]
    ShuttingDown(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed(_)
                | Error::ConsensusTimeout(_)
                | Error::NotLeader(_)
                | Error::StaleState { .. }
        )
    }

    /// Errors caused by a bad caller request rather than a node fault
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::NoUnassignedShards
                | Error::PrimaryNotOnNode(_)
                | Error::ReplicaNotOnNode(_)
                | Error::NoShardToExplain(_)
                | Error::IndexNotFound(_)
                | Error::ShardNotFound { .. }
                | Error::UnknownNode(_)
        )
    }

    /// Fatal startup errors: the process must not continue half-configured
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_)
                | Error::UnknownDiscoveryType(_)
                | Error::UnknownSeedProviders(_)
                | Error::UnknownElectionStrategy(_)
                | Error::DuplicateRegistration { .. }
        )
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::UnknownDiscoveryType(_) => "UNKNOWN_DISCOVERY_TYPE",
            Error::UnknownSeedProviders(_) => "UNKNOWN_SEED_PROVIDERS",
            Error::UnknownElectionStrategy(_) => "UNKNOWN_ELECTION_STRATEGY",
            Error::DuplicateRegistration { .. } => "DUPLICATE_REGISTRATION",
            Error::NotLeader(_) => "NOT_LEADER",
            Error::ConsensusTimeout(_) => "CONSENSUS_TIMEOUT",
            Error::StaleState { .. } => "STALE_STATE",
            Error::CoordinationStateRejected(_) => "COORDINATION_STATE_REJECTED",
            Error::PublicationFailed(_) => "PUBLICATION_FAILED",
            Error::JoinRejected(_) => "JOIN_REJECTED",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::NoUnassignedShards => "NO_UNASSIGNED_SHARDS",
            Error::PrimaryNotOnNode(_) => "PRIMARY_NOT_ON_NODE",
            Error::ReplicaNotOnNode(_) => "REPLICA_NOT_ON_NODE",
            Error::NoShardToExplain(_) => "NO_SHARD_TO_EXPLAIN",
            Error::IndexNotFound(_) => "INDEX_NOT_FOUND",
            Error::ShardNotFound { .. } => "SHARD_NOT_FOUND",
            Error::UnknownNode(_) => "UNKNOWN_NODE",
            Error::ClusterBlocked(_) => "CLUSTER_BLOCKED",
            Error::ConnectionFailed(_) => "CONNECTION_FAILED",
            Error::ShuttingDown(_) => "SHUTTING_DOWN",
            Error::Internal(_) => "INTERNAL",
            Error::Other(_) => "OTHER",
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
