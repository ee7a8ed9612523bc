//! Cluster coordination
//!
//! The coordinator is responsible for:
//! - Peer discovery and leader elections (pre-vote, then joins for a term)
//! - Two-phase cluster state publication with double-majority quorums
//! - Voting configuration upkeep as nodes join and leave
//! - Follower checks on the leader and leader timeouts on followers

pub mod coordination_state;
pub mod core;
pub mod join;
pub mod messages;
pub mod persisted;
pub mod reconfigurator;
pub mod transport;

pub use self::core::{Coordinator, Mode};
pub use coordination_state::CoordinationState;
pub use join::{builtin_join_validators, validate_join, JoinBackoff, JoinValidator};
pub use persisted::{InMemoryPersistedState, PersistedState};
pub use reconfigurator::reconfigure;
pub use transport::{LocalChannel, LocalTransport, Transport, TransportHandler};
