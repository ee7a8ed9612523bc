//! Allocation explain: why a shard copy is, or is not, where it is

pub mod explanation;
pub mod request;
pub mod service;

pub use explanation::{ClusterAllocationExplanation, NodeSummary};
pub use request::{ClusterAllocationExplainRequest, ShardSelector};
pub use service::{find_shard_to_explain, ClusterAllocationExplainService};
