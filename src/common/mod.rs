//! Common utilities and types shared across shardcoord

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use config::{
    AllocationConfig, ClusterConfig, ClusterRebalanceType, Config, DiscoveryConfig,
    EnableAllocation, NodeConfig,
};
pub use error::{Error, Result};
pub use hash::hrw_weight;
pub use utils::{format_bytes, format_percent, parse_duration};
