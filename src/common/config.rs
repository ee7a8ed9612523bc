//! Configuration for shardcoord nodes
//!
//! Loaded from a TOML file with `SHARDCOORD__SECTION__KEY` environment
//! overrides. Every section has defaults so a minimal file only needs
//! `[node] name = "..."`.

use crate::cluster::NodeRole;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local node identity
    pub node: NodeConfig,

    /// Discovery and seed resolution
    pub discovery: DiscoveryConfig,

    /// Coordination timings and election strategy
    pub cluster: ClusterConfig,

    /// Allocation deciders and balancer
    pub allocation: AllocationConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            discovery: DiscoveryConfig::default(),
            cluster: ClusterConfig::default(),
            allocation: AllocationConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Persistent node id; generated when absent
    pub id: Option<String>,

    /// Human-readable node name
    pub name: String,

    /// Transport address other nodes reach this node on
    pub address: String,

    /// Node roles
    pub roles: Vec<NodeRole>,

    /// Arbitrary attributes used by filter and awareness deciders
    pub attributes: BTreeMap<String, String>,

    /// Node version, defaults to the crate version
    pub version: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: "node-1".to_string(),
            address: "127.0.0.1:9300".to_string(),
            roles: vec![NodeRole::Master, NodeRole::Data],
            attributes: BTreeMap::new(),
            version: crate::VERSION.to_string(),
        }
    }
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// `zen`, `single-node` or the legacy testing type
    #[serde(rename = "type")]
    pub discovery_type: String,

    /// Seed providers by name; `settings` is always prepended
    pub seed_providers: Option<Vec<String>>,

    /// Deprecated alias of `seed_providers`; setting both is an error
    pub hosts_provider: Option<Vec<String>>,

    /// Static seed hosts consumed by the `settings` provider
    pub seed_hosts: Vec<String>,

    /// Directory holding `unicast_hosts.txt` for the `file` provider
    pub config_dir: PathBuf,

    /// Node ids or names forming the first voting configuration
    pub initial_voting_nodes: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_type: "zen".to_string(),
            seed_providers: None,
            hosts_provider: None,
            seed_hosts: Vec::new(),
            config_dir: PathBuf::from("./config"),
            initial_voting_nodes: Vec::new(),
        }
    }
}

/// Coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name, nodes only join clusters with the same name
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Election strategy by registered name
    #[serde(default = "default_election_strategy")]
    pub election_strategy: String,

    /// Lower bound of the randomized election delay
    #[serde(default = "default_election_initial_timeout")]
    pub election_initial_timeout_ms: u64,

    /// Added to the election delay on every failed attempt
    #[serde(default = "default_election_back_off")]
    pub election_back_off_ms: u64,

    /// Upper bound of the election delay
    #[serde(default = "default_election_max_timeout")]
    pub election_max_timeout_ms: u64,

    /// Followers become candidates after this long without leader contact
    #[serde(default = "default_leader_timeout")]
    pub leader_timeout_ms: u64,

    /// Interval between follower checks sent by the leader
    #[serde(default = "default_follower_check_interval")]
    pub follower_check_interval_ms: u64,

    /// Per-request follower check timeout
    #[serde(default = "default_follower_check_timeout")]
    pub follower_check_timeout_ms: u64,

    /// Consecutive failed checks before a follower is removed
    #[serde(default = "default_retry_count")]
    pub follower_check_retry_count: u32,

    /// Consecutive rounds without a quorum of acks before the leader steps down
    #[serde(default = "default_retry_count")]
    pub leader_check_retry_count: u32,

    /// Bound on waiting for a publish quorum
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,

    /// Initial back-off after a rejected join, doubled per rejection
    #[serde(default = "default_join_retry_delay")]
    pub join_retry_delay_ms: u64,

    /// Cap on the join back-off
    #[serde(default = "default_join_retry_max_delay")]
    pub join_retry_max_delay_ms: u64,

    /// Attempts of one reroute round when commits find the state moved on
    #[serde(default = "default_reroute_attempts")]
    pub reroute_max_attempts: u32,
}

fn default_cluster_name() -> String {
    "shardcoord".to_string()
}
fn default_election_strategy() -> String {
    crate::discovery::DEFAULT_ELECTION_STRATEGY.to_string()
}
fn default_election_initial_timeout() -> u64 {
    100
}
fn default_election_back_off() -> u64 {
    100
}
fn default_election_max_timeout() -> u64 {
    10_000
}
fn default_leader_timeout() -> u64 {
    3_000
}
fn default_follower_check_interval() -> u64 {
    1_000
}
fn default_follower_check_timeout() -> u64 {
    1_000
}
fn default_retry_count() -> u32 {
    3
}
fn default_publish_timeout() -> u64 {
    30_000
}
fn default_join_retry_delay() -> u64 {
    100
}
fn default_join_retry_max_delay() -> u64 {
    10_000
}
fn default_reroute_attempts() -> u32 {
    3
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            election_strategy: default_election_strategy(),
            election_initial_timeout_ms: default_election_initial_timeout(),
            election_back_off_ms: default_election_back_off(),
            election_max_timeout_ms: default_election_max_timeout(),
            leader_timeout_ms: default_leader_timeout(),
            follower_check_interval_ms: default_follower_check_interval(),
            follower_check_timeout_ms: default_follower_check_timeout(),
            follower_check_retry_count: default_retry_count(),
            leader_check_retry_count: default_retry_count(),
            publish_timeout_ms: default_publish_timeout(),
            join_retry_delay_ms: default_join_retry_delay(),
            join_retry_max_delay_ms: default_join_retry_max_delay(),
            reroute_max_attempts: default_reroute_attempts(),
        }
    }
}

impl ClusterConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn leader_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_timeout_ms)
    }

    pub fn follower_check_interval(&self) -> Duration {
        Duration::from_millis(self.follower_check_interval_ms)
    }

    pub fn follower_check_timeout(&self) -> Duration {
        Duration::from_millis(self.follower_check_timeout_ms)
    }
}

/// Which shards may be allocated at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnableAllocation {
    All,
    Primaries,
    NewPrimaries,
    None,
}

/// When rebalancing is allowed to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterRebalanceType {
    Always,
    IndicesPrimariesActive,
    IndicesAllActive,
}

impl std::str::FromStr for EnableAllocation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(EnableAllocation::All),
            "primaries" => Ok(EnableAllocation::Primaries),
            "new_primaries" => Ok(EnableAllocation::NewPrimaries),
            "none" => Ok(EnableAllocation::None),
            other => Err(Error::InvalidConfig(format!("unknown allocation enable value [{}]", other))),
        }
    }
}

impl std::str::FromStr for ClusterRebalanceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(ClusterRebalanceType::Always),
            "indices_primaries_active" => Ok(ClusterRebalanceType::IndicesPrimariesActive),
            "indices_all_active" => Ok(ClusterRebalanceType::IndicesAllActive),
            other => Err(Error::InvalidConfig(format!("unknown allow_rebalance value [{}]", other))),
        }
    }
}

pub const CLUSTER_ROUTING_ALLOCATION_PREFIX: &str = "cluster.routing.allocation.";

/// Allocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Weight of per-index shard count balance
    pub index_balance: f32,

    /// Weight of total shard count balance
    pub shard_balance: f32,

    /// Weight of disk usage balance (fraction of disk used)
    pub disk_balance: f32,

    /// Minimum weight delta that triggers a rebalancing move
    pub balance_threshold: f32,

    pub enable: EnableAllocation,
    pub allow_rebalance: ClusterRebalanceType,

    pub node_concurrent_incoming_recoveries: usize,
    pub node_initial_primaries_recoveries: usize,
    pub cluster_concurrent_rebalance: usize,

    pub disk_threshold_enabled: bool,
    /// Used-disk fraction above which no new replicas are allocated
    pub watermark_low: f64,
    /// Used-disk fraction above which shards move away
    pub watermark_high: f64,

    /// Attributes copies of one shard should spread across
    pub awareness_attributes: Vec<String>,

    /// Failed allocations before a shard stops being retried
    pub max_retries: u32,

    /// Cluster-wide cap on shards per node, across all indices
    pub total_shards_per_node: Option<u32>,

    /// Cluster-wide filters keyed by `_id`, `_name` or attribute name
    pub require: BTreeMap<String, String>,
    pub include: BTreeMap<String, String>,
    pub exclude: BTreeMap<String, String>,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            index_balance: 0.55,
            shard_balance: 0.45,
            disk_balance: 0.1,
            balance_threshold: 1.0,
            enable: EnableAllocation::All,
            allow_rebalance: ClusterRebalanceType::IndicesAllActive,
            node_concurrent_incoming_recoveries: 2,
            node_initial_primaries_recoveries: 4,
            cluster_concurrent_rebalance: 2,
            disk_threshold_enabled: true,
            watermark_low: 0.85,
            watermark_high: 0.90,
            awareness_attributes: Vec::new(),
            max_retries: 5,
            total_shards_per_node: None,
            require: BTreeMap::new(),
            include: BTreeMap::new(),
            exclude: BTreeMap::new(),
        }
    }
}

impl AllocationConfig {
    /// Applies dynamic `cluster.routing.allocation.*` settings on top of this
    /// configuration. Unparsable values are ignored with a warning.
    pub fn with_overrides(&self, settings: &BTreeMap<String, String>) -> AllocationConfig {
        let mut resolved = self.clone();
        for (key, value) in settings {
            let Some(name) = key.strip_prefix(CLUSTER_ROUTING_ALLOCATION_PREFIX) else {
                continue;
            };
            if let Some(attr) = name.strip_prefix("require.") {
                resolved.require.insert(attr.to_string(), value.clone());
                continue;
            }
            if let Some(attr) = name.strip_prefix("include.") {
                resolved.include.insert(attr.to_string(), value.clone());
                continue;
            }
            if let Some(attr) = name.strip_prefix("exclude.") {
                resolved.exclude.insert(attr.to_string(), value.clone());
                continue;
            }
            let applied = match name {
                "enable" => value.parse().map(|v| resolved.enable = v).is_ok(),
                "allow_rebalance" => value.parse().map(|v| resolved.allow_rebalance = v).is_ok(),
                "balance.index" => value.parse().map(|v| resolved.index_balance = v).is_ok(),
                "balance.shard" => value.parse().map(|v| resolved.shard_balance = v).is_ok(),
                "balance.disk" => value.parse().map(|v| resolved.disk_balance = v).is_ok(),
                "balance.threshold" => value.parse().map(|v| resolved.balance_threshold = v).is_ok(),
                "node_concurrent_incoming_recoveries" => value
                    .parse()
                    .map(|v| resolved.node_concurrent_incoming_recoveries = v)
                    .is_ok(),
                "node_initial_primaries_recoveries" => value
                    .parse()
                    .map(|v| resolved.node_initial_primaries_recoveries = v)
                    .is_ok(),
                "cluster_concurrent_rebalance" => value
                    .parse()
                    .map(|v| resolved.cluster_concurrent_rebalance = v)
                    .is_ok(),
                "disk.threshold_enabled" => value
                    .parse()
                    .map(|v| resolved.disk_threshold_enabled = v)
                    .is_ok(),
                "disk.watermark.low" => value.parse().map(|v| resolved.watermark_low = v).is_ok(),
                "disk.watermark.high" => value.parse().map(|v| resolved.watermark_high = v).is_ok(),
                "awareness.attributes" => {
                    resolved.awareness_attributes = value
                        .split(',')
                        .map(str::trim)
                        .filter(|a| !a.is_empty())
                        .map(String::from)
                        .collect();
                    true
                }
                "total_shards_per_node" => value
                    .parse()
                    .map(|v| resolved.total_shards_per_node = Some(v))
                    .is_ok(),
                _ => {
                    tracing::warn!(setting = %key, "ignoring unknown allocation setting");
                    true
                }
            };
            if !applied {
                tracing::warn!(setting = %key, value = %value, "ignoring unparsable allocation setting");
            }
        }
        resolved
    }
}

impl Config {
    /// Load from a TOML file (if given) and `SHARDCOORD__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("SHARDCOORD")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("discovery.seed_hosts")
                    .with_list_parse_key("discovery.seed_providers")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from an in-memory TOML document
    pub fn from_toml(toml: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation; name lookups happen in the discovery module
    pub fn validate(&self) -> Result<()> {
        if self.node.name.trim().is_empty() {
            return Err(Error::InvalidConfig("node.name cannot be empty".into()));
        }
        if self.node.roles.is_empty() {
            return Err(Error::InvalidConfig("node.roles cannot be empty".into()));
        }
        semver::Version::parse(&self.node.version).map_err(|e| {
            Error::InvalidConfig(format!("node.version [{}]: {}", self.node.version, e))
        })?;

        let c = &self.cluster;
        if c.follower_check_retry_count == 0 || c.leader_check_retry_count == 0 {
            return Err(Error::InvalidConfig("check retry counts must be > 0".into()));
        }
        if c.publish_timeout_ms == 0 || c.leader_timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeouts must be > 0".into()));
        }
        if c.election_initial_timeout_ms > c.election_max_timeout_ms {
            return Err(Error::InvalidConfig(format!(
                "election_initial_timeout_ms [{}] exceeds election_max_timeout_ms [{}]",
                c.election_initial_timeout_ms, c.election_max_timeout_ms
            )));
        }

        let a = &self.allocation;
        if a.index_balance < 0.0 || a.shard_balance < 0.0 || a.disk_balance < 0.0 {
            return Err(Error::InvalidConfig("balance factors must be >= 0".into()));
        }
        if a.index_balance + a.shard_balance <= 0.0 {
            return Err(Error::InvalidConfig(
                "index_balance and shard_balance must not both be 0".into(),
            ));
        }
        if a.balance_threshold <= 0.0 {
            return Err(Error::InvalidConfig("balance_threshold must be > 0".into()));
        }
        let valid_fraction = |v: f64| v > 0.0 && v <= 1.0;
        if !valid_fraction(a.watermark_low) || !valid_fraction(a.watermark_high) {
            return Err(Error::InvalidConfig("watermarks must be in (0, 1]".into()));
        }
        if a.watermark_low > a.watermark_high {
            return Err(Error::InvalidConfig(format!(
                "low watermark [{}] exceeds high watermark [{}]",
                a.watermark_low, a.watermark_high
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_allocation_overrides() {
        let mut settings = BTreeMap::new();
        settings.insert("cluster.routing.allocation.enable".to_string(), "none".to_string());
        settings.insert("cluster.routing.allocation.exclude._name".to_string(), "n3".to_string());
        settings.insert(
            "cluster.routing.allocation.awareness.attributes".to_string(),
            "zone, rack".to_string(),
        );
        settings.insert(
            "cluster.routing.allocation.cluster_concurrent_rebalance".to_string(),
            "lots".to_string(),
        );
        settings.insert("unrelated.setting".to_string(), "x".to_string());

        let resolved = AllocationConfig::default().with_overrides(&settings);
        assert_eq!(resolved.enable, EnableAllocation::None);
        assert_eq!(resolved.exclude.get("_name").unwrap(), "n3");
        assert_eq!(resolved.awareness_attributes, vec!["zone", "rack"]);
        // unparsable values keep the configured default
        assert_eq!(resolved.cluster_concurrent_rebalance, 2);
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.discovery.discovery_type, "zen");
        assert_eq!(config.cluster.election_strategy, "default");
        assert_eq!(config.allocation.enable, EnableAllocation::All);
    }

    #[test]
    fn test_from_toml_overrides() {
        let config = Config::from_toml(
            r#"
            [node]
            name = "data-7"
            roles = ["data"]
            attributes = { zone = "a" }

            [discovery]
            type = "single-node"
            seed_hosts = ["10.0.0.1", "10.0.0.2:9301"]

            [allocation]
            enable = "primaries"
            watermark_low = 0.7
            "#,
        )
        .unwrap();

        assert_eq!(config.node.name, "data-7");
        assert_eq!(config.node.roles, vec![NodeRole::Data]);
        assert_eq!(config.node.attributes.get("zone").unwrap(), "a");
        assert_eq!(config.discovery.discovery_type, "single-node");
        assert_eq!(config.discovery.seed_hosts.len(), 2);
        assert_eq!(config.allocation.enable, EnableAllocation::Primaries);
        assert_eq!(config.cluster.publish_timeout_ms, 30_000);
    }

    #[test]
    fn test_unknown_enum_value_is_config_error() {
        let err = Config::from_toml("[allocation]\nenable = \"sometimes\"\n").unwrap_err();
        assert!(err.is_fatal_config());
    }

    #[test]
    fn test_invalid_watermarks() {
        let err = Config::from_toml(
            "[allocation]\nwatermark_low = 0.95\nwatermark_high = 0.9\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[node]\nname = \"from-file\"\n[cluster]\nname = \"prod\"").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.node.name, "from-file");
        assert_eq!(config.cluster.name, "prod");
    }
}
