//! Discovery: seed hosts, election strategies and their startup assembly

pub mod election;
pub mod module;
pub mod plugin;
pub mod seed;

pub use election::{DefaultElectionStrategy, ElectionStrategy, VoteCollection};
pub use module::{DiscoveryModule, DiscoveryType};
pub use plugin::{DiscoveryPlugin, SeedProviderFactory};
pub use seed::{
    CombinedSeedHostsProvider, DefaultHostsResolver, FileBasedSeedHostsProvider, HostsResolver,
    SeedHostsProvider, SettingsBasedSeedHostsProvider,
};

/// Name of the built-in election strategy
pub const DEFAULT_ELECTION_STRATEGY: &str = "default";
