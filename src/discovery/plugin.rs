//! Extension points for discovery

use crate::common::DiscoveryConfig;
use crate::coordinator::join::JoinValidator;
use crate::discovery::election::ElectionStrategy;
use crate::discovery::seed::SeedHostsProvider;
use std::sync::Arc;

/// Builds a seed provider from the discovery configuration
pub type SeedProviderFactory =
    Arc<dyn Fn(&DiscoveryConfig) -> Arc<dyn SeedHostsProvider> + Send + Sync>;

/// A bundle of named discovery extensions registered at startup.
/// Names must be unique across all plugins and the built-ins.
pub trait DiscoveryPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn seed_host_providers(&self) -> Vec<(String, SeedProviderFactory)> {
        Vec::new()
    }

    fn join_validator(&self) -> Option<Arc<dyn JoinValidator>> {
        None
    }

    fn election_strategies(&self) -> Vec<(String, Arc<dyn ElectionStrategy>)> {
        Vec::new()
    }
}
