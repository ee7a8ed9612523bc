//! Startup assembly of the discovery layer
//!
//! Every name in the configuration is resolved here, once. Anything unknown
//! or registered twice is a fatal configuration error.

use crate::common::{Config, Error, Result};
use crate::coordinator::join::JoinValidator;
use crate::discovery::election::{DefaultElectionStrategy, ElectionStrategy};
use crate::discovery::plugin::{DiscoveryPlugin, SeedProviderFactory};
use crate::discovery::seed::{
    CombinedSeedHostsProvider, FileBasedSeedHostsProvider, SeedHostsProvider,
    SettingsBasedSeedHostsProvider,
};
use crate::discovery::DEFAULT_ELECTION_STRATEGY;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const ZEN_DISCOVERY_TYPE: &str = "zen";
pub const SINGLE_NODE_DISCOVERY_TYPE: &str = "single-node";
pub const LEGACY_ZEN_DISCOVERY_TYPE: &str = "legacy-zen-for-testing-only-do-not-use";

pub const SETTINGS_SEED_PROVIDER: &str = "settings";
pub const FILE_SEED_PROVIDER: &str = "file";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryType {
    Zen,
    SingleNode,
    /// Accepted only in debug builds
    LegacyZen,
}

impl DiscoveryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryType::Zen => ZEN_DISCOVERY_TYPE,
            DiscoveryType::SingleNode => SINGLE_NODE_DISCOVERY_TYPE,
            DiscoveryType::LegacyZen => LEGACY_ZEN_DISCOVERY_TYPE,
        }
    }

    pub fn is_single_node(&self) -> bool {
        matches!(self, DiscoveryType::SingleNode)
    }
}

impl std::str::FromStr for DiscoveryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            ZEN_DISCOVERY_TYPE => Ok(DiscoveryType::Zen),
            SINGLE_NODE_DISCOVERY_TYPE => Ok(DiscoveryType::SingleNode),
            LEGACY_ZEN_DISCOVERY_TYPE if cfg!(debug_assertions) => Ok(DiscoveryType::LegacyZen),
            other => Err(Error::UnknownDiscoveryType(other.to_string())),
        }
    }
}

impl std::fmt::Display for DiscoveryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The resolved discovery layer
pub struct DiscoveryModule {
    discovery_type: DiscoveryType,
    seed_provider_names: Vec<String>,
    seed_hosts_provider: Arc<CombinedSeedHostsProvider>,
    election_strategy_name: String,
    election_strategy: Arc<dyn ElectionStrategy>,
    join_validators: Vec<Arc<dyn JoinValidator>>,
}

impl DiscoveryModule {
    pub fn new(config: &Config, plugins: &[Arc<dyn DiscoveryPlugin>]) -> Result<Self> {
        let discovery = &config.discovery;

        let mut host_providers: BTreeMap<String, SeedProviderFactory> = BTreeMap::new();
        host_providers.insert(
            SETTINGS_SEED_PROVIDER.to_string(),
            Arc::new(|d: &crate::common::DiscoveryConfig| {
                Arc::new(SettingsBasedSeedHostsProvider::new(d.seed_hosts.clone()))
                    as Arc<dyn SeedHostsProvider>
            }),
        );
        host_providers.insert(
            FILE_SEED_PROVIDER.to_string(),
            Arc::new(|d: &crate::common::DiscoveryConfig| {
                Arc::new(FileBasedSeedHostsProvider::new(&d.config_dir)) as Arc<dyn SeedHostsProvider>
            }),
        );

        let mut election_strategies: BTreeMap<String, Arc<dyn ElectionStrategy>> = BTreeMap::new();
        election_strategies.insert(
            DEFAULT_ELECTION_STRATEGY.to_string(),
            Arc::new(DefaultElectionStrategy),
        );

        let mut join_validators = Vec::new();

        for plugin in plugins {
            for (name, factory) in plugin.seed_host_providers() {
                if host_providers.insert(name.clone(), factory).is_some() {
                    return Err(Error::DuplicateRegistration {
                        kind: "seed provider",
                        name,
                    });
                }
            }
            if let Some(validator) = plugin.join_validator() {
                join_validators.push(validator);
            }
            for (name, strategy) in plugin.election_strategies() {
                if election_strategies.insert(name.clone(), strategy).is_some() {
                    return Err(Error::DuplicateRegistration {
                        kind: "election strategy",
                        name,
                    });
                }
            }
            tracing::debug!(plugin = plugin.name(), "registered discovery plugin");
        }

        let seed_provider_names = seed_provider_names(discovery)?;
        let missing: Vec<String> = seed_provider_names
            .iter()
            .filter(|name| !host_providers.contains_key(name.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(Error::UnknownSeedProviders(missing));
        }
        let providers = seed_provider_names
            .iter()
            .filter_map(|name| {
                host_providers
                    .get(name)
                    .map(|factory| (name.clone(), factory(discovery)))
            })
            .collect();

        let discovery_type: DiscoveryType = discovery.discovery_type.parse()?;
        if discovery_type == DiscoveryType::LegacyZen {
            tracing::warn!("legacy zen discovery is for testing only and runs the zen coordinator");
        }

        let election_strategy_name = config.cluster.election_strategy.clone();
        let election_strategy = election_strategies
            .get(&election_strategy_name)
            .cloned()
            .ok_or_else(|| Error::UnknownElectionStrategy(election_strategy_name.clone()))?;

        tracing::info!(
            discovery_type = %discovery_type,
            seed_providers = ?seed_provider_names,
            election_strategy = %election_strategy_name,
            "using discovery type [{}] and seed hosts providers {:?}",
            discovery_type,
            seed_provider_names
        );

        Ok(Self {
            discovery_type,
            seed_provider_names,
            seed_hosts_provider: Arc::new(CombinedSeedHostsProvider::new(providers)),
            election_strategy_name,
            election_strategy,
            join_validators,
        })
    }

    pub fn discovery_type(&self) -> DiscoveryType {
        self.discovery_type
    }

    pub fn seed_provider_names(&self) -> &[String] {
        &self.seed_provider_names
    }

    pub fn seed_hosts_provider(&self) -> Arc<CombinedSeedHostsProvider> {
        self.seed_hosts_provider.clone()
    }

    pub fn election_strategy_name(&self) -> &str {
        &self.election_strategy_name
    }

    pub fn election_strategy(&self) -> Arc<dyn ElectionStrategy> {
        self.election_strategy.clone()
    }

    /// Validators contributed by plugins; the coordinator adds the built-ins
    pub fn join_validators(&self) -> &[Arc<dyn JoinValidator>] {
        &self.join_validators
    }
}

/// Configured provider names with "settings" first and duplicates removed
fn seed_provider_names(discovery: &crate::common::DiscoveryConfig) -> Result<Vec<String>> {
    let configured = match (&discovery.hosts_provider, &discovery.seed_providers) {
        (Some(_), Some(_)) => {
            return Err(Error::InvalidConfig(
                "it is forbidden to set both [discovery.seed_providers] and [discovery.hosts_provider]"
                    .to_string(),
            ))
        }
        (Some(legacy), None) => legacy.clone(),
        (None, Some(providers)) => providers.clone(),
        (None, None) => Vec::new(),
    };

    let mut names = vec![SETTINGS_SEED_PROVIDER.to_string()];
    for name in configured {
        let name = name.trim().to_string();
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::seed::DefaultHostsResolver;

    struct StaticProviders;

    impl DiscoveryPlugin for StaticProviders {
        fn name(&self) -> &str {
            "static"
        }

        fn seed_host_providers(&self) -> Vec<(String, SeedProviderFactory)> {
            vec![(
                "static".to_string(),
                Arc::new(|_: &crate::common::DiscoveryConfig| {
                    Arc::new(SettingsBasedSeedHostsProvider::new(vec!["10.0.0.9".into()]))
                        as Arc<dyn SeedHostsProvider>
                }),
            )]
        }
    }

    struct ShadowsSettings;

    impl DiscoveryPlugin for ShadowsSettings {
        fn name(&self) -> &str {
            "shadow"
        }

        fn seed_host_providers(&self) -> Vec<(String, SeedProviderFactory)> {
            vec![(
                SETTINGS_SEED_PROVIDER.to_string(),
                Arc::new(|_: &crate::common::DiscoveryConfig| {
                    Arc::new(SettingsBasedSeedHostsProvider::default()) as Arc<dyn SeedHostsProvider>
                }),
            )]
        }
    }

    #[test]
    fn test_settings_provider_always_first() {
        let mut config = Config::default();
        config.discovery.seed_hosts = vec!["10.0.0.1".into()];
        config.discovery.seed_providers = Some(vec!["static".into()]);
        let module = DiscoveryModule::new(&config, &[Arc::new(StaticProviders)]).unwrap();

        assert_eq!(module.seed_provider_names(), ["settings", "static"]);
        assert_eq!(
            module
                .seed_hosts_provider()
                .seed_addresses(&DefaultHostsResolver::default()),
            vec!["10.0.0.1:9300".to_string(), "10.0.0.9:9300".to_string()]
        );
    }

    #[test]
    fn test_unknown_provider_is_fatal() {
        let mut config = Config::default();
        config.discovery.seed_providers = Some(vec!["ec2".into()]);
        let err = DiscoveryModule::new(&config, &[]).err().unwrap();
        assert_eq!(err, Error::UnknownSeedProviders(vec!["ec2".into()]));
        assert!(err.is_fatal_config());
    }

    #[test]
    fn test_legacy_and_new_provider_settings_conflict() {
        let mut config = Config::default();
        config.discovery.seed_providers = Some(vec!["file".into()]);
        config.discovery.hosts_provider = Some(vec!["file".into()]);
        assert!(matches!(
            DiscoveryModule::new(&config, &[]),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_duplicate_provider_registration() {
        let err = DiscoveryModule::new(&Config::default(), &[Arc::new(ShadowsSettings)])
            .err()
            .unwrap();
        assert!(matches!(err, Error::DuplicateRegistration { kind: "seed provider", .. }));
    }

    #[test]
    fn test_unknown_strategy_and_type() {
        let mut config = Config::default();
        config.cluster.election_strategy = "raft".into();
        assert_eq!(
            DiscoveryModule::new(&config, &[]).err(),
            Some(Error::UnknownElectionStrategy("raft".into()))
        );

        let mut config = Config::default();
        config.discovery.discovery_type = "gossip".into();
        assert_eq!(
            DiscoveryModule::new(&config, &[]).err(),
            Some(Error::UnknownDiscoveryType("gossip".into()))
        );
    }

    #[test]
    fn test_discovery_types() {
        assert_eq!("zen".parse::<DiscoveryType>().unwrap(), DiscoveryType::Zen);
        assert!("single-node".parse::<DiscoveryType>().unwrap().is_single_node());
        if cfg!(debug_assertions) {
            assert_eq!(
                LEGACY_ZEN_DISCOVERY_TYPE.parse::<DiscoveryType>().unwrap(),
                DiscoveryType::LegacyZen
            );
        }
    }
}
