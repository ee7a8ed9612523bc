//! Seed host resolution
//!
//! Providers turn configuration into candidate peer addresses. Host strings
//! are normalised by a [`HostsResolver`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_TRANSPORT_PORT: u16 = 9300;
pub const UNICAST_HOSTS_FILE: &str = "unicast_hosts.txt";

/// Normalises `host[:port]` strings into transport addresses
pub trait HostsResolver: Send + Sync {
    fn resolve_hosts(&self, hosts: &[String]) -> Vec<String>;
}

/// Applies the default port when none is given, skips unparsable entries
#[derive(Debug, Clone)]
pub struct DefaultHostsResolver {
    default_port: u16,
}

impl Default for DefaultHostsResolver {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_TRANSPORT_PORT,
        }
    }
}

impl DefaultHostsResolver {
    pub fn with_default_port(default_port: u16) -> Self {
        Self { default_port }
    }

    fn resolve_one(&self, raw: &str) -> Option<String> {
        let host = raw.trim();
        if host.is_empty() {
            return None;
        }

        // [v6]:port or bare [v6]
        if let Some(rest) = host.strip_prefix('[') {
            let (addr, tail) = rest.split_once(']')?;
            if addr.is_empty() {
                return None;
            }
            return match tail.strip_prefix(':') {
                Some(port) => port
                    .parse::<u16>()
                    .ok()
                    .map(|port| format!("[{}]:{}", addr, port)),
                None if tail.is_empty() => Some(format!("[{}]:{}", addr, self.default_port)),
                None => None,
            };
        }

        match host.split_once(':') {
            Some((name, port)) => {
                if name.is_empty() || port.contains(':') {
                    return None;
                }
                port.parse::<u16>().ok().map(|port| format!("{}:{}", name, port))
            }
            None => Some(format!("{}:{}", host, self.default_port)),
        }
    }
}

impl HostsResolver for DefaultHostsResolver {
    fn resolve_hosts(&self, hosts: &[String]) -> Vec<String> {
        hosts
            .iter()
            .filter_map(|raw| {
                let resolved = self.resolve_one(raw);
                if resolved.is_none() {
                    tracing::warn!(host = %raw, "failed to resolve seed host, skipping");
                }
                resolved
            })
            .collect()
    }
}

/// Source of seed addresses
pub trait SeedHostsProvider: Send + Sync {
    fn seed_addresses(&self, resolver: &dyn HostsResolver) -> Vec<String>;
}

/// Reads `discovery.seed_hosts`
#[derive(Debug, Clone, Default)]
pub struct SettingsBasedSeedHostsProvider {
    hosts: Vec<String>,
}

impl SettingsBasedSeedHostsProvider {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }
}

impl SeedHostsProvider for SettingsBasedSeedHostsProvider {
    fn seed_addresses(&self, resolver: &dyn HostsResolver) -> Vec<String> {
        resolver.resolve_hosts(&self.hosts)
    }
}

/// Reads `unicast_hosts.txt` from the config directory on every call
#[derive(Debug, Clone)]
pub struct FileBasedSeedHostsProvider {
    path: PathBuf,
}

impl FileBasedSeedHostsProvider {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(UNICAST_HOSTS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_hosts(&self) -> Vec<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %self.path.display(),
                    "seed hosts file does not exist, file-based discovery will find no seeds"
                );
                Vec::new()
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "failed to read seed hosts file");
                Vec::new()
            }
        }
    }
}

impl SeedHostsProvider for FileBasedSeedHostsProvider {
    fn seed_addresses(&self, resolver: &dyn HostsResolver) -> Vec<String> {
        let hosts = self.read_hosts();
        let addresses = resolver.resolve_hosts(&hosts);
        tracing::debug!(path = %self.path.display(), count = addresses.len(), "seed addresses from file");
        addresses
    }
}

/// Concatenation of the configured providers, in order, without duplicates
pub struct CombinedSeedHostsProvider {
    providers: Vec<(String, Arc<dyn SeedHostsProvider>)>,
}

impl CombinedSeedHostsProvider {
    pub fn new(providers: Vec<(String, Arc<dyn SeedHostsProvider>)>) -> Self {
        Self { providers }
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl SeedHostsProvider for CombinedSeedHostsProvider {
    fn seed_addresses(&self, resolver: &dyn HostsResolver) -> Vec<String> {
        let mut seen = HashSet::new();
        self.providers
            .iter()
            .flat_map(|(_, provider)| provider.seed_addresses(resolver))
            .filter(|address| seen.insert(address.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_port_applied() {
        let resolver = DefaultHostsResolver::default();
        assert_eq!(
            resolver.resolve_hosts(&hosts(&["10.0.0.1", "10.0.0.2:9301", "[::1]", "[::1]:9400"])),
            hosts(&["10.0.0.1:9300", "10.0.0.2:9301", "[::1]:9300", "[::1]:9400"])
        );
    }

    #[test]
    fn test_invalid_hosts_skipped() {
        let resolver = DefaultHostsResolver::default();
        assert_eq!(
            resolver.resolve_hosts(&hosts(&["", ":9300", "host:notaport", "ok"])),
            hosts(&["ok:9300"])
        );
    }

    #[test]
    fn test_file_provider_ignores_comments() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(UNICAST_HOSTS_FILE),
            "# seeds\n10.0.0.5\n\n  10.0.0.6:9305  \n",
        )
        .unwrap();
        let provider = FileBasedSeedHostsProvider::new(dir.path());
        assert_eq!(
            provider.seed_addresses(&DefaultHostsResolver::default()),
            hosts(&["10.0.0.5:9300", "10.0.0.6:9305"])
        );
    }

    #[test]
    fn test_missing_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileBasedSeedHostsProvider::new(dir.path());
        assert!(provider.seed_addresses(&DefaultHostsResolver::default()).is_empty());
    }

    #[test]
    fn test_combined_dedups_preserving_order() {
        let combined = CombinedSeedHostsProvider::new(vec![
            (
                "settings".to_string(),
                Arc::new(SettingsBasedSeedHostsProvider::new(hosts(&["a", "b"]))) as Arc<dyn SeedHostsProvider>,
            ),
            (
                "other".to_string(),
                Arc::new(SettingsBasedSeedHostsProvider::new(hosts(&["b:9300", "c"]))),
            ),
        ]);
        assert_eq!(
            combined.seed_addresses(&DefaultHostsResolver::default()),
            hosts(&["a:9300", "b:9300", "c:9300"])
        );
        assert_eq!(combined.provider_names(), vec!["settings", "other"]);
    }
}
