// Seed host resolution
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Turns host strings into socket addresses
#[async_trait]
pub trait HostsResolver: Send + Sync {
    /// Resolve every host, giving up on whatever is unresolved once
    /// `timeout` has elapsed. Hosts that fail are logged and skipped.
    async fn resolve(&self, hosts: &[String], timeout: Duration) -> Vec<SocketAddr>;
}

/// A resolver bound to the timeout discovery was configured with
pub struct SeedResolution<'a> {
    resolver: &'a dyn HostsResolver,
    timeout: Duration,
}

impl<'a> SeedResolution<'a> {
    pub fn new(resolver: &'a dyn HostsResolver, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }

    pub async fn resolve(&self, hosts: &[String]) -> Vec<SocketAddr> {
        self.resolver.resolve(hosts, self.timeout).await
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Where seed addresses come from
#[async_trait]
pub trait SeedHostsProvider: Send + Sync {
    async fn seed_addresses(&self, resolution: &SeedResolution<'_>) -> Vec<SocketAddr>;
}

/// Seed hosts listed in the configuration
#[derive(Debug, Clone)]
pub struct SettingsSeedHostsProvider {
    hosts: Vec<String>,
}

impl SettingsSeedHostsProvider {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }
}

#[async_trait]
impl SeedHostsProvider for SettingsSeedHostsProvider {
    async fn seed_addresses(&self, resolution: &SeedResolution<'_>) -> Vec<SocketAddr> {
        resolution.resolve(&self.hosts).await
    }
}

/// Seed addresses that are already resolved
#[derive(Debug, Clone, Default)]
pub struct FixedSeedAddresses {
    addresses: Vec<SocketAddr>,
}

impl FixedSeedAddresses {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self { addresses }
    }
}

#[async_trait]
impl SeedHostsProvider for FixedSeedAddresses {
    async fn seed_addresses(&self, _resolution: &SeedResolution<'_>) -> Vec<SocketAddr> {
        self.addresses.clone()
    }
}

/// Resolver using the system's name lookup, a bounded number at a time
#[derive(Debug, Clone)]
pub struct DnsHostsResolver {
    max_concurrent_resolvers: usize,
    default_port: u16,
}

impl DnsHostsResolver {
    pub fn new(max_concurrent_resolvers: usize, default_port: u16) -> Self {
        Self {
            max_concurrent_resolvers: max_concurrent_resolvers.max(1),
            default_port,
        }
    }
}

#[async_trait]
impl HostsResolver for DnsHostsResolver {
    async fn resolve(&self, hosts: &[String], timeout: Duration) -> Vec<SocketAddr> {
        let deadline = Instant::now() + timeout;
        let default_port = self.default_port;
        let lookups = stream::iter(hosts.iter().cloned())
            .map(|host| async move {
                let target = with_default_port(&host, default_port);
                let result = tokio::time::timeout_at(deadline, tokio::net::lookup_host(target)).await;
                (host, result)
            })
            .buffered(self.max_concurrent_resolvers)
            .collect::<Vec<_>>()
            .await;

        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for (host, result) in lookups {
            match result {
                Ok(Ok(addresses)) => {
                    for address in addresses {
                        if seen.insert(address) {
                            debug!(host = %host, address = %address, "resolved seed host");
                            resolved.push(address);
                        }
                    }
                }
                Ok(Err(e)) => warn!(host = %host, error = %e, "failed to resolve host"),
                Err(_) => warn!(host = %host, timeout = ?timeout, "timed out resolving host"),
            }
        }
        resolved
    }
}

/// Append `default_port` to a host string that does not carry one
pub fn with_default_port(host: &str, default_port: u16) -> String {
    let host = host.trim();
    if host.parse::<SocketAddr>().is_ok() {
        return host.to_string();
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return SocketAddr::new(ip, default_port).to_string();
    }
    if host.starts_with('[') && host.ends_with(']') {
        return format!("{}:{}", host, default_port);
    }
    if let Some((name, port)) = host.rsplit_once(':') {
        if !name.is_empty() && !name.contains(':') && port.parse::<u16>().is_ok() {
            return host.to_string();
        }
    }
    format!("{}:{}", host, default_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_default_port() {
        assert_eq!(with_default_port("10.0.0.1", 9300), "10.0.0.1:9300");
        assert_eq!(with_default_port("10.0.0.1:9301", 9300), "10.0.0.1:9301");
        assert_eq!(with_default_port("::1", 9300), "[::1]:9300");
        assert_eq!(with_default_port("[::1]", 9300), "[::1]:9300");
        assert_eq!(with_default_port("[::1]:9400", 9300), "[::1]:9400");
        assert_eq!(with_default_port("seed-1.internal", 9300), "seed-1.internal:9300");
        assert_eq!(with_default_port(" seed-1.internal:9500 ", 9300), "seed-1.internal:9500");
    }

    #[tokio::test]
    async fn test_resolves_literals_and_skips_failures() {
        let resolver = DnsHostsResolver::new(2, 9300);
        let hosts = vec![
            "127.0.0.1".to_string(),
            "127.0.0.1:9301".to_string(),
            "127.0.0.1:9300".to_string(),
            "no-such-host.invalid".to_string(),
        ];
        let resolved = resolver.resolve(&hosts, Duration::from_secs(2)).await;
        assert_eq!(
            resolved,
            vec![
                SocketAddr::from(([127, 0, 0, 1], 9300)),
                SocketAddr::from(([127, 0, 0, 1], 9301)),
            ]
        );
    }

    #[tokio::test]
    async fn test_settings_provider_uses_bound_timeout() {
        let resolver = DnsHostsResolver::new(1, 9300);
        let resolution = SeedResolution::new(&resolver, Duration::from_secs(1));
        let provider = SettingsSeedHostsProvider::new(vec!["192.168.0.10".to_string()]);
        let seeds = provider.seed_addresses(&resolution).await;
        assert_eq!(seeds, vec![SocketAddr::from(([192, 168, 0, 10], 9300))]);
        assert_eq!(resolution.timeout(), Duration::from_secs(1));
    }
}
