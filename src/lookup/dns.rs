use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::sanitize_display;
use crate::config::IpFamily;
use crate::error::{MtrError, MtrResult};

/// Turns the configured target into one address of the requested family
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, host: &str, family: IpFamily) -> MtrResult<IpAddr>;
}

/// Reverse lookup of responder addresses.
///
/// A failed or slow lookup is just "no hostname".
#[async_trait]
pub trait HostnameResolver: Send + Sync {
    async fn reverse(&self, addr: IpAddr, budget: Duration) -> Option<String>;
}

/// Interpret `host` as an IP literal (brackets allowed for IPv6).
///
/// Returns `None` when `host` is not a literal at all, so the caller goes on
/// to query DNS.
pub fn parse_literal(host: &str, family: IpFamily) -> Option<MtrResult<IpAddr>> {
    let trimmed = host.trim().trim_start_matches('[').trim_end_matches(']');
    let addr: IpAddr = trimmed.parse().ok()?;
    if family.matches(&addr) {
        Some(Ok(addr))
    } else {
        Some(Err(MtrError::NoAddressForFamily {
            host: host.to_string(),
            family,
        }))
    }
}

/// DNS cache entry
struct CacheEntry {
    hostname: Option<String>,
    cached_at: Instant,
}

/// Forward and reverse DNS through hickory, with a reverse cache
pub struct DnsLookup {
    resolver: TokioAsyncResolver,
    cache: RwLock<HashMap<IpAddr, CacheEntry>>,
    cache_ttl: Duration,
}

impl Default for DnsLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsLookup {
    pub fn new() -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

        Self {
            resolver,
            cache: RwLock::new(HashMap::new()),
            cache_ttl: Duration::from_secs(3600), // 1 hour
        }
    }

    fn cached(&self, ip: IpAddr) -> Option<Option<String>> {
        let cache = self.cache.read();
        let entry = cache.get(&ip)?;
        (entry.cached_at.elapsed() < self.cache_ttl).then(|| entry.hostname.clone())
    }

    /// Reverse lookup without a time budget, using the cache
    pub async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        if let Some(hostname) = self.cached(ip) {
            return hostname;
        }

        let hostname = match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => lookup.iter().next().map(|name| {
                let s = name.to_string();
                sanitize_display(s.trim_end_matches('.'))
            }),
            Err(e) => {
                trace!(%ip, error = %e, "reverse lookup failed");
                None
            }
        };

        self.cache.write().insert(
            ip,
            CacheEntry {
                hostname: hostname.clone(),
                cached_at: Instant::now(),
            },
        );

        hostname
    }
}

#[async_trait]
impl TargetResolver for DnsLookup {
    async fn resolve(&self, host: &str, family: IpFamily) -> MtrResult<IpAddr> {
        if let Some(literal) = parse_literal(host, family) {
            return literal;
        }

        let lookup = self
            .resolver
            .lookup_ip(host.trim())
            .await
            .map_err(|e| MtrError::Resolve {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let addr = lookup
            .iter()
            .find(|ip| family.matches(ip))
            .ok_or_else(|| MtrError::NoAddressForFamily {
                host: host.to_string(),
                family,
            })?;
        debug!(host, %addr, "resolved target");
        Ok(addr)
    }
}

#[async_trait]
impl HostnameResolver for DnsLookup {
    async fn reverse(&self, addr: IpAddr, budget: Duration) -> Option<String> {
        match tokio::time::timeout(budget, self.reverse_lookup(addr)).await {
            Ok(hostname) => hostname,
            Err(_) => {
                trace!(%addr, ?budget, "reverse lookup over budget");
                None
            }
        }
    }
}
