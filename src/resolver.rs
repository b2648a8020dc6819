//! Real-address resolution over an encrypted upstream
//!
//! Proxied hostnames are resolved through DNS-over-TLS so the answers
//! cannot be poisoned in transit. Successful resolutions are cached per
//! host with a fixed TTL, and a per-host lock serializes the
//! resolve-and-dial path across concurrent connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::ProxyConfig;

/// How long a resolved address stays usable. A system constant, not the
/// upstream record TTL.
const ADDR_TTL: Duration = Duration::from_secs(300);

/// One dial target produced by a resolution.
#[derive(Debug, Clone, Copy)]
pub struct Resolved {
    pub target: SocketAddr,
    pub expires_at: Instant,
}

impl Resolved {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            expires_at: Instant::now() + ADDR_TTL,
        }
    }

    pub fn expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }
}

/// Most recent dialable address per host.
///
/// Lookups hand back stale entries too; callers check `expired` so a
/// stale hit can still be retried before paying for a fresh resolution.
#[derive(Default)]
pub struct ResolveCache {
    entries: RwLock<HashMap<String, Resolved>>,
}

impl ResolveCache {
    pub fn get(&self, host: &str) -> Option<Resolved> {
        self.entries.read().get(host).copied()
    }

    pub fn store(&self, host: &str, entry: Resolved) {
        self.entries.write().insert(host.to_string(), entry);
    }
}

/// Per-host mutual exclusion for the resolve-and-dial critical section.
///
/// Locks are handed out as `Arc`s and the map keeps only weak references,
/// so a host's slot is collected once no connection holds it and the map
/// stays bounded by the hosts currently in flight.
#[derive(Default)]
pub struct HostLocks {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl HostLocks {
    pub fn acquire(&self, host: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.retain(|_, weak| weak.strong_count() > 0);
        if let Some(existing) = locks.get(host).and_then(Weak::upgrade) {
            return existing;
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(host.to_string(), Arc::downgrade(&lock));
        lock
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Resolver bound to the encrypted upstream.
pub struct SecureResolver {
    resolver: TokioAsyncResolver,
}

impl SecureResolver {
    pub fn new(config: &ProxyConfig) -> Self {
        let group = NameServerConfigGroup::from_ips_tls(
            &[config.secure_upstream],
            config.secure_upstream_port,
            config.secure_upstream_name.clone(),
            true,
        );
        let mut opts = ResolverOpts::default();
        opts.use_hosts_file = false;
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::from_parts(None, vec![], group), opts);
        Self { resolver }
    }

    /// Resolves dial targets for `host`, AAAA before A, each pinned to
    /// port 443. Any network failure yields an empty list; an empty
    /// answer section is not a failure.
    pub async fn resolve(&self, host: &str) -> Vec<Resolved> {
        let fqdn = format!("{}.", host.trim_end_matches('.'));
        let mut targets = Vec::new();
        for record_type in [RecordType::AAAA, RecordType::A] {
            match self.resolver.lookup(fqdn.as_str(), record_type).await {
                Ok(lookup) => {
                    for rdata in lookup.iter() {
                        match rdata {
                            RData::AAAA(aaaa) => {
                                targets.push(Resolved::new(SocketAddr::new(aaaa.0.into(), 443)));
                            }
                            RData::A(a) => {
                                targets.push(Resolved::new(SocketAddr::new(a.0.into(), 443)));
                            }
                            _ => {}
                        }
                    }
                }
                Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                    debug!("no {} records for {}", record_type, host);
                }
                Err(e) => {
                    warn!("{} lookup failed for {}: {}", record_type, host, e);
                    return Vec::new();
                }
            }
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn target(ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, 443)
    }

    #[test]
    fn fresh_entry_is_not_expired() {
        let entry = Resolved::new(target(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
        assert!(!entry.expired());
    }

    #[test]
    fn past_expiry_is_stale() {
        let entry = Resolved {
            target: target(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))),
            expires_at: Instant::now() - Duration::from_secs(1),
        };
        assert!(entry.expired());
    }

    /// The cache hands back expired entries; staleness is the caller's
    /// call, so a stale address can still be dialed before re-resolving.
    #[test]
    fn cache_returns_stale_entries() {
        let cache = ResolveCache::default();
        let host = "www.example.com";
        cache.store(
            host,
            Resolved {
                target: target(IpAddr::V6(Ipv6Addr::LOCALHOST)),
                expires_at: Instant::now() - Duration::from_secs(1),
            },
        );
        let hit = cache.get(host).unwrap();
        assert!(hit.expired());
        assert_eq!(hit.target, target(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn cache_replaces_on_store() {
        let cache = ResolveCache::default();
        let first = target(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
        let second = target(IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)));
        cache.store("h", Resolved::new(first));
        cache.store("h", Resolved::new(second));
        assert_eq!(cache.get("h").unwrap().target, second);
    }

    /// Two tasks resolving the same host must share one lock; a second
    /// host gets its own.
    #[tokio::test]
    async fn one_lock_per_host() {
        let locks = HostLocks::default();
        let a1 = locks.acquire("a.example.com");
        let a2 = locks.acquire("a.example.com");
        assert!(Arc::ptr_eq(&a1, &a2));

        let guard = a1.lock().await;
        assert!(a2.try_lock().is_err());
        drop(guard);
        assert!(a2.try_lock().is_ok());

        let b = locks.acquire("b.example.com");
        assert!(!Arc::ptr_eq(&a1, &b));
    }

    /// Released locks are collected on the next acquire, so the map does
    /// not grow with every host ever seen.
    #[test]
    fn released_locks_are_collected() {
        let locks = HostLocks::default();
        let a = locks.acquire("a.example.com");
        assert_eq!(locks.len(), 1);
        drop(a);
        let _b = locks.acquire("b.example.com");
        assert_eq!(locks.len(), 1);
    }
}
