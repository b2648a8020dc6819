//! Outbound TLS dialing for intercepted hosts
//!
//! Resolution runs over the encrypted upstream and dialing is coordinated
//! per host: one resolve-and-dial critical section at a time, with the
//! first target that completes a verified TLS handshake cached for reuse.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{debug, info, warn};

use crate::error::{Result, SidestepError};
use crate::resolver::{HostLocks, ResolveCache, SecureResolver};

pub struct OutboundConnector {
    resolver: SecureResolver,
    cache: ResolveCache,
    locks: HostLocks,
    connector: TlsConnector,
    timeout: Duration,
}

impl OutboundConnector {
    pub fn new(resolver: SecureResolver, timeout: Duration) -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        // Dials go to IP literals, but verification runs against the SNI
        // hostname passed to connect() below.
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(SidestepError::Tls)?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            resolver,
            cache: ResolveCache::default(),
            locks: HostLocks::default(),
            connector: TlsConnector::from(Arc::new(config)),
            timeout,
        })
    }

    /// Connects to the real server behind `host`.
    ///
    /// A fresh cached address is tried first without coordination. On a
    /// miss, a stale hit, or a dead cached address, the per-host lock is
    /// taken, the cache re-checked, and only then is a resolution issued
    /// and each returned target dialed in order.
    pub async fn connect(&self, host: &str) -> Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| SidestepError::Dns(format!("invalid server name: {}", host)))?;

        if let Some(entry) = self.cache.get(host) {
            if !entry.expired() {
                match self.try_connect(entry.target, server_name.clone()).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => debug!("cached address {} for {} failed: {}", entry.target, host, e),
                }
            }
        }

        let lock = self.locks.acquire(host);
        let _flight = lock.lock().await;

        // Another connection may have refreshed the entry while we waited.
        if let Some(entry) = self.cache.get(host) {
            if !entry.expired() {
                if let Ok(stream) = self.try_connect(entry.target, server_name.clone()).await {
                    return Ok(stream);
                }
            }
        }

        let targets = self.resolver.resolve(host).await;
        if targets.is_empty() {
            warn!("{} resolve error", host);
            return Err(SidestepError::Dns(format!("no address for {}", host)));
        }

        for entry in targets {
            match self.try_connect(entry.target, server_name.clone()).await {
                Ok(stream) => {
                    self.cache.store(host, entry);
                    return Ok(stream);
                }
                Err(e) => warn!("failed to dial {} via {}: {}", host, entry.target, e),
            }
        }

        info!("{} is IP-blocked", host);
        Err(SidestepError::IpBlocked(host.to_string()))
    }

    /// One dial attempt: TCP connect plus TLS handshake under a single
    /// shared deadline.
    async fn try_connect(
        &self,
        addr: SocketAddr,
        server_name: ServerName<'static>,
    ) -> Result<TlsStream<TcpStream>> {
        let dial = async {
            let tcp = TcpStream::connect(addr).await?;
            let tls = self.connector.connect(server_name, tcp).await?;
            Ok::<_, SidestepError>(tls)
        };

        tokio::time::timeout(self.timeout, dial)
            .await
            .map_err(|_| SidestepError::Timeout)?
    }
}
