//! Sidestep - selective TLS intercept proxy
//!
//! This library runs loopback DNS, HTTP, and TLS listeners that together
//! route a configured set of domains around network-level interference.
//! The DNS responder answers proxied names with loopback addresses, the
//! TLS listener terminates the client handshake with a certificate minted
//! from a local CA, resolves the real destination over an encrypted
//! upstream, and splices bytes to the real server.

pub mod cert;
pub mod dns;
pub mod error;
pub mod http;
pub mod intercept;
pub mod outbound;
pub mod policy;
pub mod resolver;

pub use error::SidestepError;
pub use intercept::InterceptServer;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// DNS responder bind address (default: 127.0.0.1:53)
    pub dns_addr: SocketAddr,
    /// Plaintext HTTP refusal bind address (default: 127.0.0.1:80)
    pub http_addr: SocketAddr,
    /// TLS intercept bind address (default: 127.0.0.1:443)
    pub tls_addr: SocketAddr,
    /// Cleartext upstream resolver for forwarded queries
    pub clear_upstream: SocketAddr,
    /// Encrypted (DNS-over-TLS) upstream for proxied-domain resolution.
    /// Distinct from the cleartext upstream: the whole point is that this
    /// one cannot be poisoned in transit.
    pub secure_upstream: IpAddr,
    /// Port of the encrypted upstream (default: 853)
    pub secure_upstream_port: u16,
    /// TLS certificate name presented by the encrypted upstream
    pub secure_upstream_name: String,
    /// CA certificate, PEM
    pub ca_cert_path: PathBuf,
    /// CA private key, PEM
    pub ca_key_path: PathBuf,
    /// Proxied-domain list, one domain per line
    pub policy_path: PathBuf,
    /// Outbound dial timeout in seconds
    pub dial_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            dns_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 53)),
            http_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 80)),
            tls_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 443)),
            clear_upstream: SocketAddr::from((Ipv4Addr::new(114, 114, 114, 114), 53)),
            secure_upstream: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            secure_upstream_port: 853,
            secure_upstream_name: "dns.google".to_string(),
            ca_cert_path: PathBuf::from("CERT_PUBC.crt"),
            ca_key_path: PathBuf::from("CERT_PRIC.key"),
            policy_path: PathBuf::from("CONF_DOMS.ini"),
            dial_timeout_secs: 5,
        }
    }
}
