//! Certificate minting for the intercept listener
//!
//! This module handles:
//! - Loading the on-disk CA certificate and key at startup
//! - Synthesizing wildcard leaf certificates per registrable domain,
//!   driven by the SNI of each inbound handshake

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, SanType, SerialNumber,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info};

use crate::error::{Result, SidestepError};
use crate::ProxyConfig;

/// Leaf validity window.
const LEAF_VALIDITY: Duration = Duration::days(30);

/// Certificate manager for the intercept listener
pub struct CertManager {
    /// CA key pair for signing
    ca_key: KeyPair,
    /// CA certificate for signing
    ca_cert: Certificate,
    /// CA cert in DER form, served as the second element of each chain
    ca_cert_der: CertificateDer<'static>,
    /// Minted leaves, keyed by registrable domain
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    /// Crypto provider for rustls
    provider: Arc<CryptoProvider>,
}

impl CertManager {
    /// Loads the CA pair from the configured paths. Missing or unparsable
    /// material is a startup failure.
    pub fn load(config: &ProxyConfig) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(&config.ca_cert_path).map_err(|e| {
            SidestepError::Certificate(format!(
                "cannot read {}: {}",
                config.ca_cert_path.display(),
                e
            ))
        })?;
        let key_pem = std::fs::read_to_string(&config.ca_key_path).map_err(|e| {
            SidestepError::Certificate(format!(
                "cannot read {}: {}",
                config.ca_key_path.display(),
                e
            ))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| SidestepError::Certificate(format!("failed to parse CA key: {}", e)))?;

        // Load the CA certificate, never regenerate it: the chain we
        // serve must end in the exact certificate the client trust store
        // already carries.
        let ca_cert = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| SidestepError::Certificate(format!("failed to parse CA cert: {}", e)))?
            .self_signed(&ca_key)
            .map_err(|e| SidestepError::Certificate(format!("failed to load CA cert: {}", e)))?;

        let parsed = pem::parse(cert_pem)
            .map_err(|e| SidestepError::Certificate(format!("failed to parse CA PEM: {}", e)))?;
        let ca_cert_der = CertificateDer::from(parsed.contents().to_vec());

        info!("CA certificate loaded");

        Ok(Self {
            ca_key,
            ca_cert,
            ca_cert_der,
            cache: RwLock::new(HashMap::new()),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }

    /// Builds the inbound TLS config whose only certificate source is the
    /// per-SNI mint.
    pub fn server_config(self: &Arc<Self>) -> Result<Arc<ServerConfig>> {
        let config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(SidestepError::Tls)?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(MintingResolver {
                manager: Arc::clone(self),
            }));
        Ok(Arc::new(config))
    }

    /// Returns the cached or freshly minted leaf for an SNI.
    ///
    /// Leaves are keyed by the registrable domain of the SNI and carry a
    /// wildcard SAN, so every sibling subdomain shares one certificate.
    pub fn certified_key_for(&self, server_name: &str) -> Result<Arc<CertifiedKey>> {
        if server_name.is_empty() {
            return Err(SidestepError::NoSni);
        }

        if let Some(key) = self.cache.read().get(server_name) {
            return Ok(Arc::clone(key));
        }

        let cn = match psl::domain_str(server_name) {
            Some(cn) => cn.to_string(),
            None => {
                return Err(SidestepError::Certificate(format!(
                    "invalid hostname: {}",
                    server_name
                )))
            }
        };

        if let Some(key) = self.cache.read().get(cn.as_str()) {
            return Ok(Arc::clone(key));
        }

        debug!("minting certificate for {} (cn {})", server_name, cn);
        let key = Arc::new(self.mint(&cn)?);
        self.cache.write().insert(cn, Arc::clone(&key));
        Ok(key)
    }

    fn mint(&self, cn: &str) -> Result<CertifiedKey> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        dn.push(DnType::CountryName, "CN");
        params.distinguished_name = dn;

        params.subject_alt_names = vec![
            SanType::DnsName(
                cn.try_into()
                    .map_err(|e| SidestepError::Certificate(format!("invalid SAN: {}", e)))?,
            ),
            SanType::DnsName(
                format!("*.{}", cn)
                    .try_into()
                    .map_err(|e| SidestepError::Certificate(format!("invalid SAN: {}", e)))?,
            ),
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::ExplicitNoCa;
        params.serial_number = Some(SerialNumber::from_slice(&rand::random::<[u8; 16]>()));

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + LEAF_VALIDITY;

        let leaf_key = KeyPair::generate()
            .map_err(|e| SidestepError::Certificate(format!("failed to generate key: {}", e)))?;

        let cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| SidestepError::Certificate(format!("failed to sign cert: {}", e)))?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| SidestepError::Certificate(format!("unusable leaf key: {}", e)))?;

        Ok(CertifiedKey::new(
            vec![cert_der, self.ca_cert_der.clone()],
            signing_key,
        ))
    }
}

/// SNI-driven certificate selection for the inbound handshake. A miss
/// here (no SNI, or an SNI with no registrable domain) aborts the
/// handshake by returning no certificate.
struct MintingResolver {
    manager: Arc<CertManager>,
}

impl std::fmt::Debug for MintingResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MintingResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for MintingResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name().unwrap_or_default();
        match self.manager.certified_key_for(sni) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("no certificate for {:?}: {}", sni, e);
                None
            }
        }
    }
}
