//! TLS intercept engine
//!
//! Terminates client TLS with a minted certificate, checks the SNI
//! against the policy, dials the real server, and splices bytes until
//! either direction finishes.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::cert::CertManager;
use crate::error::{Result, SidestepError};
use crate::outbound::OutboundConnector;
use crate::policy::PolicyStore;
use crate::ProxyConfig;

/// Accept loop for the intercept listener.
pub struct InterceptServer {
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    policy: Arc<PolicyStore>,
    outbound: Arc<OutboundConnector>,
    local_addr: Arc<RwLock<Option<SocketAddr>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl InterceptServer {
    pub fn new(
        config: &ProxyConfig,
        certs: Arc<CertManager>,
        policy: Arc<PolicyStore>,
        outbound: Arc<OutboundConnector>,
    ) -> Result<Self> {
        let server_config = certs.server_config()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            addr: config.tls_addr,
            acceptor: TlsAcceptor::from(server_config),
            policy,
            outbound,
            local_addr: Arc::new(RwLock::new(None)),
            shutdown_tx,
        })
    }

    /// Address the listener actually bound, once `run` has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Binds the listener and accepts until shutdown. Bind failure is a
    /// startup failure; accept failures are logged and the loop goes on.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.write() = Some(local_addr);
        info!("TLS intercept listening on {}", local_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!("connection from {}", peer);
                            let acceptor = self.acceptor.clone();
                            let policy = Arc::clone(&self.policy);
                            let outbound = Arc::clone(&self.outbound);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, acceptor, policy, outbound).await {
                                    debug!("connection from {} closed: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutting down intercept server");
                    break;
                }
            }
        }

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// One connection: inbound handshake, policy check, outbound dial,
/// splice. Failure at any step closes the connection.
async fn handle_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    policy: Arc<PolicyStore>,
    outbound: Arc<OutboundConnector>,
) -> Result<()> {
    let client = acceptor.accept(stream).await?;

    let host = client
        .get_ref()
        .1
        .server_name()
        .map(str::to_owned)
        .ok_or(SidestepError::NoSni)?;

    // Serving a minted certificate for a host the user never opted into
    // would look exactly like an attack, so close instead.
    if !policy.is_proxied(&host) {
        error!("{} needs no proxy", host);
        return Ok(());
    }
    debug!("intercepting {}", host);

    let server = outbound.connect(&host).await?;

    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut server_rd, mut server_wr) = tokio::io::split(server);

    // Whichever direction finishes first tears the tunnel down; the
    // other copy is cancelled and both sockets close on drop. Errors on
    // the losing side are expected and swallowed.
    let (sent, received) = tokio::select! {
        res = tokio::io::copy(&mut client_rd, &mut server_wr) => (res.unwrap_or(0), 0),
        res = tokio::io::copy(&mut server_rd, &mut client_wr) => (0, res.unwrap_or(0)),
    };
    debug!("tunnel closed for {} (sent: {}, received: {})", host, sent, received);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::SecureResolver;
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
        KeyUsagePurpose,
    };
    use rustls::pki_types::{CertificateDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio_rustls::TlsConnector;

    fn test_ca() -> (String, String) {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "sidestep test CA");
        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    async fn spawn_server(policy_domains: &[&str]) -> (Arc<InterceptServer>, SocketAddr, String) {
        let (ca_pem, key_pem) = test_ca();
        let certs = Arc::new(CertManager::from_pem(&ca_pem, &key_pem).unwrap());
        let policy = Arc::new(PolicyStore::with_domains(
            policy_domains
                .iter()
                .map(|d| d.to_string())
                .collect::<HashSet<_>>(),
        ));
        let config = ProxyConfig {
            tls_addr: "127.0.0.1:0".parse().unwrap(),
            ..ProxyConfig::default()
        };
        let outbound = Arc::new(
            OutboundConnector::new(SecureResolver::new(&config), Duration::from_secs(5)).unwrap(),
        );
        let server = Arc::new(InterceptServer::new(&config, certs, policy, outbound).unwrap());

        let runner = Arc::clone(&server);
        tokio::spawn(async move { runner.run().await });

        let mut addr = None;
        for _ in 0..50 {
            if let Some(bound) = server.local_addr() {
                addr = Some(bound);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (server, addr.expect("server did not bind"), ca_pem)
    }

    fn client_config(ca_pem: &str) -> Arc<ClientConfig> {
        let ca_der = CertificateDer::from(pem::parse(ca_pem).unwrap().contents().to_vec());
        let mut roots = RootCertStore::empty();
        roots.add(ca_der).unwrap();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        Arc::new(
            ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    /// An off-policy SNI still completes the inbound handshake (the mint
    /// is SNI-driven) but the connection is closed before any bytes are
    /// relayed.
    #[tokio::test]
    async fn off_policy_host_is_closed_after_handshake() {
        let (_server, addr, ca_pem) = spawn_server(&["foo.example.com"]).await;

        let connector = TlsConnector::from(client_config(&ca_pem));
        let tcp = TcpStream::connect(addr).await.unwrap();
        let name = ServerName::try_from("bar.example.com".to_string()).unwrap();
        let mut tls = connector.connect(name, tcp).await.unwrap();

        let mut buf = [0u8; 16];
        let eof = tokio::time::timeout(Duration::from_secs(5), tls.read(&mut buf)).await;
        match eof {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => panic!("unexpected {} bytes from closed tunnel", n),
            Ok(Err(_)) => {}
            Err(_) => panic!("connection not closed"),
        }
    }

    /// The minted leaf presented for a subdomain SNI chains to the local
    /// CA and covers the whole registrable domain, so a client that
    /// trusts the CA completes the handshake.
    #[tokio::test]
    async fn handshake_presents_wildcard_leaf() {
        let (_server, addr, ca_pem) = spawn_server(&["example.com"]).await;

        let connector = TlsConnector::from(client_config(&ca_pem));
        let tcp = TcpStream::connect(addr).await.unwrap();
        let name = ServerName::try_from("www.example.com".to_string()).unwrap();
        let tls = connector.connect(name, tcp).await.unwrap();

        let (_, conn) = tls.get_ref();
        let chain = conn.peer_certificates().unwrap();
        assert_eq!(chain.len(), 2);
        let ca_der = pem::parse(&ca_pem).unwrap().contents().to_vec();
        assert_eq!(chain[1].as_ref(), ca_der.as_slice());
    }
}
