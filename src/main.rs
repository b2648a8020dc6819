//! Sidestep - standalone executable
//!
//! Binds the loopback DNS, HTTP, and TLS listeners and runs the intercept
//! loop until Ctrl+C. Any startup failure (missing CA material, unreadable
//! policy file, listener bind) aborts with a non-zero exit.

use std::sync::Arc;
use std::time::Duration;

use sidestep::cert::CertManager;
use sidestep::dns::DnsResponder;
use sidestep::http::HttpRefuser;
use sidestep::intercept::InterceptServer;
use sidestep::outbound::OutboundConnector;
use sidestep::policy::PolicyStore;
use sidestep::resolver::SecureResolver;
use sidestep::ProxyConfig;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("sidestep=info".parse()?))
        .init();

    let config = parse_args()?;
    info!("Config: {:?}", config);

    let certs = Arc::new(CertManager::load(&config)?);

    let policy = Arc::new(PolicyStore::load(&config.policy_path)?);
    tokio::spawn(Arc::clone(&policy).watch());

    let dns = DnsResponder::bind(config.dns_addr, config.clear_upstream, Arc::clone(&policy)).await?;
    tokio::spawn(async move {
        if let Err(e) = dns.run().await {
            error!("DNS responder failed: {}", e);
        }
    });

    let http = HttpRefuser::bind(config.http_addr).await?;
    tokio::spawn(async move {
        if let Err(e) = http.run().await {
            error!("HTTP stub failed: {}", e);
        }
    });

    let outbound = Arc::new(OutboundConnector::new(
        SecureResolver::new(&config),
        Duration::from_secs(config.dial_timeout_secs),
    )?);
    let server = InterceptServer::new(&config, certs, policy, outbound)?;

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
            server.stop();
        }
    }

    Ok(())
}

/// Flag parsing kept deliberately small: every value has a default and
/// the flags only override file locations.
fn parse_args() -> Result<ProxyConfig, String> {
    let mut config = ProxyConfig::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--ca-cert" => {
                config.ca_cert_path = args.next().ok_or("--ca-cert needs a path")?.into();
            }
            "--ca-key" => {
                config.ca_key_path = args.next().ok_or("--ca-key needs a path")?.into();
            }
            "--domains" => {
                config.policy_path = args.next().ok_or("--domains needs a path")?.into();
            }
            other => {
                return Err(format!("unknown argument: {}", other));
            }
        }
    }
    Ok(config)
}
