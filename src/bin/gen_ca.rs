//! Generate a CA pair for the intercept proxy
//!
//! The proxy never creates CA material at runtime; it loads whatever sits
//! at the configured paths. This helper produces a pair for hosts that do
//! not have one yet:
//! cargo run --bin gen_ca

use std::fs;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use sidestep::ProxyConfig;
use time::{Duration, OffsetDateTime};

/// Leaves are reminted every 30 days; the CA outliving them by years is
/// what keeps trust-store reinstalls rare.
const CA_VALIDITY: Duration = Duration::days(3650);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ProxyConfig::default();

    // A CA the client already trusts must not be clobbered by a rerun.
    for path in [&config.ca_cert_path, &config.ca_key_path] {
        if path.exists() {
            return Err(format!("{} already exists, refusing to overwrite", path.display()).into());
        }
    }

    let key = KeyPair::generate()?;
    let cert = ca_params().self_signed(&key)?;

    fs::write(&config.ca_cert_path, cert.pem())?;
    fs::write(&config.ca_key_path, key.serialize_pem())?;

    println!("CA certificate: {}", config.ca_cert_path.display());
    println!("CA private key: {}", config.ca_key_path.display());
    println!(
        "Add {} to the client trust store before starting the proxy.",
        config.ca_cert_path.display()
    );
    Ok(())
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Sidestep Root CA");
    dn.push(DnType::CountryName, "CN");
    params.distinguished_name = dn;

    // Path length zero: this CA only ever signs the proxy's leaf
    // certificates, and revocation is not handled, so no CRL usage.
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + CA_VALIDITY;

    params
}
