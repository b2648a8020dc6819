//! Error types for the intercept proxy

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SidestepError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("policy error: {0}")]
    Policy(String),

    #[error("no SNI info")]
    NoSni,

    #[error("connection timeout")]
    Timeout,

    #[error("all dial targets failed for {0}")]
    IpBlocked(String),
}

pub type Result<T> = std::result::Result<T, SidestepError>;
