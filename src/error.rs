//! Error taxonomy shared by the routing engine, lifecycle and provisioners

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Host header is not `<subdomain>.<baseDomain>`
    #[error("Invalid subdomain")]
    InvalidHost,

    #[error("Host not found: {0}")]
    UnknownHost(String),

    #[error("Proxy Error: {0}")]
    BackendUnreachable(String),

    #[error("failed to bind port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("certificate for *.{domain} not found (expected {cert_path} and {key_path}); run `mkcert \"*.{domain}\"` or `devproxy cert ensure`")]
    CertificateMissing {
        domain: String,
        cert_path: String,
        key_path: String,
    },

    #[error("certificate generation failed for *.{0}")]
    CertificateGenerationFailed(String),

    #[error("local CA installation failed: {0}")]
    CAInstallFailed(String),

    #[error("operation cancelled by user")]
    UserCancelled,

    #[error("port forwarding setup failed: {0}")]
    PortForwardFailed(String),

    #[error("No available port found between {start} and {end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("No host with id {0}")]
    NotFound(String),

    #[error("invalid subdomain label: {0:?}")]
    InvalidSubdomain(String),

    #[error("invalid base domain: {0:?}")]
    InvalidDomain(String),

    #[error("invalid port: {0}")]
    InvalidPort(u32),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("failed to run {program}: {reason}")]
    Command { program: String, reason: String },

    #[error("registry error: {0}")]
    Registry(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
