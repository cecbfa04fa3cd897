//! Certificate provisioning for the wildcard TLS bundle
//! Uses mkcert to install a trusted local CA and mint `*.<domain>` certificates

use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, SystemExecutor};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const ROOT_CA_FILE: &str = "rootCA.pem";

/// Cert/key pair for one base domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub domain: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Ensures a wildcard bundle exists for a domain.
///
/// Holds no lock: callers must not run `ensure_certificate` concurrently for
/// the same domain, or two CA installs may race.
pub struct CertificateProvisioner {
    certs_dir: PathBuf,
    mkcert: String,
    executor: Arc<dyn CommandExecutor>,
}

impl CertificateProvisioner {
    pub fn new<P: AsRef<Path>>(
        certs_dir: P,
        mkcert: impl Into<String>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            certs_dir: certs_dir.as_ref().to_path_buf(),
            mkcert: mkcert.into(),
            executor,
        }
    }

    /// Provisioner running the real mkcert binary
    pub fn with_system_executor<P: AsRef<Path>>(certs_dir: P, mkcert: impl Into<String>) -> Self {
        Self::new(certs_dir, mkcert, Arc::new(SystemExecutor))
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    /// mkcert names `*.example.com` output `_wildcard.example.com.pem`
    fn file_stem(domain: &str) -> String {
        format!("_wildcard.{}", domain)
    }

    /// Deterministic bundle location for `domain`, whether or not it exists
    pub fn bundle_paths(&self, domain: &str) -> CertificateBundle {
        let stem = Self::file_stem(domain);
        CertificateBundle {
            domain: domain.to_string(),
            cert_path: self.certs_dir.join(format!("{}.pem", stem)),
            key_path: self.certs_dir.join(format!("{}-key.pem", stem)),
        }
    }

    pub fn check_exists(&self, domain: &str) -> Option<CertificateBundle> {
        let bundle = self.bundle_paths(domain);
        (bundle.cert_path.is_file() && bundle.key_path.is_file()).then_some(bundle)
    }

    /// Any failure to query mkcert counts as "not trusted"
    pub async fn is_ca_trusted(&self) -> bool {
        let output = match self
            .executor
            .run(&self.mkcert, &["-CAROOT".to_string()], None)
            .await
        {
            Ok(output) if output.success => output,
            Ok(output) => {
                debug!("mkcert -CAROOT failed: {}", output.stderr.trim());
                return false;
            }
            Err(e) => {
                debug!("mkcert -CAROOT failed: {}", e);
                return false;
            }
        };

        let ca_root = output.stdout.trim();
        !ca_root.is_empty() && Path::new(ca_root).join(ROOT_CA_FILE).is_file()
    }

    /// Install the local CA into the trust store (may prompt for a password)
    pub async fn install_ca(&self) -> Result<()> {
        info!("Installing local CA with {} -install", self.mkcert);

        let output = self
            .executor
            .run(&self.mkcert, &["-install".to_string()], None)
            .await
            .map_err(|e| Error::CAInstallFailed(e.to_string()))?;

        if !output.success {
            return Err(Error::CAInstallFailed(output.stderr.trim().to_string()));
        }
        Ok(())
    }

    pub async fn generate_certificate(&self, domain: &str) -> Result<CertificateBundle> {
        tokio::fs::create_dir_all(&self.certs_dir).await?;

        let wildcard = format!("*.{}", domain);
        info!("Generating wildcard certificate for {}", wildcard);

        match self
            .executor
            .run(&self.mkcert, &[wildcard], Some(self.certs_dir.as_path()))
            .await
        {
            Ok(output) if output.success => {}
            Ok(output) => {
                warn!("mkcert failed for {}: {}", domain, output.stderr.trim());
                return Err(Error::CertificateGenerationFailed(domain.to_string()));
            }
            Err(e) => {
                warn!("mkcert failed for {}: {}", domain, e);
                return Err(Error::CertificateGenerationFailed(domain.to_string()));
            }
        }

        self.check_exists(domain)
            .ok_or_else(|| Error::CertificateGenerationFailed(domain.to_string()))
    }

    /// Return the existing bundle, or trust the CA if needed and mint one
    pub async fn ensure_certificate(&self, domain: &str) -> Result<CertificateBundle> {
        if let Some(bundle) = self.check_exists(domain) {
            return Ok(bundle);
        }

        if !self.is_ca_trusted().await {
            self.install_ca().await?;
        }

        self.generate_certificate(domain).await
    }
}

/// Build a rustls server configuration from a PEM bundle
pub fn load_server_config(bundle: &CertificateBundle) -> Result<rustls::ServerConfig> {
    let cert_file = File::open(&bundle.cert_path).map_err(|e| {
        Error::Tls(format!("failed to open {}: {}", bundle.cert_path.display(), e))
    })?;
    let key_file = File::open(&bundle.key_path).map_err(|e| {
        Error::Tls(format!("failed to open {}: {}", bundle.key_path.display(), e))
    })?;

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Tls(format!("failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates in {}",
            bundle.cert_path.display()
        )));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::Tls(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", bundle.key_path.display())))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}
