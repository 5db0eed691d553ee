//! Client identity and trust material.
//!
//! The agent authenticates to the cloud with a client key/certificate pair
//! provisioned by the installer. The certificate's subject common name is the
//! agent identifier carried in every heartbeat; it is parsed exactly once at
//! load time.

use std::path::Path;
use std::sync::{Arc, Once};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use thiserror::Error;
use tracing::info;

use crate::config::Config;

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("missing credential file: {0}")]
    MissingCredential(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("no certificate found in {0}")]
    NoCertificate(String),

    #[error("client certificate has no subject common name")]
    NoCommonName,

    #[error("failed to parse client certificate: {0}")]
    BadCertificate(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Loaded agent identity: the certificate-derived agent id plus the TLS
/// client configuration used by the cloud session.
pub struct Identity {
    agent_id: String,
    tls: Arc<rustls::ClientConfig>,
}

impl Identity {
    /// Load key and certificate from the configured credential directory.
    ///
    /// Fails fast: a missing or unreadable pair, or an empty subject CN, is
    /// an unrecoverable startup error.
    pub fn load(config: &Config) -> Result<Self, IdentityError> {
        init_crypto_provider();

        let key_path = config.client_key_path();
        let cert_path = config.client_cert_path();

        let key = load_private_key(&key_path)?;
        let certs = load_certificates(&cert_path)?;

        let agent_id = subject_common_name(&certs[0])?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca_path) = &config.extra_ca_file {
            for cert in load_certificates(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| IdentityError::BadCertificate(e.to_string()))?;
            }
        }

        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?;

        info!(agent_id = %agent_id, "Loaded client identity");

        Ok(Self {
            agent_id,
            tls: Arc::new(tls),
        })
    }

    /// The agent identifier: the client certificate's subject CN.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// TLS client configuration for mutual authentication with the cloud.
    pub fn client_config(&self) -> Arc<rustls::ClientConfig> {
        Arc::clone(&self.tls)
    }
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, IdentityError> {
    let display = path.display().to_string();
    if !path.exists() {
        return Err(IdentityError::MissingCredential(display));
    }

    let pem = std::fs::read(path).map_err(|source| IdentityError::Io {
        path: display.clone(),
        source,
    })?;

    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|source| IdentityError::Io {
            path: display.clone(),
            source,
        })?
        .ok_or(IdentityError::NoPrivateKey(display))
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
    let display = path.display().to_string();
    if !path.exists() {
        return Err(IdentityError::MissingCredential(display));
    }

    let pem = std::fs::read(path).map_err(|source| IdentityError::Io {
        path: display.clone(),
        source,
    })?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|source| IdentityError::Io {
            path: display.clone(),
            source,
        })?;

    if certs.is_empty() {
        return Err(IdentityError::NoCertificate(display));
    }

    Ok(certs)
}

/// Extract the subject common name from a DER-encoded certificate.
fn subject_common_name(cert: &CertificateDer<'_>) -> Result<String, IdentityError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| IdentityError::BadCertificate(e.to_string()))?;

    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or("");

    if cn.is_empty() {
        return Err(IdentityError::NoCommonName);
    }

    Ok(cn.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("client.key");
        let err = load_private_key(&missing).unwrap_err();
        assert!(matches!(err, IdentityError::MissingCredential(_)));
    }

    #[test]
    fn test_missing_cert_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("client.crt");
        let err = load_certificates(&missing).unwrap_err();
        assert!(matches!(err, IdentityError::MissingCredential(_)));
    }

    #[test]
    fn test_empty_pem_has_no_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.crt");
        std::fs::write(&path, "").unwrap();
        let err = load_certificates(&path).unwrap_err();
        assert!(matches!(err, IdentityError::NoCertificate(_)));
    }
}
