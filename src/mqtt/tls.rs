//! TLS trust configuration for the broker connection
//!
//! The broker certificate chain is verified against the CA certificate(s)
//! from the configured PEM file only; the system trust store is not used.
//! TLS 1.2 is the lowest accepted protocol version.

use rumqttc::tokio_rustls::rustls::{version, ClientConfig, RootCertStore};
use rumqttc::{TlsConfiguration, Transport};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::error::CertificateLoadError;

/// Reads every certificate in the PEM file into a root store.
pub(crate) fn load_trust_roots(path: &Path) -> Result<RootCertStore, CertificateLoadError> {
    let file = File::open(path).map_err(|source| CertificateLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertificateLoadError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(CertificateLoadError::NoCertificates {
            path: path.to_path_buf(),
        });
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| CertificateLoadError::Rejected {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
    }
    debug!("Loaded {} trust root(s) from {}", roots.len(), path.display());

    Ok(roots)
}

/// Builds the rustls transport used for every connection of a client.
pub(crate) fn secure_transport(ca_cert_path: &Path) -> Result<Transport, CertificateLoadError> {
    let roots = load_trust_roots(ca_cert_path)?;

    let config = ClientConfig::builder_with_protocol_versions(&[&version::TLS13, &version::TLS12])
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Transport::Tls(TlsConfiguration::Rustls(Arc::new(config))))
}
