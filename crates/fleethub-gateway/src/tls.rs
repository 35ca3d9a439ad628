//! TLS material loading, one trust domain at a time.
//!
//! The hub, tunnel, and stream domains are loaded independently; nothing in
//! this module lets one domain's material leak into another's config.

use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;

use crate::config::TlsDomainConfig;

/// TLS loading errors.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCerts(String),

    #[error("no private key found in {0}")]
    NoKey(String),

    #[error("tls setup error: {0}")]
    Rustls(String),
}

fn read_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = std::fs::File::open(path).map_err(|source| TlsError::Read {
        path: path.to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCerts(path.to_string()));
    }
    Ok(certs)
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = std::fs::File::open(path).map_err(|source| TlsError::Read {
        path: path.to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoKey(path.to_string()))
}

fn read_roots(path: &str) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TlsError::Rustls(e.to_string()))?;
    }
    Ok(roots)
}

/// Build a server config for one trust domain.
///
/// With `require_client_cert` the handshake fails without a certificate
/// signed by the domain CA; otherwise the certificate is requested but
/// anonymous peers are admitted (the HTTPS bootstrap surface needs this:
/// nodes enrolling for their first certificate have none to present).
pub fn server_config(
    domain: &TlsDomainConfig,
    require_client_cert: bool,
) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = read_certs(&domain.cert_file)?;
    let key = read_key(&domain.key_file)?;
    let roots = Arc::new(read_roots(&domain.ca_file)?);

    let verifier_builder = WebPkiClientVerifier::builder(roots);
    let verifier = if require_client_cert {
        verifier_builder.build()
    } else {
        verifier_builder.allow_unauthenticated().build()
    }
    .map_err(|e| TlsError::Rustls(e.to_string()))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Rustls(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Build a client config for dialing cluster-side stream targets.
pub fn client_config(domain: &TlsDomainConfig) -> Result<Arc<ClientConfig>, TlsError> {
    let roots = read_roots(&domain.ca_file)?;
    let certs = read_certs(&domain.cert_file)?;
    let key = read_key(&domain.key_file)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| TlsError::Rustls(e.to_string()))?;

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};

    fn write_domain(dir: &std::path::Path) -> TlsDomainConfig {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Test CA");
        ca_params.distinguished_name = dn;
        ca_params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "localhost");
        server_params.distinguished_name = dn;
        let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

        let ca_file = dir.join("ca.crt");
        let cert_file = dir.join("server.crt");
        let key_file = dir.join("server.key");
        std::fs::write(&ca_file, ca_cert.pem()).unwrap();
        std::fs::write(&cert_file, server_cert.pem()).unwrap();
        std::fs::write(&key_file, server_key.serialize_pem()).unwrap();

        TlsDomainConfig {
            ca_file: ca_file.to_string_lossy().into_owned(),
            ca_key_file: String::new(),
            cert_file: cert_file.to_string_lossy().into_owned(),
            key_file: key_file.to_string_lossy().into_owned(),
        }
    }

    #[test]
    fn test_server_config_loads_generated_material() {
        let dir = std::env::temp_dir().join(format!("fleethub-tls-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let domain = write_domain(&dir);

        assert!(server_config(&domain, true).is_ok());
        assert!(server_config(&domain, false).is_ok());
        assert!(client_config(&domain).is_ok());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_files_error_names_the_path() {
        let domain = TlsDomainConfig {
            ca_file: "/nonexistent/ca.crt".to_string(),
            ca_key_file: String::new(),
            cert_file: "/nonexistent/server.crt".to_string(),
            key_file: "/nonexistent/server.key".to_string(),
        };
        match server_config(&domain, true) {
            Err(TlsError::Read { path, .. }) => assert!(path.contains("nonexistent")),
            other => panic!("expected read error, got {:?}", other.err()),
        }
    }
}
