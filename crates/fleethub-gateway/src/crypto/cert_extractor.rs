//! Certificate parsing and node identity extraction.
//!
//! The node identity is the X.509 subject Common Name. This is the sole
//! input to the authorization gate's node mode.

use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::prelude::*;

/// Errors that can occur during certificate extraction.
#[derive(Debug, Error)]
pub enum CertExtractError {
    #[error("failed to parse certificate: {0}")]
    ParseError(String),

    #[error("certificate does not contain a Common Name (CN)")]
    MissingCn,

    #[error("node name in CN cannot be empty")]
    EmptyNodeName,

    #[error("node name '{0}' contains invalid characters")]
    InvalidNodeName(String),
}

/// Extract the node name from a DER-encoded X.509 certificate.
///
/// The subject CN is the node name. Names are restricted to alphanumerics,
/// hyphens, underscores, and dots, matching what the gateway CA issues.
pub fn extract_node_name_from_cert(cert_der: &[u8]) -> Result<String, CertExtractError> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| CertExtractError::ParseError(format!("{:?}", e)))?;

    let cn = extract_cn_from_subject(&cert)?;
    validate_node_name(&cn)?;
    Ok(cn)
}

/// Extract the node name from a PEM-encoded certificate.
///
/// Used by the Unix-socket transport, where the caller presents its
/// certificate inside the hello frame instead of a TLS handshake.
pub fn extract_node_name_from_pem(cert_pem: &str) -> Result<String, CertExtractError> {
    let parsed = ::pem::parse(cert_pem).map_err(|e| CertExtractError::ParseError(e.to_string()))?;
    extract_node_name_from_cert(parsed.contents())
}

/// SHA-256 fingerprint of a DER certificate, hex encoded.
pub fn cert_fingerprint(cert_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert_der);
    hex::encode(hasher.finalize())
}

fn validate_node_name(name: &str) -> Result<(), CertExtractError> {
    if name.is_empty() {
        return Err(CertExtractError::EmptyNodeName);
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CertExtractError::InvalidNodeName(name.to_string()));
    }
    Ok(())
}

/// Extract Common Name from certificate subject.
fn extract_cn_from_subject(cert: &X509Certificate<'_>) -> Result<String, CertExtractError> {
    for rdn in cert.subject().iter() {
        for attr in rdn.iter() {
            if attr.attr_type() == &oid_registry::OID_X509_COMMON_NAME {
                return attr
                    .attr_value()
                    .as_str()
                    .map(|s| s.to_string())
                    .map_err(|e| {
                        CertExtractError::ParseError(format!("Failed to parse CN: {:?}", e))
                    });
            }
        }
    }

    Err(CertExtractError::MissingCn)
}
