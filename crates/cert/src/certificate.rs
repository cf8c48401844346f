//! Parsed certificate wrapper and PEM encoding.

use std::net::IpAddr;

use pem::{EncodeConfig, LineEnding, Pem};
use rustls_pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{CertError, CertResult};
use crate::key::PrivateKey;

/// PEM block type for certificates
pub const CERTIFICATE_BLOCK_TYPE: &str = "CERTIFICATE";

/// A DER-encoded X.509 certificate known to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: CertificateDer<'static>,
}

/// Fields of a certificate that the listener cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub common_name: Option<String>,
    pub organizations: Vec<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub is_ca: bool,
}

impl Certificate {
    /// Wrap DER bytes, validating that they parse as X.509.
    pub fn from_der(der: impl Into<CertificateDer<'static>>) -> CertResult<Self> {
        let der = der.into();
        X509Certificate::from_der(der.as_ref()).map_err(|e| CertError::X509(e.to_string()))?;
        Ok(Self { der })
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    /// PEM encoding with LF line endings.
    pub fn to_pem(&self) -> String {
        encode_pem(CERTIFICATE_BLOCK_TYPE, self.der.as_ref())
    }

    /// `SHA256=<HEX>` digest of the DER bytes.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.der.as_ref());
        format!("SHA256={}", hex::encode_upper(digest))
    }

    fn parsed(&self) -> CertResult<X509Certificate<'_>> {
        X509Certificate::from_der(self.der.as_ref())
            .map(|(_, cert)| cert)
            .map_err(|e| CertError::X509(e.to_string()))
    }

    /// Extract subject, SANs and validity.
    pub fn info(&self) -> CertResult<CertInfo> {
        let cert = self.parsed()?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        let organizations = cert
            .subject()
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(str::to_string)
            .collect();

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Some(san) = cert
            .subject_alternative_name()
            .map_err(|e| CertError::X509(e.to_string()))?
        {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(CertInfo {
            common_name,
            organizations,
            dns_names,
            ip_addresses,
            not_before: cert.validity().not_before.to_datetime(),
            not_after: cert.validity().not_after.to_datetime(),
            is_ca: cert.is_ca(),
        })
    }

    /// Check that this certificate's signature was produced by `issuer`'s key.
    pub fn verify_signed_by(&self, issuer: &Certificate) -> CertResult<()> {
        let cert = self.parsed()?;
        let issuer_cert = issuer.parsed()?;

        if cert.issuer().to_string() != issuer_cert.subject().to_string() {
            return Err(CertError::Verification(format!(
                "issuer {} does not match CA subject {}",
                cert.issuer(),
                issuer_cert.subject()
            )));
        }

        cert.verify_signature(Some(issuer_cert.public_key()))
            .map_err(|e| CertError::Verification(e.to_string()))
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

pub(crate) fn encode_pem(tag: &str, contents: &[u8]) -> String {
    let block = Pem::new(tag, contents.to_vec());
    pem::encode_config(&block, EncodeConfig::new().set_line_ending(LineEnding::LF))
}

/// Parse every certificate in PEM data, in order.
pub fn parse_certs_pem(data: &[u8]) -> CertResult<Vec<Certificate>> {
    let blocks = pem::parse_many(data).map_err(|e| CertError::Pem(e.to_string()))?;

    let certs = blocks
        .into_iter()
        .filter(|block| block.tag() == CERTIFICATE_BLOCK_TYPE)
        .map(|block| Certificate::from_der(block.into_contents()))
        .collect::<CertResult<Vec<_>>>()?;

    if certs.is_empty() {
        return Err(CertError::Pem("no certificate block found".to_string()));
    }
    Ok(certs)
}

/// Parse the first certificate in PEM data.
pub fn parse_cert_pem(data: &[u8]) -> CertResult<Certificate> {
    parse_certs_pem(data)?
        .into_iter()
        .next()
        .ok_or_else(|| CertError::Pem("no certificate block found".to_string()))
}

/// Encode a certificate and its key as PEM.
pub fn marshal(cert: &Certificate, key: &PrivateKey) -> (String, String) {
    (cert.to_pem(), key.to_pem())
}

/// Encode a leaf certificate followed by its CA, plus the leaf key.
pub fn marshal_chain(
    cert: &Certificate,
    key: &PrivateKey,
    ca: &Certificate,
) -> (String, String) {
    let mut chain = cert.to_pem();
    chain.push_str(&ca.to_pem());
    (chain, key.to_pem())
}

/// Returns `true` if the certificate expires within `days` days from now.
pub fn is_cert_expired(cert: &Certificate, days: u32) -> CertResult<bool> {
    let info = cert.info()?;
    let threshold = OffsetDateTime::now_utc() + time::Duration::days(i64::from(days));
    Ok(info.not_after <= threshold)
}
