//! CA and leaf certificate signing.

use std::env;
use std::net::IpAddr;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyUsagePurpose, SanType, SerialNumber,
};
use rcgen::string::Ia5String;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::ca::CaKeypair;
use crate::certificate::Certificate;
use crate::error::{CertError, CertResult};
use crate::key::PrivateKey;

/// Environment variable overriding the leaf certificate lifetime in days
pub const EXPIRATION_DAYS_ENV: &str = "DYNLISTENER_NEW_SIGNED_CERT_EXPIRATION_DAYS";

/// Default leaf certificate lifetime in days
pub const DEFAULT_EXPIRATION_DAYS: i64 = 365;

/// CA certificates are valid for ten years
const CA_VALIDITY_DAYS: i64 = 365 * 10;

/// Subject alternative names for a leaf certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AltNames {
    pub dns_names: Vec<String>,
    pub ips: Vec<IpAddr>,
}

/// Subject and SANs of a certificate to sign.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertConfig {
    pub common_name: String,
    pub organization: Vec<String>,
    pub alt_names: AltNames,
}

fn distinguished_name(config: &CertConfig) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, config.common_name.as_str());
    for org in &config.organization {
        dn.push(DnType::OrganizationName, org.as_str());
    }
    dn
}

pub(crate) fn ca_params(config: &CertConfig) -> CertificateParams {
    let now = OffsetDateTime::now_utc();

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(config);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
    params
}

/// Create a self-signed CA certificate for `key`.
pub fn new_self_signed_ca_cert(config: &CertConfig, key: &PrivateKey) -> CertResult<Certificate> {
    let cert = ca_params(config).self_signed(key.key_pair())?;
    Certificate::from_der(cert.der().clone())
}

/// Parse an expiration override; invalid values fall back to the default,
/// values below one clamp to one.
pub fn parse_expiration_days(value: Option<&str>) -> i64 {
    let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return DEFAULT_EXPIRATION_DAYS;
    };

    match raw.parse::<i64>() {
        Ok(days) if days < 1 => {
            warn!(value = %raw, "Expiration days below 1, using 1");
            1
        }
        Ok(days) => days,
        Err(e) => {
            warn!(
                value = %raw,
                error = %e,
                default = DEFAULT_EXPIRATION_DAYS,
                "Invalid expiration days, using default"
            );
            DEFAULT_EXPIRATION_DAYS
        }
    }
}

/// Leaf lifetime in days, read from the environment on every call.
pub fn expiration_days() -> i64 {
    parse_expiration_days(env::var(EXPIRATION_DAYS_ENV).ok().as_deref())
}

fn san_entries(alt_names: &AltNames) -> CertResult<Vec<SanType>> {
    let mut sans = Vec::with_capacity(alt_names.dns_names.len() + alt_names.ips.len());
    for name in &alt_names.dns_names {
        let ia5 = Ia5String::try_from(name.as_str()).map_err(|e| CertError::InvalidSan {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        sans.push(SanType::DnsName(ia5));
    }
    sans.extend(alt_names.ips.iter().copied().map(SanType::IpAddress));
    Ok(sans)
}

/// Sign a server certificate for `key` with the CA.
///
/// The certificate becomes valid at the CA's NotBefore so clients with a
/// skewed clock accept it, and expires [`expiration_days`] from now.
pub fn new_signed_cert(
    config: &CertConfig,
    key: &PrivateKey,
    ca: &CaKeypair,
) -> CertResult<Certificate> {
    let days = expiration_days();

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(config);
    params.subject_alt_names = san_entries(&config.alt_names)?;
    params.serial_number = Some(SerialNumber::from(rand::random::<u64>() >> 1));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;
    params.not_before = ca.not_before();
    params.not_after = OffsetDateTime::now_utc() + Duration::days(days);

    let cert = params.signed_by(key.key_pair(), ca.issuer())?;
    debug!(
        common_name = %config.common_name,
        dns_names = config.alt_names.dns_names.len(),
        ips = config.alt_names.ips.len(),
        days,
        "Signed server certificate"
    );
    Certificate::from_der(cert.der().clone())
}
