//! Certificate authority keypair.
//!
//! The CA is either generated in-process or loaded from PEM. With
//! [`CaKeypair::load_or_generate`] a generated CA is persisted so every
//! restart (and every replica sharing the files) signs with the same CA.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use rcgen::{Issuer, KeyPair};
use time::OffsetDateTime;
use tracing::info;

use crate::certificate::{parse_cert_pem, Certificate};
use crate::error::{CertError, CertResult};
use crate::key::{new_private_key, parse_private_key_pem};
use crate::signed::{ca_params, CertConfig};

/// A CA certificate together with its signing key.
pub struct CaKeypair {
    cert: Certificate,
    key_pem: String,
    not_before: OffsetDateTime,
    issuer: Issuer<'static, KeyPair>,
}

impl CaKeypair {
    /// Generate a new self-signed CA.
    pub fn generate(common_name: &str, organization: &str) -> CertResult<Self> {
        let config = CertConfig {
            common_name: common_name.to_string(),
            organization: vec![organization.to_string()],
            ..Default::default()
        };

        let key = new_private_key()?;
        let params = ca_params(&config);
        let rcgen_cert = params.self_signed(key.key_pair())?;
        let cert = Certificate::from_der(rcgen_cert.der().clone())?;
        let not_before = cert.info()?.not_before;
        let key_pem = key.to_pem();

        info!(common_name = %common_name, "Generated CA certificate");

        Ok(Self {
            cert,
            key_pem,
            not_before,
            issuer: Issuer::new(params, key.into_key_pair()),
        })
    }

    /// Load a CA from its PEM certificate and key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> CertResult<Self> {
        let cert = parse_cert_pem(cert_pem)?;
        let info = cert.info()?;
        if !info.is_ca {
            return Err(CertError::X509(
                "certificate is not a CA (basicConstraints CA:FALSE)".to_string(),
            ));
        }

        let key = parse_private_key_pem(key_pem)?;
        if key.public_key_der() != spki_der(&cert)? {
            return Err(CertError::Verification(
                "CA private key does not match certificate".to_string(),
            ));
        }

        let key_pem = key.to_pem();
        let issuer = Issuer::from_ca_cert_der(cert.der(), key.into_key_pair())?;

        Ok(Self {
            cert,
            key_pem,
            not_before: info.not_before,
            issuer,
        })
    }

    /// Load the CA from `cert_path`/`key_path`, or generate and persist one
    /// if neither file exists. Exactly one existing file is an error.
    pub fn load_or_generate(
        cert_path: &Path,
        key_path: &Path,
        common_name: &str,
        organization: &str,
    ) -> CertResult<Self> {
        match (cert_path.exists(), key_path.exists()) {
            (true, true) => {
                let cert_pem = fs::read(cert_path)?;
                let key_pem = fs::read(key_path)?;
                let ca = Self::from_pem(&cert_pem, &key_pem)?;
                info!(path = %cert_path.display(), "Loaded CA certificate");
                Ok(ca)
            }
            (false, false) => {
                let ca = Self::generate(common_name, organization)?;
                ca.persist(cert_path, key_path)?;
                info!(
                    cert_path = %cert_path.display(),
                    key_path = %key_path.display(),
                    "Saved CA certificate"
                );
                Ok(ca)
            }
            _ => Err(CertError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "CA cert {} and key {} must both exist or both be absent",
                    cert_path.display(),
                    key_path.display()
                ),
            ))),
        }
    }

    fn persist(&self, cert_path: &Path, key_path: &Path) -> CertResult<()> {
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(cert_path, self.cert.to_pem())?;
        fs::write(key_path, &self.key_pem)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    pub fn cert(&self) -> &Certificate {
        &self.cert
    }

    /// PKCS#8 PEM of the CA key.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Start of the CA validity window; leaves inherit it.
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }
}

impl fmt::Debug for CaKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaKeypair")
            .field("fingerprint", &self.cert.fingerprint())
            .field("not_before", &self.not_before)
            .finish_non_exhaustive()
    }
}

fn spki_der(cert: &Certificate) -> CertResult<Vec<u8>> {
    use x509_parser::prelude::{FromDer, X509Certificate};

    let (_, parsed) = X509Certificate::from_der(cert.der().as_ref())
        .map_err(|e| CertError::X509(e.to_string()))?;
    Ok(parsed.public_key().raw.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_ca() {
        let ca = CaKeypair::generate("dynamiclistener-ca", "dynamiclistener-org").unwrap();
        let info = ca.cert().info().unwrap();

        assert!(info.is_ca);
        assert_eq!(info.common_name.as_deref(), Some("dynamiclistener-ca"));
        assert_eq!(info.not_before, ca.not_before());
        assert!(ca.key_pem().contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn test_from_pem_round_trip() {
        let ca = CaKeypair::generate("ca", "org").unwrap();
        let loaded =
            CaKeypair::from_pem(ca.cert().to_pem().as_bytes(), ca.key_pem().as_bytes()).unwrap();

        assert_eq!(loaded.cert(), ca.cert());
        assert_eq!(loaded.not_before(), ca.not_before());
    }

    #[test]
    fn test_from_pem_rejects_mismatched_key() {
        let ca = CaKeypair::generate("ca", "org").unwrap();
        let other = CaKeypair::generate("ca", "org").unwrap();

        let err = CaKeypair::from_pem(ca.cert().to_pem().as_bytes(), other.key_pem().as_bytes())
            .unwrap_err();
        assert!(matches!(err, CertError::Verification(_)));
    }

    #[test]
    fn test_load_or_generate_persists() {
        let temp_dir = TempDir::new().unwrap();
        let cert_path = temp_dir.path().join("ca/ca.crt");
        let key_path = temp_dir.path().join("ca/ca.key");

        let first = CaKeypair::load_or_generate(&cert_path, &key_path, "ca", "org").unwrap();
        assert!(cert_path.exists());
        assert!(key_path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let second = CaKeypair::load_or_generate(&cert_path, &key_path, "ca", "org").unwrap();
        assert_eq!(first.cert(), second.cert());
    }

    #[test]
    fn test_load_or_generate_requires_both_files() {
        let temp_dir = TempDir::new().unwrap();
        let cert_path = temp_dir.path().join("ca.crt");
        let key_path = temp_dir.path().join("ca.key");
        fs::write(&cert_path, "placeholder").unwrap();

        let err = CaKeypair::load_or_generate(&cert_path, &key_path, "ca", "org").unwrap_err();
        assert!(matches!(err, CertError::Io(_)));
    }
}
