//! Private key generation and PEM handling.
//!
//! Keys are wrapped in [`PrivateKey`], a signer abstraction over the rcgen
//! key pair tagged with its [`KeyType`]. Keys are always written as PKCS#8
//! (`PRIVATE KEY`) blocks; parsing also accepts the legacy SEC1
//! (`EC PRIVATE KEY`) and PKCS#1 (`RSA PRIVATE KEY`) block types.

use std::fmt;

use rcgen::{KeyPair, PublicKeyData};
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer};
use tracing::trace;

use crate::error::{CertError, CertResult};

/// PEM block type for PKCS#8 private keys
pub const PRIVATE_KEY_BLOCK_TYPE: &str = "PRIVATE KEY";
/// PEM block type for SEC1 EC private keys
pub const EC_PRIVATE_KEY_BLOCK_TYPE: &str = "EC PRIVATE KEY";
/// PEM block type for PKCS#1 RSA private keys
pub const RSA_PRIVATE_KEY_BLOCK_TYPE: &str = "RSA PRIVATE KEY";

/// Algorithm family of a private key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    EcdsaP256,
    EcdsaP384,
    Rsa,
    Ed25519,
}

impl KeyType {
    fn of(key_pair: &KeyPair) -> CertResult<Self> {
        let alg = key_pair.algorithm();
        if alg == &rcgen::PKCS_ECDSA_P256_SHA256 {
            Ok(KeyType::EcdsaP256)
        } else if alg == &rcgen::PKCS_ECDSA_P384_SHA384 {
            Ok(KeyType::EcdsaP384)
        } else if alg == &rcgen::PKCS_ED25519 {
            Ok(KeyType::Ed25519)
        } else if alg == &rcgen::PKCS_RSA_SHA256
            || alg == &rcgen::PKCS_RSA_SHA384
            || alg == &rcgen::PKCS_RSA_SHA512
        {
            Ok(KeyType::Rsa)
        } else {
            Err(CertError::UnsupportedKey(format!("{alg:?}")))
        }
    }

    /// Name used in logs and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::EcdsaP256 => "ecdsa-p256",
            KeyType::EcdsaP384 => "ecdsa-p384",
            KeyType::Rsa => "rsa",
            KeyType::Ed25519 => "ed25519",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A private key usable for signing certificates.
pub struct PrivateKey {
    key_pair: KeyPair,
    key_type: KeyType,
}

impl PrivateKey {
    /// Wrap an rcgen key pair.
    pub fn from_key_pair(key_pair: KeyPair) -> CertResult<Self> {
        let key_type = KeyType::of(&key_pair)?;
        Ok(Self { key_pair, key_type })
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub(crate) fn into_key_pair(self) -> KeyPair {
        self.key_pair
    }

    /// PKCS#8 DER encoding of the key.
    pub fn to_pkcs8_der(&self) -> Vec<u8> {
        self.key_pair.serialize_der()
    }

    /// PKCS#8 PEM encoding of the key.
    pub fn to_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    /// DER-encoded SubjectPublicKeyInfo.
    pub fn public_key_der(&self) -> Vec<u8> {
        self.key_pair.subject_public_key_info()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

/// Generate a new ECDSA P-256 private key.
pub fn new_private_key() -> CertResult<PrivateKey> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
    trace!("Generated ECDSA P-256 private key");
    PrivateKey::from_key_pair(key_pair)
}

/// Parse the first private key found in PEM data.
///
/// Blocks that aren't private keys (e.g. certificates in a combined file)
/// are skipped.
pub fn parse_private_key_pem(data: &[u8]) -> CertResult<PrivateKey> {
    let blocks = pem::parse_many(data).map_err(|e| CertError::Pem(e.to_string()))?;

    for block in blocks {
        let contents = block.contents().to_vec();
        let der = match block.tag() {
            PRIVATE_KEY_BLOCK_TYPE => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(contents)),
            EC_PRIVATE_KEY_BLOCK_TYPE => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(contents)),
            RSA_PRIVATE_KEY_BLOCK_TYPE => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(contents)),
            other => {
                trace!(block_type = %other, "Skipping non-key PEM block");
                continue;
            }
        };

        let key_pair = KeyPair::try_from(&der).map_err(|e| {
            CertError::UnsupportedKey(format!("{} block: {}", block.tag(), e))
        })?;
        return PrivateKey::from_key_pair(key_pair);
    }

    Err(CertError::Pem("no private key block found".to_string()))
}
