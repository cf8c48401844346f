//! Error types for key and certificate operations.

use thiserror::Error;

/// Errors produced by the key/certificate primitives.
#[derive(Debug, Error)]
pub enum CertError {
    /// Key generation or certificate signing failed inside rcgen
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    /// Input did not contain a usable PEM block
    #[error("invalid PEM data: {0}")]
    Pem(String),

    /// DER payload is not a valid X.509 certificate
    #[error("invalid X.509 certificate: {0}")]
    X509(String),

    /// Private key type is not supported for signing
    #[error("unsupported private key: {0}")]
    UnsupportedKey(String),

    /// A DNS name could not be encoded into a SAN entry
    #[error("invalid subject alternative name {name:?}: {reason}")]
    InvalidSan { name: String, reason: String },

    /// Certificate signature does not verify against the expected issuer
    #[error("certificate verification failed: {0}")]
    Verification(String),

    /// Reading or writing key material failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for certificate operations.
pub type CertResult<T> = Result<T, CertError>;
