//! Key and certificate primitives for the dynamic TLS listener.
//!
//! This crate provides:
//! - ECDSA P-256 key generation and PEM parsing ([`key`])
//! - Self-signed CA and CA-signed server certificates ([`signed`], [`ca`])
//! - PEM encoding, fingerprinting and expiry checks ([`certificate`])
//!
//! ```no_run
//! use dynlistener_cert::{new_private_key, new_signed_cert, AltNames, CaKeypair, CertConfig};
//!
//! let ca = CaKeypair::generate("dynamiclistener-ca", "dynamiclistener-org")?;
//! let key = new_private_key()?;
//! let config = CertConfig {
//!     common_name: "dynamic".to_string(),
//!     organization: vec!["dynamic".to_string()],
//!     alt_names: AltNames {
//!         dns_names: vec!["localhost".to_string()],
//!         ips: vec![],
//!     },
//! };
//! let leaf = new_signed_cert(&config, &key, &ca)?;
//! # Ok::<(), dynlistener_cert::CertError>(())
//! ```

pub mod ca;
pub mod certificate;
pub mod error;
pub mod key;
pub mod signed;

pub use ca::CaKeypair;
pub use certificate::{
    is_cert_expired, marshal, marshal_chain, parse_cert_pem, parse_certs_pem, CertInfo,
    Certificate, CERTIFICATE_BLOCK_TYPE,
};
pub use error::{CertError, CertResult};
pub use key::{new_private_key, parse_private_key_pem, KeyType, PrivateKey};
pub use signed::{
    expiration_days, new_self_signed_ca_cert, new_signed_cert, parse_expiration_days, AltNames,
    CertConfig, EXPIRATION_DAYS_ENV,
};
