//! Error types for the factory, storage and listener layers.

use std::io;

use dynlistener_cert::CertError;
use thiserror::Error;

/// Certificate factory errors.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// The record is user-provided and must not be modified
    #[error("cannot renew static certificate")]
    StaticCert,

    /// A key or certificate operation failed
    #[error("failed to {op}: {source}")]
    Cert {
        op: &'static str,
        #[source]
        source: CertError,
    },
}

impl FactoryError {
    pub(crate) fn context(op: &'static str) -> impl FnOnce(CertError) -> FactoryError {
        move |source| FactoryError::Cert { op, source }
    }

    pub fn is_static_cert(&self) -> bool {
        matches!(self, FactoryError::StaticCert)
    }
}

/// Storage backend errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid stored record: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "kubernetes")]
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Merging a conflicting update failed
    #[error("failed to merge conflicting record: {0}")]
    Merge(#[from] FactoryError),

    #[error("update still conflicting after {attempts} attempts")]
    ConflictExhausted { attempts: usize },
}

/// Listener errors.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Factory(#[from] FactoryError),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    /// The stored record has no usable certificate and key
    #[error("invalid serving certificate: {0}")]
    InvalidCert(String),
}

impl ListenerError {
    /// Returns `true` when the failure is caused by a static record.
    pub fn is_static_cert(&self) -> bool {
        matches!(self, ListenerError::Factory(e) if e.is_static_cert())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_names_operation() {
        let err = FactoryError::context("parse key")(CertError::Pem("bad".to_string()));
        assert_eq!(err.to_string(), "failed to parse key: invalid PEM data: bad");
        assert!(!err.is_static_cert());
    }

    #[test]
    fn test_listener_error_static_cert() {
        assert!(ListenerError::from(FactoryError::StaticCert).is_static_cert());
        assert!(!ListenerError::InvalidCert("empty".to_string()).is_static_cert());
    }
}
