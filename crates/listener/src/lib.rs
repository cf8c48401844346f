//! Dynlistener
//!
//! A TLS listener that issues its own serving certificate from a CA and
//! grows it as clients reach the listener under new names.
//!
//! - **Factory**: signs leaf certificates and tracks the SAN set in record
//!   annotations
//! - **Storage**: memory, file and (with the `kubernetes` feature) Secret
//!   backends for the serving record
//! - **Listener**: SNI and local IP driven certificate expansion, expiry
//!   renewal and optional connection invalidation on rotation
//! - **HTTP**: a Host header observer and an HTTPS redirect layer
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dynlistener::{DynamicListener, ListenerConfig, MemoryStorage};
//! use dynlistener_cert::CaKeypair;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let tcp = tokio::net::TcpListener::bind("0.0.0.0:8443").await?;
//! let ca = Arc::new(CaKeypair::generate("dynamiclistener-ca", "dynamiclistener-org")?);
//! let config = ListenerConfig {
//!     sans: vec!["localhost".to_string()],
//!     ..Default::default()
//! };
//!
//! let (listener, _cache) =
//!     DynamicListener::new(tcp, Arc::new(MemoryStorage::new()), ca, config).await?;
//! loop {
//!     let accepted = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let _tls = accepted.handshake().await;
//!     });
//! }
//! # }
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod conn;
pub mod error;
pub mod factory;
pub mod http;
pub mod known_ips;
pub mod listener;
pub mod metrics;
pub mod secret;
pub mod storage;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use error::{FactoryError, ListenerError, StorageError};

pub use factory::{CertFactory, FilterFn, TlsFactory};

pub use listener::{
    Accepted, CacheHandler, Connection, DynamicListener, Listener, ListenerConfig, RegenerateFn,
};

pub use metrics::ListenerMetrics;

pub use secret::TlsSecret;

#[cfg(feature = "kubernetes")]
pub use storage::KubernetesStorage;
pub use storage::{FileStorage, MemoryStorage, NonNil, TlsStorage};
