//! Persistence for the serving record.
//!
//! Backends implement [`TlsStorage`]. [`MemoryStorage`] is usually layered
//! over a durable backend ([`FileStorage`], or `KubernetesStorage` with the
//! `kubernetes` feature) so handshakes read from memory.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::factory::TlsFactory;
use crate::secret::TlsSecret;

mod file;
#[cfg(feature = "kubernetes")]
mod kubernetes;
mod memory;

pub use file::FileStorage;
#[cfg(feature = "kubernetes")]
pub use kubernetes::KubernetesStorage;
pub use memory::MemoryStorage;

/// A place the serving record is read from and written to.
#[async_trait]
pub trait TlsStorage: Send + Sync {
    /// Current record, or `None` if nothing has been stored yet.
    async fn get(&self) -> Result<Option<TlsSecret>, StorageError>;

    /// Replace the stored record; returns the record as saved, carrying any
    /// version or merge the storage applied.
    async fn update(&self, secret: &TlsSecret) -> Result<TlsSecret, StorageError>;

    /// Give the storage a factory to merge conflicting updates with.
    fn set_factory(&self, _factory: Arc<dyn TlsFactory>) {}
}

#[async_trait]
impl<T: TlsStorage + ?Sized> TlsStorage for Arc<T> {
    async fn get(&self) -> Result<Option<TlsSecret>, StorageError> {
        (**self).get().await
    }

    async fn update(&self, secret: &TlsSecret) -> Result<TlsSecret, StorageError> {
        (**self).update(secret).await
    }

    fn set_factory(&self, factory: Arc<dyn TlsFactory>) {
        (**self).set_factory(factory)
    }
}

/// Storage wrapper that never returns an absent record and serializes access.
pub struct NonNil {
    storage: Arc<dyn TlsStorage>,
    lock: Mutex<()>,
}

impl NonNil {
    pub fn new(storage: Arc<dyn TlsStorage>) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    /// Current record, or an empty one.
    pub async fn load(&self) -> Result<TlsSecret, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self.storage.get().await?.unwrap_or_default())
    }

    pub async fn store(&self, secret: &TlsSecret) -> Result<TlsSecret, StorageError> {
        let _guard = self.lock.lock().await;
        self.storage.update(secret).await
    }
}

#[async_trait]
impl TlsStorage for NonNil {
    async fn get(&self) -> Result<Option<TlsSecret>, StorageError> {
        self.load().await.map(Some)
    }

    async fn update(&self, secret: &TlsSecret) -> Result<TlsSecret, StorageError> {
        self.store(secret).await
    }

    fn set_factory(&self, factory: Arc<dyn TlsFactory>) {
        self.storage.set_factory(factory)
    }
}
