use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use super::TlsStorage;
use crate::error::StorageError;
use crate::factory::{cns, TlsFactory};
use crate::secret::TlsSecret;

/// In-process record cache, optionally backed by a durable storage.
///
/// The first `get` loads from the backing storage; `update` writes through
/// and caches the record the backing storage saved.
pub struct MemoryStorage {
    backing: Option<Arc<dyn TlsStorage>>,
    secret: RwLock<Option<TlsSecret>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            backing: None,
            secret: RwLock::new(None),
        }
    }

    pub fn backed(storage: Arc<dyn TlsStorage>) -> Self {
        Self {
            backing: Some(storage),
            secret: RwLock::new(None),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TlsStorage for MemoryStorage {
    async fn get(&self) -> Result<Option<TlsSecret>, StorageError> {
        if let Some(secret) = self.secret.read().await.as_ref() {
            return Ok(Some(secret.clone()));
        }

        let Some(backing) = &self.backing else {
            return Ok(None);
        };

        let mut cached = self.secret.write().await;
        if cached.is_none() {
            *cached = backing.get().await?;
        }
        Ok(cached.clone())
    }

    async fn update(&self, secret: &TlsSecret) -> Result<TlsSecret, StorageError> {
        let mut cached = self.secret.write().await;
        if cached.as_ref() == Some(secret) {
            return Ok(secret.clone());
        }

        let saved = match &self.backing {
            Some(backing) => backing.update(secret).await?,
            None => secret.clone(),
        };

        info!(
            name = %saved.metadata.name,
            version = %saved.version_token(),
            sans = cns(&saved).len(),
            "Active TLS secret updated"
        );
        *cached = Some(saved.clone());
        Ok(saved)
    }

    fn set_factory(&self, factory: Arc<dyn TlsFactory>) {
        if let Some(backing) = &self.backing {
            backing.set_factory(factory);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backing store that assigns a new resource version on every write.
    #[derive(Default)]
    struct CountingStorage {
        stored: Mutex<Option<TlsSecret>>,
        gets: AtomicUsize,
        updates: AtomicUsize,
    }

    #[async_trait]
    impl TlsStorage for CountingStorage {
        async fn get(&self) -> Result<Option<TlsSecret>, StorageError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(self.stored.lock().clone())
        }

        async fn update(&self, secret: &TlsSecret) -> Result<TlsSecret, StorageError> {
            let version = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
            let mut saved = secret.clone();
            saved.metadata.resource_version = version.to_string();
            *self.stored.lock() = Some(saved.clone());
            Ok(saved)
        }
    }

    fn named(name: &str) -> TlsSecret {
        let mut secret = TlsSecret::default();
        secret.metadata.name = name.to_string();
        secret
    }

    #[tokio::test]
    async fn test_memory_without_backing() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get().await.unwrap(), None);

        storage.update(&named("a")).await.unwrap();
        assert_eq!(storage.get().await.unwrap(), Some(named("a")));
    }

    #[tokio::test]
    async fn test_memory_loads_backing_once() {
        let backing = Arc::new(CountingStorage::default());
        *backing.stored.lock() = Some(named("persisted"));
        let storage = MemoryStorage::backed(backing.clone());

        assert_eq!(storage.get().await.unwrap(), Some(named("persisted")));
        assert_eq!(storage.get().await.unwrap(), Some(named("persisted")));
        assert_eq!(backing.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_memory_writes_through_and_skips_equal() {
        let backing = Arc::new(CountingStorage::default());
        let storage = MemoryStorage::backed(backing.clone());

        let saved = storage.update(&named("a")).await.unwrap();
        storage.update(&saved).await.unwrap();
        storage.update(&named("b")).await.unwrap();

        assert_eq!(backing.updates.load(Ordering::SeqCst), 2);
        assert_eq!(backing.stored.lock().as_ref().unwrap().metadata.name, "b");
    }

    #[tokio::test]
    async fn test_memory_caches_saved_version() {
        let backing = Arc::new(CountingStorage::default());
        let storage = MemoryStorage::backed(backing.clone());

        let saved = storage.update(&named("a")).await.unwrap();
        assert_eq!(saved.metadata.resource_version, "1");

        let cached = storage.get().await.unwrap().unwrap();
        assert_eq!(cached, *backing.stored.lock().as_ref().unwrap());
        assert_eq!(cached.metadata.resource_version, "1");

        storage.update(&named("b")).await.unwrap();
        let cached = storage.get().await.unwrap().unwrap();
        assert_eq!(cached.metadata.resource_version, "2");
        assert_eq!(backing.gets.load(Ordering::SeqCst), 0);
    }
}
