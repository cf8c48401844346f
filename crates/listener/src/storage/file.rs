use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::TlsStorage;
use crate::error::StorageError;
use crate::secret::TlsSecret;

/// Stores the record as Secret-shaped JSON in a single file.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl TlsStorage for FileStorage {
    async fn get(&self) -> Result<Option<TlsSecret>, StorageError> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let secret = serde_json::from_slice(&content)?;
        debug!(path = %self.path.display(), "Loaded TLS secret from file");
        Ok(Some(secret))
    }

    async fn update(&self, secret: &TlsSecret) -> Result<TlsSecret, StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_vec_pretty(secret)?;
        let temp_path = self.temp_path();
        fs::write(&temp_path, &content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        fs::rename(&temp_path, &self.path).await?;
        debug!(path = %self.path.display(), "Saved TLS secret to file");
        Ok(secret.clone())
    }
}
