use std::path::{Path, PathBuf};

use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub(crate) enum FileError {
    #[error("Failed to interact with the filesystem")]
    Io(#[from] std::io::Error),
}

/// Filesystem-backed endpoint, for local deployments and tests.
#[derive(Clone, Debug)]
pub(crate) struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub(crate) async fn build(root: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(FileError::from)?;

        Ok(FileStore { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in key.split('/') {
            path.push(part);
        }
        path
    }

    async fn prepare_parent(&self, path: &Path) -> Result<(), FileError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl Store for FileStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        tokio::fs::metadata(&self.root)
            .await
            .map_err(FileError::from)?;

        Ok(())
    }

    #[tracing::instrument(skip(bytes))]
    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key);

        self.prepare_parent(&path).await?;
        tokio::fs::write(path, bytes).await.map_err(FileError::from)?;

        Ok(())
    }

    #[tracing::instrument]
    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key);

        let bytes = tokio::fs::read(path).await.map_err(FileError::from)?;

        Ok(bytes)
    }

    #[tracing::instrument]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);

        tokio::fs::remove_file(path).await.map_err(FileError::from)?;

        Ok(())
    }
}
