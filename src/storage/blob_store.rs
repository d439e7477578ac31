//! Blob storage for finished archive files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error_handling::types::StorageError;

/// Where finished WARCs live. Paths are store-relative
/// (e.g. `warcs/<guid>.warc.gz`).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a whole blob into memory.
    async fn open(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Write a blob, creating parent directories, returning its size.
    async fn write(&self, path: &str, data: &[u8]) -> Result<u64, StorageError>;

    async fn size(&self, path: &str) -> Result<u64, StorageError>;
}

/// Filesystem-backed blob store rooted at a base directory.
pub struct FileBlobStore {
    base_path: PathBuf,
}

impl FileBlobStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)
            .map_err(|e| StorageError::WriteFailed(format!("{}: {}", base_path.display(), e)))?;
        info!("FileBlobStore initialized at {}", base_path.display());
        Ok(Self { base_path })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn open(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path);
        fs::read(&full)
            .await
            .map_err(|e| StorageError::ReadFailed(format!("{}: {}", full.display(), e)))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<u64, StorageError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::WriteFailed(format!("{}: {}", parent.display(), e)))?;
        }
        let mut file = fs::File::create(&full)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("{}: {}", full.display(), e)))?;
        file.write_all(data)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("{}: {}", full.display(), e)))?;
        file.flush()
            .await
            .map_err(|e| StorageError::WriteFailed(format!("{}: {}", full.display(), e)))?;
        debug!("Wrote {} byte(s) to {}", data.len(), full.display());
        Ok(data.len() as u64)
    }

    async fn size(&self, path: &str) -> Result<u64, StorageError> {
        let full = self.resolve(path);
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| StorageError::ReadFailed(format!("{}: {}", full.display(), e)))?;
        Ok(meta.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_open_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path()).unwrap();

        let written = store.write("warcs/abc.warc.gz", b"payload").await.unwrap();
        assert_eq!(written, 7);
        assert_eq!(store.size("warcs/abc.warc.gz").await.unwrap(), 7);
        assert_eq!(store.open("warcs/abc.warc.gz").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn missing_blob_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path()).unwrap();
        assert!(store.open("warcs/nope.warc.gz").await.is_err());
    }
}
