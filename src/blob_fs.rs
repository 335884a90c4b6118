//! Filesystem [`BlobStore`] backend.
//!
//! Each blob is a file under the staging root at its key path. Writes go to
//! a uniquely named temp file in the destination directory and are renamed
//! into place, so a reader sees either no file or the complete file.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use etl_harness_core::error::{EtlError, Result};
use etl_harness_core::store::BlobStore;

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let bad = key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
        if bad {
            return Err(EtlError::internal(format!("invalid blob key '{}'", key)));
        }
        Ok(self.root.join(key))
    }
}

fn io_err(path: &Path, err: std::io::Error) -> EtlError {
    EtlError::internal(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn backend(&self) -> &'static str {
        "filesystem"
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| EtlError::internal(format!("blob key '{}' has no parent", key)))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_err(parent, e))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(&tmp, e));
        }
        tokio::fs::rename(&tmp, &path).await.map_err(|e| io_err(&path, e))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == IoErrorKind::NotFound {
                EtlError::not_found(format!("blob {}", key))
            } else {
                io_err(&path, e)
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }
}
