//! In-memory [`BlobStore`] used by unit and router tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{EtlError, Result};

use super::BlobStore;

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> EtlError {
    EtlError::internal("blob store lock poisoned")
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .map_err(poisoned)?
            .get(key)
            .cloned()
            .ok_or_else(|| EtlError::not_found(format!("blob {}", key)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().map_err(poisoned)?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryBlobStore::new();
        store.put("a/b/c", b"hello").await.unwrap();
        assert_eq!(store.get("a/b/c").await.unwrap(), b"hello");
        assert_eq!(store.len(), 1);

        store.delete("a/b/c").await.unwrap();
        let err = store.get("a/b/c").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        store.delete("a/b/c").await.unwrap();
        assert!(store.is_empty());
    }
}
