//! Blob storage abstraction for staged artifacts.
//!
//! The [`BlobStore`] trait holds the raw bytes of every staged object
//! version. The staging catalog decides which keys are visible; a blob
//! store only needs to write, read and delete opaque keys. Backends:
//!
//! | Backend | Crate | Notes |
//! |---------|-------|-------|
//! | [`memory::InMemoryBlobStore`] | core | tests |
//! | filesystem | `etl-harness` | temp file + rename |
//! | s3 | `etl-harness` | SigV4 REST |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Short backend identifier (`"memory"`, `"filesystem"`, `"s3"`).
    fn backend(&self) -> &'static str;

    /// Write `bytes` under `key`. A completed `put` is fully visible to
    /// later `get`s; a failed one leaves nothing readable under `key`.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Read the bytes under `key`. `NotFound` if absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}
