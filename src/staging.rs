//! Staging store: bucket / folder / object catalog over a [`BlobStore`].
//!
//! The catalog (`buckets`, `folders`, `objects` tables) decides what is
//! visible; blob backends only hold bytes. Every upload creates a new
//! immutable version. Publication is two-phase:
//!
//! 1. each new version's bytes are written under a fresh unique blob key;
//! 2. the catalog rows for the whole [`ChangeSet`] are committed in one
//!    transaction.
//!
//! A reader resolving a version through the catalog therefore sees either
//! the old state or the complete new state. Blobs of a failed change set are
//! deleted again; blobs of removed objects are deleted after commit.
//!
//! Writers to one object serialize through [`KeyedLocks`] on
//! [`ObjectKey::lock_key`]. [`StagingStore::upload`] and
//! [`StagingStore::delete_object`] take that lock themselves;
//! [`StagingStore::publish`] expects the caller to hold it.

use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use etl_harness_core::error::{EtlError, Result};
use etl_harness_core::models::{
    validate_bucket_name, validate_path_segment, Bucket, BucketContents, Folder, ObjectInfo,
    ObjectKey,
};
use etl_harness_core::store::BlobStore;

use crate::db::{begin_write, db_err, is_unique_violation, now_iso};
use crate::locks::KeyedLocks;

/// One object write or removal inside a change set.
#[derive(Debug, Clone)]
pub enum Change {
    Put {
        key: ObjectKey,
        bytes: Vec<u8>,
        content_type: String,
    },
    /// Remove every version of the object.
    Remove { key: ObjectKey },
}

/// Objects published together or not at all.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: ObjectKey, bytes: Vec<u8>, content_type: impl Into<String>) {
        self.changes.push(Change::Put {
            key,
            bytes,
            content_type: content_type.into(),
        });
    }

    pub fn remove(&mut self, key: ObjectKey) {
        self.changes.push(Change::Remove { key });
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Clone)]
pub struct StagingStore {
    pool: SqlitePool,
    blobs: Arc<dyn BlobStore>,
    locks: KeyedLocks,
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(bytes))
}

/// MIME type guessed from the object name's extension.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => "text/csv",
        "txt" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

fn row_to_object(row: &sqlx::sqlite::SqliteRow) -> ObjectInfo {
    ObjectInfo {
        bucket: row.get("bucket_name"),
        folder: row.get("folder_name"),
        object: row.get("object_name"),
        version: row.get("version"),
        size: row.get("size"),
        content_type: row.get("content_type"),
        sha256: row.get("sha256"),
        created_at: row.get("created_at"),
    }
}

const OBJECT_COLUMNS: &str =
    "bucket_name, folder_name, object_name, version, size, content_type, sha256, created_at";

impl StagingStore {
    pub fn new(pool: SqlitePool, blobs: Arc<dyn BlobStore>, locks: KeyedLocks) -> Self {
        Self { pool, blobs, locks }
    }

    pub fn backend(&self) -> &'static str {
        self.blobs.backend()
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    // ============ Buckets ============

    pub async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        let rows = sqlx::query("SELECT bucket_name, region, created_at FROM buckets ORDER BY bucket_name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|r| Bucket {
                bucket_name: r.get("bucket_name"),
                region: r.get("region"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    pub async fn create_bucket(&self, name: &str, region: &str) -> Result<Bucket> {
        validate_bucket_name(name)?;
        if region.trim().is_empty() {
            return Err(EtlError::invalid("region must not be empty"));
        }
        let now = now_iso();
        sqlx::query("INSERT INTO buckets (bucket_name, region, created_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(region)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EtlError::DuplicateKey(format!("bucket '{}'", name))
                } else {
                    db_err(e)
                }
            })?;
        info!(bucket = %name, region = %region, "bucket created");
        Ok(Bucket {
            bucket_name: name.to_string(),
            region: region.to_string(),
            created_at: now,
        })
    }

    async fn bucket(&self, name: &str, region: Option<&str>) -> Result<Bucket> {
        let row = sqlx::query("SELECT bucket_name, region, created_at FROM buckets WHERE bucket_name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| EtlError::not_found(format!("bucket '{}'", name)))?;
        let bucket = Bucket {
            bucket_name: row.get("bucket_name"),
            region: row.get("region"),
            created_at: row.get("created_at"),
        };
        match region {
            Some(r) if !r.is_empty() && r != bucket.region => Err(EtlError::not_found(format!(
                "bucket '{}' in region '{}'",
                name, r
            ))),
            _ => Ok(bucket),
        }
    }

    /// Bucket metadata plus folders. `NotFound` if absent or in another region.
    pub async fn get_bucket(&self, name: &str, region: Option<&str>) -> Result<BucketContents> {
        let bucket = self.bucket(name, region).await?;
        let folders = self.list_folders(name).await?;
        Ok(BucketContents { bucket, folders })
    }

    /// Delete a bucket. Non-empty buckets need `force`, which cascades.
    pub async fn delete_bucket(&self, name: &str, region: Option<&str>, force: bool) -> Result<()> {
        self.bucket(name, region).await?;

        let mut tx = begin_write(&self.pool).await?;
        let folder_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM folders WHERE bucket_name = ?")
            .bind(name)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        if folder_count > 0 && !force {
            return Err(EtlError::Conflict(format!(
                "bucket '{}' still has {} folder(s); pass force=true to delete them",
                name, folder_count
            )));
        }
        let blob_keys: Vec<String> = sqlx::query_scalar("SELECT blob_key FROM objects WHERE bucket_name = ?")
            .bind(name)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;
        for sql in [
            "DELETE FROM objects WHERE bucket_name = ?",
            "DELETE FROM folders WHERE bucket_name = ?",
            "DELETE FROM buckets WHERE bucket_name = ?",
        ] {
            sqlx::query(sql).bind(name).execute(&mut *tx).await.map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        self.discard_blobs(&blob_keys).await;
        info!(bucket = %name, folders = folder_count, blobs = blob_keys.len(), "bucket deleted");
        Ok(())
    }

    /// Create the bucket if it does not exist yet.
    pub async fn ensure_bucket(&self, name: &str, region: &str) -> Result<()> {
        match self.create_bucket(name, region).await {
            Ok(_) | Err(EtlError::DuplicateKey(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ============ Folders ============

    pub async fn create_folder(&self, bucket: &str, folder: &str) -> Result<Folder> {
        validate_path_segment("folder", folder)?;
        self.bucket(bucket, None).await?;
        let now = now_iso();
        sqlx::query("INSERT INTO folders (bucket_name, folder_name, created_at) VALUES (?, ?, ?)")
            .bind(bucket)
            .bind(folder)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EtlError::DuplicateKey(format!("folder '{}/{}'", bucket, folder))
                } else {
                    db_err(e)
                }
            })?;
        info!(bucket = %bucket, folder = %folder, "folder created");
        Ok(Folder {
            bucket_name: bucket.to_string(),
            folder_name: folder.to_string(),
            object_count: 0,
            created_at: now,
        })
    }

    /// Create the folder if it does not exist yet. The bucket must exist.
    pub async fn ensure_folder(&self, bucket: &str, folder: &str) -> Result<()> {
        match self.create_folder(bucket, folder).await {
            Ok(_) | Err(EtlError::DuplicateKey(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn list_folders(&self, bucket: &str) -> Result<Vec<Folder>> {
        self.bucket(bucket, None).await?;
        let rows = sqlx::query(
            "SELECT f.bucket_name, f.folder_name, f.created_at, \
                    (SELECT COUNT(DISTINCT o.object_name) FROM objects o \
                      WHERE o.bucket_name = f.bucket_name AND o.folder_name = f.folder_name) AS object_count \
             FROM folders f WHERE f.bucket_name = ? ORDER BY f.folder_name",
        )
        .bind(bucket)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|r| Folder {
                bucket_name: r.get("bucket_name"),
                folder_name: r.get("folder_name"),
                object_count: r.get("object_count"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn require_folder(&self, bucket: &str, folder: &str) -> Result<()> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM folders WHERE bucket_name = ? AND folder_name = ?",
        )
        .bind(bucket)
        .bind(folder)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        if exists {
            Ok(())
        } else {
            Err(EtlError::not_found(format!("folder '{}/{}'", bucket, folder)))
        }
    }

    /// Latest version of every object in a folder.
    pub async fn list_objects(&self, bucket: &str, folder: &str) -> Result<Vec<ObjectInfo>> {
        self.require_folder(bucket, folder).await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM objects o WHERE bucket_name = ? AND folder_name = ? \
             AND version = (SELECT MAX(version) FROM objects i \
                 WHERE i.bucket_name = o.bucket_name AND i.folder_name = o.folder_name \
                 AND i.object_name = o.object_name) \
             ORDER BY object_name",
            OBJECT_COLUMNS
        ))
        .bind(bucket)
        .bind(folder)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(row_to_object).collect())
    }

    /// Delete a folder. Non-empty folders need `force`, which cascades.
    pub async fn delete_folder(&self, bucket: &str, folder: &str, force: bool) -> Result<()> {
        self.require_folder(bucket, folder).await?;
        let mut tx = begin_write(&self.pool).await?;
        let blob_keys: Vec<String> = sqlx::query_scalar(
            "SELECT blob_key FROM objects WHERE bucket_name = ? AND folder_name = ?",
        )
        .bind(bucket)
        .bind(folder)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        if !blob_keys.is_empty() && !force {
            return Err(EtlError::Conflict(format!(
                "folder '{}/{}' is not empty; pass force=true to delete its objects",
                bucket, folder
            )));
        }
        for sql in [
            "DELETE FROM objects WHERE bucket_name = ? AND folder_name = ?",
            "DELETE FROM folders WHERE bucket_name = ? AND folder_name = ?",
        ] {
            sqlx::query(sql)
                .bind(bucket)
                .bind(folder)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        self.discard_blobs(&blob_keys).await;
        info!(bucket = %bucket, folder = %folder, "folder deleted");
        Ok(())
    }

    // ============ Objects ============

    /// Store bytes as the next version of `key`. The folder must exist.
    pub async fn upload(&self, key: &ObjectKey, bytes: Vec<u8>, content_type: Option<&str>) -> Result<ObjectInfo> {
        key.validate()?;
        self.require_folder(&key.bucket, &key.folder).await?;
        let _guard = self.locks.acquire(&key.lock_key()).await;
        let content_type = content_type
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| content_type_for(&key.object))
            .to_string();
        let mut set = ChangeSet::new();
        set.put(key.clone(), bytes, content_type);
        let mut published = self.publish(set).await?;
        published
            .pop()
            .ok_or_else(|| EtlError::internal("upload published nothing"))
    }

    /// Publish a change set atomically. The caller holds the object locks.
    ///
    /// Returns the new version of every `Put`, in order.
    pub async fn publish(&self, set: ChangeSet) -> Result<Vec<ObjectInfo>> {
        // Phase 1: bytes under fresh keys, invisible until the catalog commit.
        let mut written: Vec<String> = Vec::new();
        let mut staged = Vec::new();
        for change in &set.changes {
            if let Change::Put {
                key,
                bytes,
                content_type,
            } = change
            {
                let blob_key = format!(
                    "{}/{}/{}/{}",
                    key.bucket,
                    key.folder,
                    key.object,
                    uuid::Uuid::new_v4()
                );
                if let Err(e) = self.blobs.put(&blob_key, bytes).await {
                    self.discard_blobs(&written).await;
                    return Err(e);
                }
                written.push(blob_key.clone());
                staged.push((key, blob_key, bytes.len() as i64, sha256_hex(bytes), content_type));
            }
        }

        // Phase 2: one catalog transaction for the whole set.
        match self.commit_catalog(&set, &staged).await {
            Ok((published, removed_blobs)) => {
                self.discard_blobs(&removed_blobs).await;
                for info in &published {
                    info!(object = %info.key(), version = info.version, size = info.size, "object published");
                }
                Ok(published)
            }
            Err(e) => {
                self.discard_blobs(&written).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn commit_catalog(
        &self,
        set: &ChangeSet,
        staged: &[(&ObjectKey, String, i64, String, &String)],
    ) -> Result<(Vec<ObjectInfo>, Vec<String>)> {
        let mut tx = begin_write(&self.pool).await?;
        let mut removed_blobs = Vec::new();
        for change in &set.changes {
            if let Change::Remove { key } = change {
                let keys: Vec<String> = sqlx::query_scalar(
                    "SELECT blob_key FROM objects WHERE bucket_name = ? AND folder_name = ? AND object_name = ?",
                )
                .bind(&key.bucket)
                .bind(&key.folder)
                .bind(&key.object)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?;
                sqlx::query("DELETE FROM objects WHERE bucket_name = ? AND folder_name = ? AND object_name = ?")
                    .bind(&key.bucket)
                    .bind(&key.folder)
                    .bind(&key.object)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                removed_blobs.extend(keys);
            }
        }

        let mut published = Vec::with_capacity(staged.len());
        for (key, blob_key, size, sha, content_type) in staged {
            let folder_exists: bool = sqlx::query_scalar(
                "SELECT COUNT(*) > 0 FROM folders WHERE bucket_name = ? AND folder_name = ?",
            )
            .bind(&key.bucket)
            .bind(&key.folder)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            if !folder_exists {
                return Err(EtlError::not_found(format!("folder '{}/{}'", key.bucket, key.folder)));
            }
            let version: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM objects \
                 WHERE bucket_name = ? AND folder_name = ? AND object_name = ?",
            )
            .bind(&key.bucket)
            .bind(&key.folder)
            .bind(&key.object)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            let now = now_iso();
            sqlx::query(
                "INSERT INTO objects (bucket_name, folder_name, object_name, version, size, content_type, sha256, blob_key, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&key.bucket)
            .bind(&key.folder)
            .bind(&key.object)
            .bind(version)
            .bind(size)
            .bind(content_type.as_str())
            .bind(sha)
            .bind(blob_key)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            published.push(ObjectInfo {
                bucket: key.bucket.clone(),
                folder: key.folder.clone(),
                object: key.object.clone(),
                version,
                size: *size,
                content_type: content_type.to_string(),
                sha256: sha.clone(),
                created_at: now,
            });
        }
        tx.commit().await.map_err(db_err)?;
        Ok((published, removed_blobs))
    }

    async fn discard_blobs(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.blobs.delete(key).await {
                warn!(blob = %key, error = %e, "failed to delete blob");
            }
        }
    }

    async fn resolve(&self, key: &ObjectKey, version: Option<i64>) -> Result<(ObjectInfo, String)> {
        let sql = format!(
            "SELECT {}, blob_key FROM objects WHERE bucket_name = ? AND folder_name = ? AND object_name = ? {} \
             ORDER BY version DESC LIMIT 1",
            OBJECT_COLUMNS,
            if version.is_some() { "AND version = ?" } else { "" }
        );
        let mut query = sqlx::query(&sql).bind(&key.bucket).bind(&key.folder).bind(&key.object);
        if let Some(v) = version {
            query = query.bind(v);
        }
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| match version {
                Some(v) => EtlError::not_found(format!("object '{}' version {}", key, v)),
                None => EtlError::not_found(format!("object '{}'", key)),
            })?;
        Ok((row_to_object(&row), row.get("blob_key")))
    }

    /// Latest catalog entry, or `None` if the object does not exist.
    pub async fn head(&self, key: &ObjectKey) -> Result<Option<ObjectInfo>> {
        match self.resolve(key, None).await {
            Ok((info, _)) => Ok(Some(info)),
            Err(EtlError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Bytes of `version` (latest when `None`).
    pub async fn download(&self, key: &ObjectKey, version: Option<i64>) -> Result<(ObjectInfo, Vec<u8>)> {
        let (info, blob_key) = self.resolve(key, version).await?;
        let bytes = self.blobs.get(&blob_key).await?;
        Ok((info, bytes))
    }

    pub async fn list_versions(&self, key: &ObjectKey) -> Result<Vec<ObjectInfo>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM objects WHERE bucket_name = ? AND folder_name = ? AND object_name = ? \
             ORDER BY version",
            OBJECT_COLUMNS
        ))
        .bind(&key.bucket)
        .bind(&key.folder)
        .bind(&key.object)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        if rows.is_empty() {
            return Err(EtlError::not_found(format!("object '{}'", key)));
        }
        Ok(rows.iter().map(row_to_object).collect())
    }

    /// Remove every version of an object.
    pub async fn delete_object(&self, key: &ObjectKey) -> Result<()> {
        let _guard = self.locks.acquire(&key.lock_key()).await;
        if self.head(key).await?.is_none() {
            return Err(EtlError::not_found(format!("object '{}'", key)));
        }
        let mut set = ChangeSet::new();
        set.remove(key.clone());
        self.publish(set).await?;
        info!(object = %key, "object deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use etl_harness_core::error::ErrorKind;
    use etl_harness_core::store::memory::InMemoryBlobStore;

    async fn store() -> (StagingStore, Arc<InMemoryBlobStore>) {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = StagingStore::new(memory_pool().await, blobs.clone(), KeyedLocks::new());
        (store, blobs)
    }

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let (s, _) = store().await;
        s.create_bucket("raw-data", "us-east-1").await.unwrap();
        assert_eq!(
            s.create_bucket("raw-data", "us-east-1").await.unwrap_err().kind(),
            ErrorKind::DuplicateKey
        );
        assert_eq!(
            s.get_bucket("raw-data", Some("eu-west-1")).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        s.create_folder("raw-data", "orders").await.unwrap();
        let contents = s.get_bucket("raw-data", Some("us-east-1")).await.unwrap();
        assert_eq!(contents.folders.len(), 1);

        assert_eq!(
            s.delete_bucket("raw-data", None, false).await.unwrap_err().kind(),
            ErrorKind::Conflict
        );
        s.delete_bucket("raw-data", None, true).await.unwrap();
        assert_eq!(s.get_bucket("raw-data", None).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_folder_needs_bucket() {
        let (s, _) = store().await;
        let err = s.create_folder("missing", "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_upload_creates_versions() {
        let (s, blobs) = store().await;
        s.create_bucket("raw-data", "us-east-1").await.unwrap();
        s.create_folder("raw-data", "orders").await.unwrap();
        let key = ObjectKey::new("raw-data", "orders", "orders.csv");

        let v1 = s.upload(&key, b"a\n1\n".to_vec(), None).await.unwrap();
        let v2 = s.upload(&key, b"a\n2\n".to_vec(), None).await.unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));
        assert_eq!(v2.content_type, "text/csv");

        let (_, latest) = s.download(&key, None).await.unwrap();
        assert_eq!(latest, b"a\n2\n");
        let (_, first) = s.download(&key, Some(1)).await.unwrap();
        assert_eq!(first, b"a\n1\n");
        assert_eq!(s.list_versions(&key).await.unwrap().len(), 2);
        assert_eq!(s.list_objects("raw-data", "orders").await.unwrap().len(), 1);

        s.delete_object(&key).await.unwrap();
        assert!(blobs.is_empty());
        assert_eq!(s.download(&key, None).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(s.delete_object(&key).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_upload_into_missing_folder_writes_nothing() {
        let (s, blobs) = store().await;
        s.create_bucket("raw-data", "us-east-1").await.unwrap();
        let key = ObjectKey::new("raw-data", "nope", "x.csv");
        let err = s.upload(&key, b"x".to_vec(), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_change_set_is_atomic() {
        let (s, blobs) = store().await;
        s.create_bucket("raw-data", "us-east-1").await.unwrap();
        s.create_folder("raw-data", "docs").await.unwrap();
        let mut set = ChangeSet::new();
        set.put(ObjectKey::new("raw-data", "docs", "a.pdf"), b"%PDF".to_vec(), "application/pdf");
        set.put(ObjectKey::new("raw-data", "gone", "a.pdf.vec"), vec![0; 8], "application/octet-stream");
        assert!(s.publish(set).await.is_err());
        assert!(blobs.is_empty());
        assert!(s.list_objects("raw-data", "docs").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_folder_requires_force_when_non_empty() {
        let (s, _) = store().await;
        s.create_bucket("raw-data", "us-east-1").await.unwrap();
        s.create_folder("raw-data", "orders").await.unwrap();
        s.upload(&ObjectKey::new("raw-data", "orders", "o.csv"), b"a\n".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(
            s.delete_folder("raw-data", "orders", false).await.unwrap_err().kind(),
            ErrorKind::Conflict
        );
        s.delete_folder("raw-data", "orders", true).await.unwrap();
        assert!(s.list_folders("raw-data").await.unwrap().is_empty());
    }
}
