//! Extraction: source databases and uploaded files into the staging store.
//!
//! # Database extraction
//!
//! Tables are read through a [`SourceConnector`] and staged as CSV under
//! `<extraction.bucket>/<server>.<database>/<table>.csv`. Extracting a whole
//! database is a multi-item operation: with [`ExtractPolicy::Continue`]
//! every table is attempted, with [`ExtractPolicy::Stop`] the first failure
//! ends the run. Any failed, skipped or cancelled table turns the result
//! into `PartialFailure`; tables already staged stay staged.
//!
//! # File extraction
//!
//! | kind | input | staged artifacts |
//! |------|-------|------------------|
//! | `csv` | CSV | `<stem>.csv` |
//! | `excel` | `.xlsx` | `<stem>.csv` (first sheet or `sheet=n`) |
//! | `word` | `.docx` | raw, `.meta.json`, `.vec` |
//! | `pdf` | PDF | raw, `.meta.json`, `.vec` |
//! | `image` | png/jpeg/gif/bmp/webp | raw, `.meta.json` |
//! | `video` | mp4/mov/webm/mkv/avi | raw, `.meta.json` |
//!
//! The artifacts of one file are published as a single change set.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use etl_harness_core::error::{EtlError, ItemOutcome, PartialFailureReport, Result};
use etl_harness_core::frame::Frame;
use etl_harness_core::models::{
    validate_identifier, validate_path_segment, validate_server_name, ObjectInfo, ObjectKey,
};
use etl_harness_core::options::ExtractPolicy;

use crate::config::ExtractionConfig;
use crate::embedding::Embedder;
use crate::extract::{self, MediaInfo};
use crate::jobs::{JobHandle, JobTracker};
use crate::registry::ServerRegistry;
use crate::source::{SourceConnector, SourceDatabase};
use crate::staging::{ChangeSet, StagingStore};

/// Kind of uploaded file, taken from the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Csv,
    Excel,
    Word,
    Pdf,
    Image,
    Video,
}

impl FileKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(FileKind::Csv),
            "excel" | "xlsx" => Ok(FileKind::Excel),
            "word" | "docx" => Ok(FileKind::Word),
            "pdf" => Ok(FileKind::Pdf),
            "image" => Ok(FileKind::Image),
            "video" => Ok(FileKind::Video),
            other => Err(EtlError::UnsupportedOperation(format!(
                "file kind '{}' (expected csv, excel, word, pdf, image or video)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Csv => "csv",
            FileKind::Excel => "excel",
            FileKind::Word => "word",
            FileKind::Pdf => "pdf",
            FileKind::Image => "image",
            FileKind::Video => "video",
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, FileKind::Csv | FileKind::Excel)
    }
}

/// Where a file extraction writes, and which sheet to read.
#[derive(Debug, Clone, Default)]
pub struct FileTarget {
    pub bucket: Option<String>,
    pub folder: Option<String>,
    pub sheet: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractedTable {
    pub table: String,
    pub rows: usize,
    pub artifact: ObjectInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseExtraction {
    pub job_id: String,
    pub server: String,
    pub database: String,
    pub tables: Vec<ExtractedTable>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableExtraction {
    pub job_id: String,
    pub server: String,
    pub database: String,
    #[serde(flatten)]
    pub table: ExtractedTable,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileExtraction {
    pub job_id: String,
    pub kind: FileKind,
    pub file_name: String,
    pub artifacts: Vec<ObjectInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_chars: Option<usize>,
}

/// Sidecar stored as `<name>.meta.json` next to an unstructured file.
#[derive(Debug, Clone, Serialize)]
struct FileMeta<'a> {
    kind: FileKind,
    file_name: &'a str,
    content_type: &'a str,
    size: usize,
    sha256: String,
    extracted_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text_chars: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    embedding: Option<EmbeddingMeta<'a>>,
}

#[derive(Debug, Clone, Serialize)]
struct EmbeddingMeta<'a> {
    model: &'a str,
    dims: usize,
    artifact: String,
    encoding: &'static str,
}

/// What a parser produced from an uploaded file.
enum Parsed {
    Table(Frame),
    Text { text: String, content_type: &'static str },
    Media(MediaInfo),
}

#[derive(Clone)]
pub struct Extractor {
    registry: ServerRegistry,
    staging: StagingStore,
    jobs: JobTracker,
    connector: Arc<dyn SourceConnector>,
    embedder: Arc<Embedder>,
    config: ExtractionConfig,
    max_tokens: usize,
}

impl Extractor {
    pub fn new(
        registry: ServerRegistry,
        staging: StagingStore,
        jobs: JobTracker,
        connector: Arc<dyn SourceConnector>,
        embedder: Arc<Embedder>,
        config: ExtractionConfig,
        max_tokens: usize,
    ) -> Self {
        Self {
            registry,
            staging,
            jobs,
            connector,
            embedder,
            config,
            max_tokens,
        }
    }

    /// Folder holding the staged tables of one source database.
    pub fn database_folder(server: &str, database: &str) -> String {
        format!("{}.{}", server, database)
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn ensure_target(&self, bucket: &str, folder: &str) -> Result<()> {
        self.staging.ensure_bucket(bucket, &self.config.region).await?;
        self.staging.ensure_folder(bucket, folder).await
    }

    async fn open_source(&self, server: &str, database: &str) -> Result<Box<dyn SourceDatabase>> {
        validate_server_name(server)?;
        validate_identifier("database", database)?;
        let creds = self.registry.credentials(server).await?;
        self.connector.open(&creds, database).await
    }

    // ============ Databases ============

    /// Stage every table of a source database.
    pub async fn extract_database(
        &self,
        server: &str,
        database: &str,
        policy: Option<ExtractPolicy>,
    ) -> Result<DatabaseExtraction> {
        let policy = policy.unwrap_or(self.config.on_table_error);
        let job = self
            .jobs
            .start("extract_database", &format!("{}/{}", server, database))
            .await?;
        let result = self.run_extract_database(&job, server, database, policy).await;
        job.record(&result).await;
        result
    }

    async fn run_extract_database(
        &self,
        job: &JobHandle,
        server: &str,
        database: &str,
        policy: ExtractPolicy,
    ) -> Result<DatabaseExtraction> {
        let mut source = self.open_source(server, database).await?;
        let tables = source.list_tables().await?;
        let folder = Self::database_folder(server, database);
        self.ensure_target(&self.config.bucket, &folder).await?;
        info!(server, database, tables = tables.len(), policy = ?policy, "extracting database");

        let mut items = Vec::with_capacity(tables.len());
        let mut extracted = Vec::new();
        let mut cancelled = false;
        let mut stopped = false;
        for table in &tables {
            if stopped || job.is_cancelled() {
                cancelled |= job.is_cancelled();
                items.push(ItemOutcome::not_attempted(table));
                continue;
            }
            match self.stage_table(source.as_mut(), &folder, table).await {
                Ok(done) => {
                    items.push(ItemOutcome::succeeded(table, done.artifact.key().to_string()));
                    extracted.push(done);
                }
                Err(e) => {
                    warn!(server, database, table = %table, error = %e, "table extraction failed");
                    items.push(ItemOutcome::failed(table, &e));
                    stopped = policy == ExtractPolicy::Stop;
                }
            }
        }

        if items.iter().all(|i| i.is_success()) {
            Ok(DatabaseExtraction {
                job_id: job.id().to_string(),
                server: server.to_string(),
                database: database.to_string(),
                tables: extracted,
            })
        } else {
            Err(EtlError::PartialFailure(PartialFailureReport {
                operation: "extract_database".to_string(),
                job_id: Some(job.id().to_string()),
                cancelled,
                items,
            }))
        }
    }

    /// Stage one source table. `NotFound` if the source has no such table.
    pub async fn extract_table(&self, server: &str, database: &str, table: &str) -> Result<TableExtraction> {
        let job = self
            .jobs
            .start("extract_table", &format!("{}/{}/{}", server, database, table))
            .await?;
        let result = self.run_extract_table(&job, server, database, table).await;
        job.record(&result).await;
        result
    }

    async fn run_extract_table(
        &self,
        job: &JobHandle,
        server: &str,
        database: &str,
        table: &str,
    ) -> Result<TableExtraction> {
        let mut source = self.open_source(server, database).await?;
        if !source.table_exists(table).await? {
            return Err(EtlError::not_found(format!(
                "table '{}' in {}/{}",
                table, server, database
            )));
        }
        let folder = Self::database_folder(server, database);
        self.ensure_target(&self.config.bucket, &folder).await?;
        job.check_cancelled()?;
        let done = self.stage_table(source.as_mut(), &folder, table).await?;
        Ok(TableExtraction {
            job_id: job.id().to_string(),
            server: server.to_string(),
            database: database.to_string(),
            table: done,
        })
    }

    async fn stage_table(
        &self,
        source: &mut dyn SourceDatabase,
        folder: &str,
        table: &str,
    ) -> Result<ExtractedTable> {
        let key = ObjectKey::new(&self.config.bucket, folder, format!("{}.csv", table));
        key.validate()?;
        let frame = source.read_table(table).await?;
        let csv = frame.to_csv()?;
        let _guard = self.staging.locks().acquire(&key.lock_key()).await;
        let mut set = ChangeSet::new();
        set.put(key, csv, "text/csv");
        let artifact = self
            .staging
            .publish(set)
            .await?
            .pop()
            .ok_or_else(|| EtlError::internal("table publication returned nothing"))?;
        info!(table, rows = frame.num_rows(), object = %artifact.key(), "table staged");
        Ok(ExtractedTable {
            table: table.to_string(),
            rows: frame.num_rows(),
            artifact,
        })
    }

    // ============ Files ============

    /// Parse an uploaded file and stage its artifacts.
    pub async fn extract_file(
        &self,
        kind: FileKind,
        file_name: &str,
        bytes: Vec<u8>,
        target: FileTarget,
    ) -> Result<FileExtraction> {
        validate_path_segment("object", file_name)?;
        reject_legacy_format(kind, file_name)?;
        let bucket = target.bucket.clone().unwrap_or_else(|| self.config.bucket.clone());
        let folder = target
            .folder
            .clone()
            .unwrap_or_else(|| self.config.files_folder.clone());
        let job = self
            .jobs
            .start("extract_file", &format!("{}/{}/{}", bucket, folder, file_name))
            .await?;
        let result = self
            .run_extract_file(&job, kind, file_name, bytes, &bucket, &folder, target.sheet)
            .await;
        job.record(&result).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_extract_file(
        &self,
        job: &JobHandle,
        kind: FileKind,
        file_name: &str,
        bytes: Vec<u8>,
        bucket: &str,
        folder: &str,
        sheet: Option<usize>,
    ) -> Result<FileExtraction> {
        let bytes = Arc::new(bytes);
        let parsed = {
            let bytes = bytes.clone();
            tokio::task::spawn_blocking(move || parse_file(kind, &bytes, sheet))
                .await
                .map_err(|e| EtlError::malformed(format!("{} parser failed: {}", kind.as_str(), e)))??
        };

        self.ensure_target(bucket, folder).await?;
        let mut out = FileExtraction {
            job_id: job.id().to_string(),
            kind,
            file_name: file_name.to_string(),
            artifacts: Vec::new(),
            columns: None,
            rows: None,
            media: None,
            text_chars: None,
        };

        let mut set = ChangeSet::new();
        match parsed {
            Parsed::Table(frame) => {
                let key = ObjectKey::new(bucket, folder, format!("{}.csv", file_stem(file_name)));
                key.validate()?;
                out.columns = Some(frame.columns.clone());
                out.rows = Some(frame.num_rows());
                set.put(key, frame.to_csv()?, "text/csv");
            }
            Parsed::Text { text, content_type } => {
                let vector = self.embedder.embed_document(&text, self.max_tokens).await?;
                let raw_key = ObjectKey::new(bucket, folder, file_name);
                let vec_key = ObjectKey::new(bucket, folder, format!("{}.vec", file_name));
                let meta = FileMeta {
                    kind,
                    file_name,
                    content_type,
                    size: bytes.len(),
                    sha256: sha256_hex(&bytes),
                    extracted_at: crate::db::now_iso(),
                    width: None,
                    height: None,
                    text_chars: Some(text.chars().count()),
                    embedding: vector.as_ref().map(|v| EmbeddingMeta {
                        model: self.embedder.model_name(),
                        dims: v.len(),
                        artifact: vec_key.object.clone(),
                        encoding: "f32le",
                    }),
                };
                out.text_chars = meta.text_chars;
                self.put_with_meta(&mut set, raw_key, &bytes, content_type, &meta)?;
                if let Some(v) = vector {
                    vec_key.validate()?;
                    set.put(
                        vec_key,
                        etl_harness_core::embedding::vec_to_blob(&v),
                        "application/octet-stream",
                    );
                }
            }
            Parsed::Media(media) => {
                let raw_key = ObjectKey::new(bucket, folder, file_name);
                let meta = FileMeta {
                    kind,
                    file_name,
                    content_type: media.content_type,
                    size: bytes.len(),
                    sha256: sha256_hex(&bytes),
                    extracted_at: crate::db::now_iso(),
                    width: media.width,
                    height: media.height,
                    text_chars: None,
                    embedding: None,
                };
                self.put_with_meta(&mut set, raw_key, &bytes, media.content_type, &meta)?;
                out.media = Some(media);
            }
        }

        let keys: Vec<String> = set
            .changes
            .iter()
            .filter_map(|c| match c {
                crate::staging::Change::Put { key, .. } => Some(key.lock_key()),
                crate::staging::Change::Remove { .. } => None,
            })
            .collect();
        let _locks = self.staging.locks().acquire_many(keys).await;
        job.check_cancelled()?;
        out.artifacts = self.staging.publish(set).await?;
        info!(
            kind = kind.as_str(),
            file = file_name,
            artifacts = out.artifacts.len(),
            "file extracted"
        );
        Ok(out)
    }

    fn put_with_meta(
        &self,
        set: &mut ChangeSet,
        raw_key: ObjectKey,
        bytes: &[u8],
        content_type: &str,
        meta: &FileMeta<'_>,
    ) -> Result<()> {
        let meta_key = ObjectKey::new(
            &raw_key.bucket,
            &raw_key.folder,
            format!("{}.meta.json", raw_key.object),
        );
        raw_key.validate()?;
        meta_key.validate()?;
        let meta_json = serde_json::to_vec_pretty(meta).map_err(EtlError::internal)?;
        set.put(raw_key, bytes.to_vec(), content_type);
        set.put(meta_key, meta_json, "application/json");
        Ok(())
    }
}

fn parse_file(kind: FileKind, bytes: &[u8], sheet: Option<usize>) -> Result<Parsed> {
    Ok(match kind {
        FileKind::Csv => Parsed::Table(extract::csv_frame(bytes)?),
        FileKind::Excel => Parsed::Table(extract::xlsx_frame(bytes, sheet)?),
        FileKind::Word => Parsed::Text {
            text: extract::docx_text(bytes)?,
            content_type: extract::MIME_DOCX,
        },
        FileKind::Pdf => Parsed::Text {
            text: extract::pdf_text(bytes)?,
            content_type: extract::MIME_PDF,
        },
        FileKind::Image => Parsed::Media(extract::sniff_image(bytes)?),
        FileKind::Video => Parsed::Media(extract::sniff_video(bytes)?),
    })
}

/// Legacy binary Office formats are not parsed.
fn reject_legacy_format(kind: FileKind, file_name: &str) -> Result<()> {
    let lower = file_name.to_ascii_lowercase();
    let legacy = match kind {
        FileKind::Excel => lower.ends_with(".xls"),
        FileKind::Word => lower.ends_with(".doc"),
        _ => false,
    };
    if legacy {
        Err(EtlError::UnsupportedOperation(format!(
            "legacy binary format '{}'; convert to .xlsx or .docx",
            file_name
        )))
    } else {
        Ok(())
    }
}

fn file_stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(bytes))
}
