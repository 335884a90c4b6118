//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/etl.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:7400"
//!
//! [staging]
//! backend = "filesystem"      # or "s3"
//! root = "./data/staging"
//!
//! [extraction]
//! bucket = "etl-staging"
//!
//! [warehouse]
//! root = "./data/warehouse"
//!
//! [embedding]
//! provider = "hashing"        # or "openai", "disabled"
//! dims = 256
//! ```
//!
//! Every section except `[db]` is optional; missing keys take the defaults
//! declared beside each field.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use etl_harness_core::models::{validate_bucket_name, validate_path_segment, STORAGE_ENGINES};
use etl_harness_core::options::ExtractPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7400".to_string()
}
fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct StagingConfig {
    #[serde(default = "default_staging_backend")]
    pub backend: String,
    #[serde(default = "default_staging_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub s3: Option<S3StagingConfig>,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            backend: default_staging_backend(),
            root: default_staging_root(),
            s3: None,
        }
    }
}

fn default_staging_backend() -> String {
    "filesystem".to_string()
}
fn default_staging_root() -> PathBuf {
    PathBuf::from("./data/staging")
}

/// Physical S3 bucket that holds every logical staging bucket as a prefix.
#[derive(Debug, Deserialize, Clone)]
pub struct S3StagingConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub prefix: String,
    /// Custom endpoint (MinIO, LocalStack). Enables path-style addressing.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_extraction_bucket")]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_files_folder")]
    pub files_folder: String,
    #[serde(default)]
    pub on_table_error: ExtractPolicy,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            bucket: default_extraction_bucket(),
            region: default_region(),
            files_folder: default_files_folder(),
            on_table_error: ExtractPolicy::default(),
        }
    }
}

fn default_extraction_bucket() -> String {
    "etl-staging".to_string()
}
fn default_files_folder() -> String {
    "files".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WarehouseConfig {
    #[serde(default = "default_warehouse_root")]
    pub root: PathBuf,
    #[serde(default = "default_storage_engine")]
    pub default_storage_engine: String,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            root: default_warehouse_root(),
            default_storage_engine: default_storage_engine(),
            query_timeout_ms: default_query_timeout_ms(),
            max_result_rows: default_max_result_rows(),
        }
    }
}

fn default_warehouse_root() -> PathBuf {
    PathBuf::from("./data/warehouse")
}
fn default_storage_engine() -> String {
    "columnstore".to_string()
}
fn default_query_timeout_ms() -> u64 {
    30_000
}
fn default_max_result_rows() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoadConfig {
    #[serde(default = "default_load_batch_size")]
    pub batch_size: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            batch_size: default_load_batch_size(),
        }
    }
}

fn default_load_batch_size() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            max_tokens: default_max_tokens(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_max_tokens() -> usize {
    700
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    from_toml_str(&content)
}

/// Parse and validate configuration text.
pub fn from_toml_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.server.max_body_bytes == 0 {
        anyhow::bail!("server.max_body_bytes must be > 0");
    }

    match config.staging.backend.as_str() {
        "filesystem" => {}
        "s3" => {
            if config.staging.s3.is_none() {
                anyhow::bail!("staging.s3 must be set when staging.backend is 's3'");
            }
        }
        other => anyhow::bail!(
            "Unknown staging backend: '{}'. Must be filesystem or s3.",
            other
        ),
    }

    validate_bucket_name(&config.extraction.bucket)
        .map_err(|e| anyhow::anyhow!("extraction.bucket: {}", e))?;
    validate_path_segment("folder", &config.extraction.files_folder)
        .map_err(|e| anyhow::anyhow!("extraction.files_folder: {}", e))?;

    if !STORAGE_ENGINES.contains(&config.warehouse.default_storage_engine.as_str()) {
        anyhow::bail!(
            "warehouse.default_storage_engine must be one of: {}",
            STORAGE_ENGINES.join(", ")
        );
    }
    if config.warehouse.query_timeout_ms == 0 {
        anyhow::bail!("warehouse.query_timeout_ms must be > 0");
    }
    if config.warehouse.max_result_rows == 0 {
        anyhow::bail!("warehouse.max_result_rows must be >= 1");
    }
    if config.load.batch_size == 0 {
        anyhow::bail!("load.batch_size must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims == 0 {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.max_tokens == 0 {
            anyhow::bail!("embedding.max_tokens must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hashing" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hashing, or openai.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = from_toml_str("[db]\npath = \"./x.sqlite\"\n").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:7400");
        assert_eq!(config.staging.backend, "filesystem");
        assert_eq!(config.extraction.bucket, "etl-staging");
        assert_eq!(config.extraction.on_table_error, ExtractPolicy::Continue);
        assert_eq!(config.warehouse.default_storage_engine, "columnstore");
        assert_eq!(config.embedding.provider, "hashing");
        assert_eq!(config.embedding.dims, 256);
    }

    #[test]
    fn rejects_bad_values() {
        for body in [
            "[staging]\nbackend = \"ftp\"",
            "[staging]\nbackend = \"s3\"",
            "[extraction]\nbucket = \"Bad_Bucket\"",
            "[warehouse]\ndefault_storage_engine = \"rocksdb\"",
            "[load]\nbatch_size = 0",
            "[embedding]\nprovider = \"openai\"",
            "[embedding]\nprovider = \"local\"",
            "[extraction]\non_table_error = \"retry\"",
        ] {
            let text = format!("[db]\npath = \"x.sqlite\"\n{}\n", body);
            assert!(from_toml_str(&text).is_err(), "accepted: {}", body);
        }
    }

    #[test]
    fn s3_staging_section() {
        let config = from_toml_str(
            "[db]\npath = \"x.sqlite\"\n[staging]\nbackend = \"s3\"\n[staging.s3]\nbucket = \"lake\"\nendpoint_url = \"http://localhost:9000\"\n",
        )
        .unwrap();
        let s3 = config.staging.s3.unwrap();
        assert_eq!(s3.region, "us-east-1");
        assert_eq!(s3.endpoint_url.as_deref(), Some("http://localhost:9000"));
    }
}
