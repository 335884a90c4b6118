//! Core data models used throughout ETL Harness.
//!
//! These types describe the configuration records, staging catalog entries,
//! and warehouse catalog entries that flow between the registry, the staging
//! store, the extractor, the transformer, and the loader.

use serde::{Deserialize, Serialize};

use crate::error::{EtlError, Result};

// ═══════════════════════════════════════════════════════════════════════
// Server registry
// ═══════════════════════════════════════════════════════════════════════

/// Database driver used to reach a source server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceDriver {
    #[default]
    Mysql,
    Sqlite,
}

impl SourceDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceDriver::Mysql => "mysql",
            SourceDriver::Sqlite => "sqlite",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(SourceDriver::Mysql),
            "sqlite" => Ok(SourceDriver::Sqlite),
            other => Err(EtlError::invalid(format!(
                "unknown driver '{}'; expected mysql or sqlite",
                other
            ))),
        }
    }
}

/// Connection profile for a source database server, including the password.
///
/// Only ever read back by the extractor; API reads use [`ServerInfo`].
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub server_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub driver: SourceDriver,
}

/// Read view of a server profile. The password is write-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerInfo {
    pub server_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub driver: SourceDriver,
    pub created_at: String,
    pub updated_at: String,
}

/// Mutable fields of a server profile. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerUpdate {
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub driver: Option<SourceDriver>,
}

// ═══════════════════════════════════════════════════════════════════════
// Staging catalog
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub bucket_name: String,
    pub region: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Folder {
    pub bucket_name: String,
    pub folder_name: String,
    pub object_count: i64,
    pub created_at: String,
}

/// Bucket metadata plus its folders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketContents {
    #[serde(flatten)]
    pub bucket: Bucket,
    pub folders: Vec<Folder>,
}

/// Address of a staged object: `bucket/folder/object`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectKey {
    pub bucket: String,
    pub folder: String,
    pub object: String,
}

impl ObjectKey {
    pub fn new(
        bucket: impl Into<String>,
        folder: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            folder: folder.into(),
            object: object.into(),
        }
    }

    /// Parse `[s3://]bucket/folder/object`.
    pub fn parse(reference: &str) -> Result<Self> {
        let trimmed = reference.trim();
        let path = trimmed.strip_prefix("s3://").unwrap_or(trimmed);
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(EtlError::invalid(format!(
                "staged file reference '{}' must have the form bucket/folder/object",
                reference
            )));
        }
        let key = Self::new(parts[0], parts[1], parts[2]);
        key.validate()?;
        Ok(key)
    }

    pub fn validate(&self) -> Result<()> {
        validate_bucket_name(&self.bucket)?;
        validate_path_segment("folder", &self.folder)?;
        validate_path_segment("object", &self.object)
    }

    /// Lock key used for single-writer enforcement.
    pub fn lock_key(&self) -> String {
        format!("staging:{}", self)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.bucket, self.folder, self.object)
    }
}

/// Catalog entry for one version of a staged object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectInfo {
    pub bucket: String,
    pub folder: String,
    pub object: String,
    pub version: i64,
    pub size: i64,
    pub content_type: String,
    pub sha256: String,
    pub created_at: String,
}

impl ObjectInfo {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.bucket, &self.folder, &self.object)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Warehouse catalog
// ═══════════════════════════════════════════════════════════════════════

/// Storage engines accepted for warehouse databases. Recorded as metadata.
pub const STORAGE_ENGINES: &[&str] = &["columnstore", "innodb", "aria", "myisam"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarehouseDatabase {
    pub database_name: String,
    pub storage_engine: String,
    pub created_at: String,
}

/// Declared SQL type of a warehouse column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "integer" | "int" | "bigint" => Ok(ColumnType::Integer),
            "real" | "float" | "double" => Ok(ColumnType::Real),
            "text" | "string" | "varchar" => Ok(ColumnType::Text),
            other => Err(EtlError::invalid(format!("unknown column type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarehouseTable {
    pub database_name: String,
    pub table_name: String,
    /// `None` until declared at creation or adopted from the first load.
    pub columns: Option<Vec<ColumnDef>>,
    pub last_load_job: Option<String>,
    pub last_load_status: Option<String>,
    pub created_at: String,
}

// ═══════════════════════════════════════════════════════════════════════
// Name validation
// ═══════════════════════════════════════════════════════════════════════

/// S3 bucket naming: 3-63 chars of `a-z 0-9 . -`, alphanumeric at both ends.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    let ok_len = (3..=63).contains(&name.len());
    let ok_chars = name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.');
    let ok_ends = name
        .bytes()
        .next()
        .zip(name.bytes().last())
        .map(|(a, z)| a.is_ascii_alphanumeric() && z.is_ascii_alphanumeric())
        .unwrap_or(false);
    if ok_len && ok_chars && ok_ends {
        Ok(())
    } else {
        Err(EtlError::invalid(format!("invalid bucket name '{}'", name)))
    }
}

/// Folder and object names: 1-255 chars of `A-Z a-z 0-9 . _ - space`.
pub fn validate_path_segment(kind: &str, name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 255
        && name != "."
        && name != ".."
        && !name.starts_with(' ')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '));
    if ok {
        Ok(())
    } else {
        Err(EtlError::invalid(format!("invalid {} name '{}'", kind, name)))
    }
}

/// Server names: identifier characters plus `-`.
pub fn validate_server_name(name: &str) -> Result<()> {
    validate_ident("server", name, true)
}

/// Source database, warehouse database and table names: plain identifiers.
pub fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    validate_ident(kind, name, false)
}

/// Column names are always quoted in SQL, so any printable header works
/// (`unit price`, `Qty (kg)`): non-blank, at most 128 characters, no
/// control characters.
pub fn validate_column_name(name: &str) -> Result<()> {
    let ok = !name.trim().is_empty() && name.chars().count() <= 128 && !name.chars().any(char::is_control);
    if ok {
        Ok(())
    } else {
        Err(EtlError::invalid(format!("invalid column name '{}'", name.escape_debug())))
    }
}

fn validate_ident(kind: &str, name: &str, allow_dash: bool) -> Result<()> {
    let mut chars = name.chars();
    let ok = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            name.len() <= 128
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || (allow_dash && c == '-'))
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(EtlError::invalid(format!("invalid {} name '{}'", kind, name)))
    }
}
