//! Request option blocks: load flags, query options, transform options and
//! the extraction failure policy.
//!
//! Each block is accepted either as a JSON object or as a legacy flag
//! string of whitespace-separated `key=value` pairs and bare switches, for
//! example `mode=bulk batch_size=500 -s ';' no_header`. Both forms are
//! normalized into one JSON object and then deserialized, so unknown keys
//! fail `InvalidParams` the same way in either form.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EtlError, Result};
use crate::frame::CsvOptions;

/// What an extraction over many tables does after a table fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractPolicy {
    #[default]
    Continue,
    Stop,
}

impl ExtractPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(ExtractPolicy::Continue),
            "stop" | "abort" => Ok(ExtractPolicy::Stop),
            other => Err(EtlError::invalid(format!(
                "unknown failure policy '{}'; expected continue or stop",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// One transaction; a failure keeps nothing.
    #[default]
    Atomic,
    /// Commit every batch; a failure keeps the committed batches.
    Bulk,
}

impl LoadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMode::Atomic => "atomic",
            LoadMode::Bulk => "bulk",
        }
    }
}

/// Parsed flags for a table load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFlags {
    pub mode: LoadMode,
    /// Rows per committed batch in bulk mode; `None` uses the configured default.
    pub batch_size: Option<usize>,
    pub delimiter: u8,
    pub has_header: bool,
}

impl Default for LoadFlags {
    fn default() -> Self {
        Self {
            mode: LoadMode::Atomic,
            batch_size: None,
            delimiter: b',',
            has_header: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawLoadFlags {
    mode: Option<LoadMode>,
    batch_size: Option<usize>,
    delimiter: Option<String>,
    has_header: Option<bool>,
}

impl LoadFlags {
    pub fn from_value(value: &Value) -> Result<Self> {
        let raw: RawLoadFlags = decode("load flags", value)?;
        if raw.batch_size == Some(0) {
            return Err(EtlError::invalid("batch_size must be at least 1"));
        }
        let delimiter = match raw.delimiter.as_deref() {
            None => b',',
            Some(d) => parse_delimiter(d)?,
        };
        Ok(Self {
            mode: raw.mode.unwrap_or_default(),
            batch_size: raw.batch_size,
            delimiter,
            has_header: raw.has_header.unwrap_or(true),
        })
    }

    pub fn csv_options(&self) -> CsvOptions {
        CsvOptions {
            delimiter: self.delimiter,
            has_header: self.has_header,
        }
    }
}

fn parse_delimiter(d: &str) -> Result<u8> {
    match d {
        "\\t" | "\t" | "tab" => Ok(b'\t'),
        _ if d.len() == 1 && d.is_ascii() && d != "\"" && d != "\n" => Ok(d.as_bytes()[0]),
        _ => Err(EtlError::invalid(format!(
            "delimiter '{}' must be a single ASCII character",
            d
        ))),
    }
}

/// Options for a warehouse query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryOptions {
    pub timeout_ms: Option<u64>,
    pub max_rows: Option<usize>,
}

impl QueryOptions {
    pub fn from_value(value: &Value) -> Result<Self> {
        decode("query options", value)
    }
}

/// Options for a relational transform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransformOptions {
    /// Report the tables that would change without publishing them.
    pub dry_run: bool,
}

impl TransformOptions {
    pub fn from_value(value: &Value) -> Result<Self> {
        decode("transform options", value)
    }
}

fn decode<T: DeserializeOwned>(what: &str, value: &Value) -> Result<T> {
    let object = match value {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        Value::String(s) => parse_flag_string(s)?,
        other => {
            return Err(EtlError::invalid(format!(
                "{} must be an object or a flag string, got {}",
                what, other
            )))
        }
    };
    serde_json::from_value(Value::Object(object))
        .map_err(|e| EtlError::invalid(format!("{}: {}", what, e)))
}

/// Normalize a legacy flag string into a JSON object.
pub fn parse_flag_string(s: &str) -> Result<Map<String, Value>> {
    let tokens = tokenize(s)?;
    let mut out = Map::new();
    let mut iter = tokens.into_iter();
    while let Some(token) = iter.next() {
        match token.as_str() {
            "-s" | "-b" => {
                let key = if token == "-s" { "delimiter" } else { "batch_size" };
                let value = iter
                    .next()
                    .ok_or_else(|| EtlError::invalid(format!("flag {} needs a value", token)))?;
                out.insert(key.to_string(), scalar(key, &value));
            }
            "no_header" | "noheader" => {
                out.insert("has_header".to_string(), Value::Bool(false));
            }
            _ => match token.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    out.insert(key.to_string(), scalar(key, value));
                }
                _ => {
                    out.insert(token, Value::Bool(true));
                }
            },
        }
    }
    Ok(out)
}

/// Infer a JSON scalar. Delimiters always stay strings.
fn scalar(key: &str, raw: &str) -> Value {
    if key == "delimiter" {
        return Value::String(raw.to_string());
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => raw
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

/// Split on whitespace, honoring single and double quotes.
fn tokenize(s: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;
    for c in s.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if quote.is_some() {
        return Err(EtlError::invalid(format!("unterminated quote in '{}'", s)));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}
