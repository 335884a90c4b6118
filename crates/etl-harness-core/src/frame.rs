//! In-memory tabular frames and their CSV codec.
//!
//! Every tabular artifact in the staging store is a CSV file with a header
//! row. [`Frame::from_csv`] parses one and infers a [`Cell`] type per value;
//! [`Frame::to_csv`] writes it back. Inference rules:
//!
//! | Input | Cell |
//! |-------|------|
//! | empty field | `Null` |
//! | `-?[0-9]+` without a leading zero, fits `i64` | `Int` |
//! | finite decimal / exponent form | `Float` |
//! | anything else | `Text` |
//!
//! A number is only typed when writing it back reproduces the field
//! exactly. Other numeric text (`2.50`, `+5`, `1e3`, integers wider than
//! `i64`) stays `Text`, so columns an operation never touches are written
//! back byte for byte. [`Cell::numeric`] still reads such text as a number
//! for comparisons and schema inference. Floats with an integral value are
//! written with a trailing `.0` so they read back as floats.

use std::cmp::Ordering;

use serde::Serialize;

use crate::error::{EtlError, Result};
use crate::models::{ColumnDef, ColumnType};

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    /// Infer a typed cell from a raw CSV field.
    pub fn infer(raw: &str) -> Cell {
        if raw.is_empty() {
            return Cell::Null;
        }
        match parse_number(raw) {
            Some(cell) if cell.render() == raw => cell,
            _ => Cell::Text(raw.to_string()),
        }
    }

    /// Numeric reading of a cell: itself for `Int` and `Float`, the parsed
    /// value for numeric text kept verbatim.
    pub fn numeric(&self) -> Option<Cell> {
        match self {
            Cell::Int(_) | Cell::Float(_) => Some(self.clone()),
            Cell::Text(s) => parse_number(s),
            Cell::Null => None,
        }
    }

    /// Build a cell from a JSON scalar.
    pub fn from_json(value: &serde_json::Value) -> Result<Cell> {
        match value {
            serde_json::Value::Null => Ok(Cell::Null),
            serde_json::Value::Bool(b) => Ok(Cell::Int(i64::from(*b))),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Cell::Int(i)),
                None => n
                    .as_f64()
                    .map(Cell::Float)
                    .ok_or_else(|| EtlError::invalid(format!("unsupported number {}", n))),
            },
            serde_json::Value::String(s) => Ok(Cell::infer(s)),
            other => Err(EtlError::invalid(format!(
                "expected a scalar value, got {}",
                other
            ))),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Field text as written to CSV.
    pub fn render(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Int(i) => i.to_string(),
            Cell::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{:.1}", f)
                } else {
                    f.to_string()
                }
            }
            Cell::Text(s) => s.clone(),
        }
    }

    /// Total order used by sort and filter: nulls, then numbers (numeric
    /// text included), then text.
    pub fn compare(&self, other: &Cell) -> Ordering {
        match (self, other) {
            (Cell::Null, Cell::Null) => Ordering::Equal,
            (Cell::Null, _) => Ordering::Less,
            (_, Cell::Null) => Ordering::Greater,
            _ => match (self.numeric(), other.numeric()) {
                (Some(Cell::Int(a)), Some(Cell::Int(b))) => a.cmp(&b),
                (Some(a), Some(b)) => {
                    let (x, y) = (as_f64(&a), as_f64(&b));
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => self.render().cmp(&other.render()),
            },
        }
    }

    /// Key that treats equal values as equal regardless of float bits.
    pub(crate) fn dedup_key(&self) -> String {
        match self {
            Cell::Null => "n:".to_string(),
            Cell::Int(i) => format!("i:{}", i),
            Cell::Float(f) => format!("f:{}", f),
            Cell::Text(s) => format!("t:{}", s),
        }
    }
}

/// Parse numeric text. Integer-shaped text that overflows `i64` is not a
/// number: it is usually an identifier.
fn parse_number(raw: &str) -> Option<Cell> {
    let digits = raw.strip_prefix(['-', '+']).unwrap_or(raw);
    if digits.is_empty() {
        return None;
    }
    let has_leading_zero = digits.len() > 1 && digits.starts_with('0') && !digits.starts_with("0.");
    if has_leading_zero {
        return None;
    }
    if digits.bytes().all(|b| b.is_ascii_digit()) {
        return raw.parse::<i64>().ok().map(Cell::Int);
    }
    let numeric_shape = digits.bytes().any(|b| b.is_ascii_digit())
        && digits
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'-' | b'+'));
    if !numeric_shape {
        return None;
    }
    raw.parse::<f64>().ok().filter(|f| f.is_finite()).map(Cell::Float)
}

fn as_f64(cell: &Cell) -> f64 {
    match cell {
        Cell::Int(i) => *i as f64,
        Cell::Float(f) => *f,
        _ => 0.0,
    }
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Parsing options for delimited text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvOptions {
    pub delimiter: u8,
    pub has_header: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
        }
    }
}

/// A rectangular table of typed cells with named columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Frame {
    /// Build a frame, checking column names and row widths.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self> {
        check_columns(&columns)?;
        if let Some((i, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, r)| r.len() != columns.len())
        {
            return Err(EtlError::malformed(format!(
                "row {} has {} fields, expected {}",
                i + 1,
                row.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Index of `name`, or `InvalidParams` naming the available columns.
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name).ok_or_else(|| {
            EtlError::invalid(format!(
                "unknown column '{}' (columns: {})",
                name,
                self.columns.join(", ")
            ))
        })
    }

    /// Parse CSV bytes into a frame.
    pub fn from_csv(bytes: &[u8], opts: &CsvOptions) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(opts.delimiter)
            .has_headers(opts.has_header)
            .from_reader(bytes);

        let mut columns: Vec<String> = if opts.has_header {
            reader
                .headers()?
                .iter()
                .map(|h| h.trim().to_string())
                .collect()
        } else {
            Vec::new()
        };
        if opts.has_header && columns.is_empty() {
            return Err(EtlError::malformed("missing header row"));
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            if columns.is_empty() {
                columns = (1..=record.len()).map(|i| format!("column_{}", i)).collect();
            }
            rows.push(record.iter().map(Cell::infer).collect());
        }
        if columns.is_empty() {
            return Err(EtlError::malformed("input contains no rows"));
        }
        Self::new(columns, rows)
    }

    /// Serialize as comma-delimited CSV with a header row.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(Cell::render))?;
        }
        writer
            .into_inner()
            .map_err(|e| EtlError::internal(format!("csv flush failed: {}", e)))
    }

    /// Narrowest column type covering every non-null value in each column.
    pub fn infer_schema(&self) -> Vec<ColumnDef> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut ty: Option<ColumnType> = None;
                let mut nullable = false;
                for row in &self.rows {
                    if row[i].is_null() {
                        nullable = true;
                        continue;
                    }
                    let cell_ty = match row[i].numeric() {
                        Some(Cell::Int(_)) => ColumnType::Integer,
                        Some(_) => ColumnType::Real,
                        None => ColumnType::Text,
                    };
                    ty = Some(match (ty, cell_ty) {
                        (None, t) => t,
                        (Some(ColumnType::Text), _) | (_, ColumnType::Text) => ColumnType::Text,
                        (Some(ColumnType::Real), _) | (_, ColumnType::Real) => ColumnType::Real,
                        _ => ColumnType::Integer,
                    });
                }
                ColumnDef {
                    name: name.clone(),
                    column_type: ty.unwrap_or(ColumnType::Text),
                    nullable: nullable || self.rows.is_empty(),
                }
            })
            .collect()
    }
}

fn check_columns(columns: &[String]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for c in columns {
        if c.is_empty() {
            return Err(EtlError::malformed("empty column name in header"));
        }
        if !seen.insert(c.as_str()) {
            return Err(EtlError::malformed(format!("duplicate column '{}'", c)));
        }
    }
    Ok(())
}
