//! Tabular transformation descriptors.
//!
//! A [`TabularOp`] is a tagged, strongly-typed operation applied to one
//! staged [`Frame`]. Requests name an operation and pass parameters either
//! as a typed JSON object or in the legacy string form; both are turned
//! into a `TabularOp` by [`TabularOp::from_parts`] and validated against the
//! frame before anything is written.
//!
//! | Op | Typed params | Legacy params |
//! |----|--------------|---------------|
//! | `drop` | `{"columns": ["a","b"]}` | `"a,b"` |
//! | `select` | `{"columns": ["a","b"]}` | `"a,b"` |
//! | `rename` | `{"mapping": {"a": "x"}}` | `"a:x,b:y"` |
//! | `filter` | `{"column": "p", "cmp": "ge", "value": 10}` | `"p>=10"`, `"name is null"` |
//! | `sort` | `{"column": "p", "descending": true}` | `"p desc"` |
//! | `dedup` | `{"columns": ["a"]}` or `{}` | `"a"` or `""` |
//! | `fill_null` | `{"column": "p", "value": 0}` | `"p=0"` |
//! | `head` | `{"n": 10}` | `"10"` |

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EtlError, Result};
use crate::frame::{Cell, Frame};

/// Row predicate comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    #[serde(alias = "==", alias = "=")]
    Eq,
    #[serde(alias = "!=")]
    Ne,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Le,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Ge,
    Contains,
    IsNull,
    NotNull,
}

impl Comparison {
    fn needs_value(&self) -> bool {
        !matches!(self, Comparison::IsNull | Comparison::NotNull)
    }

    fn matches(&self, cell: &Cell, value: &Cell) -> bool {
        match self {
            Comparison::IsNull => cell.is_null(),
            Comparison::NotNull => !cell.is_null(),
            Comparison::Contains => !cell.is_null() && cell.render().contains(&value.render()),
            _ if cell.is_null() || !same_family(cell, value) => matches!(self, Comparison::Ne),
            Comparison::Eq => cell.compare(value) == Ordering::Equal,
            Comparison::Ne => cell.compare(value) != Ordering::Equal,
            Comparison::Lt => cell.compare(value) == Ordering::Less,
            Comparison::Le => cell.compare(value) != Ordering::Greater,
            Comparison::Gt => cell.compare(value) == Ordering::Greater,
            Comparison::Ge => cell.compare(value) != Ordering::Less,
        }
    }
}

fn same_family(a: &Cell, b: &Cell) -> bool {
    match (a.numeric(), b.numeric()) {
        (Some(_), Some(_)) => true,
        (None, None) => matches!((a, b), (Cell::Text(_), Cell::Text(_))),
        _ => false,
    }
}

/// One tabular transformation with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum TabularOp {
    Drop {
        columns: Vec<String>,
    },
    Select {
        columns: Vec<String>,
    },
    Rename {
        mapping: BTreeMap<String, String>,
    },
    Filter {
        column: String,
        cmp: Comparison,
        #[serde(default)]
        value: Option<Value>,
    },
    Sort {
        column: String,
        #[serde(default)]
        descending: bool,
    },
    Dedup {
        #[serde(default)]
        columns: Vec<String>,
    },
    FillNull {
        column: String,
        value: Value,
    },
    Head {
        n: usize,
    },
}

/// Canonical op name for a requested name, accepting common aliases.
fn canonical_op(op: &str) -> Option<&'static str> {
    let normalized = op.trim().to_ascii_lowercase().replace('-', "_");
    Some(match normalized.as_str() {
        "drop" | "drop_column" | "drop_columns" => "drop",
        "select" | "select_columns" | "project" => "select",
        "rename" | "rename_column" | "rename_columns" => "rename",
        "filter" | "where" => "filter",
        "sort" | "sort_values" | "order_by" => "sort",
        "dedup" | "drop_duplicates" | "distinct" => "dedup",
        "fill_null" | "fillna" | "fill_na" => "fill_null",
        "head" | "limit" => "head",
        _ => return None,
    })
}

impl TabularOp {
    /// Build an operation from a request's `op` name and `params`.
    ///
    /// Unknown names fail `UnsupportedOperation`; parameters that do not fit
    /// the operation fail `InvalidParams`.
    pub fn from_parts(op: &str, params: &Value) -> Result<Self> {
        let name = canonical_op(op)
            .ok_or_else(|| EtlError::UnsupportedOperation(format!("unknown operation '{}'", op)))?;

        let parsed = match params {
            Value::Object(map) => {
                let mut tagged = map.clone();
                tagged.insert("op".to_string(), Value::String(name.to_string()));
                serde_json::from_value(Value::Object(tagged))
                    .map_err(|e| EtlError::invalid(format!("params for '{}': {}", name, e)))?
            }
            Value::String(s) => parse_legacy(name, s)?,
            Value::Null => parse_legacy(name, "")?,
            Value::Array(items) if matches!(name, "drop" | "select" | "dedup") => {
                let columns = items
                    .iter()
                    .map(|v| {
                        v.as_str().map(str::to_string).ok_or_else(|| {
                            EtlError::invalid(format!("'{}' expects a list of column names", name))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                columns_op(name, columns)
            }
            Value::Number(n) if name == "head" => TabularOp::Head {
                n: n
                    .as_u64()
                    .ok_or_else(|| EtlError::invalid("'head' expects a non-negative integer"))?
                    as usize,
            },
            other => {
                return Err(EtlError::invalid(format!(
                    "params for '{}' cannot be {}",
                    name, other
                )))
            }
        };
        parsed.check_shape()?;
        Ok(parsed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TabularOp::Drop { .. } => "drop",
            TabularOp::Select { .. } => "select",
            TabularOp::Rename { .. } => "rename",
            TabularOp::Filter { .. } => "filter",
            TabularOp::Sort { .. } => "sort",
            TabularOp::Dedup { .. } => "dedup",
            TabularOp::FillNull { .. } => "fill_null",
            TabularOp::Head { .. } => "head",
        }
    }

    /// Frame-independent parameter checks.
    fn check_shape(&self) -> Result<()> {
        match self {
            TabularOp::Drop { columns } | TabularOp::Select { columns } if columns.is_empty() => {
                Err(EtlError::invalid(format!("'{}' needs at least one column", self.name())))
            }
            TabularOp::Rename { mapping } if mapping.is_empty() => {
                Err(EtlError::invalid("'rename' needs at least one old:new pair"))
            }
            TabularOp::Rename { mapping } if mapping.values().any(|v| v.trim().is_empty()) => {
                Err(EtlError::invalid("'rename' target names must not be empty"))
            }
            TabularOp::Filter { cmp, value, .. } if cmp.needs_value() && value.is_none() => {
                Err(EtlError::invalid("'filter' comparison needs a value"))
            }
            _ => Ok(()),
        }
    }

    /// Apply the operation, returning a new frame. The input is not modified.
    pub fn apply(&self, frame: &Frame) -> Result<Frame> {
        match self {
            TabularOp::Drop { columns } => {
                let mut drop = HashSet::new();
                for c in columns {
                    drop.insert(frame.require_column(c)?);
                }
                if drop.len() == frame.columns.len() {
                    return Err(EtlError::invalid("cannot drop every column"));
                }
                let keep: Vec<usize> = (0..frame.columns.len()).filter(|i| !drop.contains(i)).collect();
                Ok(project(frame, &keep))
            }
            TabularOp::Select { columns } => {
                let mut seen = HashSet::new();
                let mut keep = Vec::with_capacity(columns.len());
                for c in columns {
                    if !seen.insert(c.as_str()) {
                        return Err(EtlError::invalid(format!("column '{}' selected twice", c)));
                    }
                    keep.push(frame.require_column(c)?);
                }
                Ok(project(frame, &keep))
            }
            TabularOp::Rename { mapping } => {
                for old in mapping.keys() {
                    frame.require_column(old)?;
                }
                let columns: Vec<String> = frame
                    .columns
                    .iter()
                    .map(|c| mapping.get(c).map(|n| n.trim().to_string()).unwrap_or_else(|| c.clone()))
                    .collect();
                let mut seen = HashSet::new();
                if let Some(dup) = columns.iter().find(|c| !seen.insert(c.as_str())) {
                    return Err(EtlError::invalid(format!(
                        "rename would produce duplicate column '{}'",
                        dup
                    )));
                }
                Frame::new(columns, frame.rows.clone())
            }
            TabularOp::Filter { column, cmp, value } => {
                let idx = frame.require_column(column)?;
                let target = match value {
                    Some(v) => Cell::from_json(v)?,
                    None => Cell::Null,
                };
                let rows = frame
                    .rows
                    .iter()
                    .filter(|r| cmp.matches(&r[idx], &target))
                    .cloned()
                    .collect();
                Frame::new(frame.columns.clone(), rows)
            }
            TabularOp::Sort { column, descending } => {
                let idx = frame.require_column(column)?;
                let mut rows = frame.rows.clone();
                if *descending {
                    rows.sort_by(|a, b| b[idx].compare(&a[idx]));
                } else {
                    rows.sort_by(|a, b| a[idx].compare(&b[idx]));
                }
                Frame::new(frame.columns.clone(), rows)
            }
            TabularOp::Dedup { columns } => {
                let keys: Vec<usize> = if columns.is_empty() {
                    (0..frame.columns.len()).collect()
                } else {
                    columns
                        .iter()
                        .map(|c| frame.require_column(c))
                        .collect::<Result<_>>()?
                };
                let mut seen = HashSet::new();
                let rows = frame
                    .rows
                    .iter()
                    .filter(|r| seen.insert(keys.iter().map(|&i| r[i].dedup_key()).collect::<Vec<_>>()))
                    .cloned()
                    .collect();
                Frame::new(frame.columns.clone(), rows)
            }
            TabularOp::FillNull { column, value } => {
                let idx = frame.require_column(column)?;
                let fill = Cell::from_json(value)?;
                let rows = frame
                    .rows
                    .iter()
                    .map(|r| {
                        let mut r = r.clone();
                        if r[idx].is_null() {
                            r[idx] = fill.clone();
                        }
                        r
                    })
                    .collect();
                Frame::new(frame.columns.clone(), rows)
            }
            TabularOp::Head { n } => {
                Frame::new(frame.columns.clone(), frame.rows.iter().take(*n).cloned().collect())
            }
        }
    }
}

fn project(frame: &Frame, keep: &[usize]) -> Frame {
    Frame {
        columns: keep.iter().map(|&i| frame.columns[i].clone()).collect(),
        rows: frame
            .rows
            .iter()
            .map(|r| keep.iter().map(|&i| r[i].clone()).collect())
            .collect(),
    }
}

fn columns_op(name: &str, columns: Vec<String>) -> TabularOp {
    match name {
        "drop" => TabularOp::Drop { columns },
        "select" => TabularOp::Select { columns },
        _ => TabularOp::Dedup { columns },
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse the legacy string parameter form for an already-canonical op.
fn parse_legacy(name: &str, raw: &str) -> Result<TabularOp> {
    let s = raw.trim();
    match name {
        "drop" | "select" | "dedup" => Ok(columns_op(name, split_list(s))),
        "rename" => {
            let mut mapping = BTreeMap::new();
            for pair in split_list(s) {
                let (old, new) = pair
                    .split_once(':')
                    .filter(|(o, n)| !o.trim().is_empty() && !n.trim().is_empty() && !n.contains(':'))
                    .ok_or_else(|| {
                        EtlError::invalid(format!("rename pair '{}' must be old:new", pair))
                    })?;
                mapping.insert(old.trim().to_string(), new.trim().to_string());
            }
            Ok(TabularOp::Rename { mapping })
        }
        "filter" => parse_filter(s),
        "sort" => {
            let mut parts = s.split_whitespace();
            let column = parts
                .next()
                .ok_or_else(|| EtlError::invalid("'sort' needs a column"))?
                .to_string();
            let descending = match parts.next().map(|d| d.to_ascii_lowercase()) {
                None => false,
                Some(d) if d == "asc" => false,
                Some(d) if d == "desc" => true,
                Some(d) => {
                    return Err(EtlError::invalid(format!(
                        "sort direction '{}' must be asc or desc",
                        d
                    )))
                }
            };
            if parts.next().is_some() {
                return Err(EtlError::invalid("'sort' takes '<column> [asc|desc]'"));
            }
            Ok(TabularOp::Sort { column, descending })
        }
        "fill_null" => {
            let (column, value) = s
                .split_once('=')
                .filter(|(c, _)| !c.trim().is_empty())
                .ok_or_else(|| EtlError::invalid("'fill_null' takes '<column>=<value>'"))?;
            Ok(TabularOp::FillNull {
                column: column.trim().to_string(),
                value: Value::String(value.trim().to_string()),
            })
        }
        "head" => {
            let n = s
                .parse::<usize>()
                .map_err(|_| EtlError::invalid(format!("'head' expects a row count, got '{}'", s)))?;
            Ok(TabularOp::Head { n })
        }
        _ => Err(EtlError::UnsupportedOperation(name.to_string())),
    }
}

fn parse_filter(s: &str) -> Result<TabularOp> {
    let lower = s.to_ascii_lowercase();
    for (suffix, cmp) in [
        (" is not null", Comparison::NotNull),
        (" not null", Comparison::NotNull),
        (" is null", Comparison::IsNull),
    ] {
        if lower.ends_with(suffix) {
            let column = s[..s.len() - suffix.len()].trim();
            if !column.is_empty() {
                return Ok(TabularOp::Filter {
                    column: column.to_string(),
                    cmp,
                    value: None,
                });
            }
        }
    }

    if let Some(pos) = lower.find(" contains ") {
        let column = s[..pos].trim();
        let value = s[pos + " contains ".len()..].trim();
        if !column.is_empty() {
            return Ok(TabularOp::Filter {
                column: column.to_string(),
                cmp: Comparison::Contains,
                value: Some(Value::String(unquote(value).to_string())),
            });
        }
    }

    const OPERATORS: [(&str, Comparison); 7] = [
        (">=", Comparison::Ge),
        ("<=", Comparison::Le),
        ("!=", Comparison::Ne),
        ("==", Comparison::Eq),
        ("=", Comparison::Eq),
        (">", Comparison::Gt),
        ("<", Comparison::Lt),
    ];
    for (symbol, cmp) in OPERATORS {
        if let Some(pos) = s.find(symbol) {
            let column = s[..pos].trim();
            let value = s[pos + symbol.len()..].trim();
            if column.is_empty() || value.is_empty() {
                break;
            }
            return Ok(TabularOp::Filter {
                column: column.to_string(),
                cmp,
                value: Some(Value::String(unquote(value).to_string())),
            });
        }
    }
    Err(EtlError::invalid(format!(
        "filter '{}' must look like '<column><op><value>'",
        s
    )))
}

fn unquote(s: &str) -> &str {
    let quoted = s.len() >= 2
        && ((s.starts_with('\'') && s.ends_with('\'')) || (s.starts_with('"') && s.ends_with('"')));
    if quoted {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::frame::CsvOptions;
    use serde_json::json;

    fn frame() -> Frame {
        Frame::from_csv(
            b"id,name,price\n1,apple,1.5\n2,pear,\n3,apple,10\n4,fig,7.25\n",
            &CsvOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn unknown_op_is_unsupported() {
        let err = TabularOp::from_parts("explode", &json!("a")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }

    #[test]
    fn legacy_and_typed_forms_agree() {
        let legacy = TabularOp::from_parts("drop_column", &json!("name, price")).unwrap();
        let typed = TabularOp::from_parts("drop", &json!({"columns": ["name", "price"]})).unwrap();
        let list = TabularOp::from_parts("drop", &json!(["name", "price"])).unwrap();
        assert_eq!(legacy, typed);
        assert_eq!(legacy, list);
    }

    #[test]
    fn bad_params_are_invalid() {
        for (op, params) in [
            ("drop", json!("")),
            ("rename", json!("a-b")),
            ("head", json!("ten")),
            ("sort", json!("price sideways")),
            ("filter", json!("price")),
            ("filter", json!({"column": "price", "cmp": "gt"})),
            ("drop", json!({"cols": ["a"]})),
            ("head", json!(true)),
        ] {
            let err = TabularOp::from_parts(op, &params).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParams, "{} {}", op, params);
        }
    }

    #[test]
    fn unknown_column_is_invalid_params() {
        let op = TabularOp::from_parts("drop", &json!("missing")).unwrap();
        assert_eq!(op.apply(&frame()).unwrap_err().kind(), ErrorKind::InvalidParams);
    }

    #[test]
    fn drop_select_rename() {
        let f = frame();
        let dropped = TabularOp::from_parts("drop", &json!("price")).unwrap().apply(&f).unwrap();
        assert_eq!(dropped.columns, vec!["id", "name"]);

        let selected = TabularOp::from_parts("select", &json!("price,id")).unwrap().apply(&f).unwrap();
        assert_eq!(selected.columns, vec!["price", "id"]);
        assert_eq!(selected.rows[0], vec![Cell::Float(1.5), Cell::Int(1)]);

        let renamed = TabularOp::from_parts("rename", &json!("name:fruit")).unwrap().apply(&f).unwrap();
        assert_eq!(renamed.columns, vec!["id", "fruit", "price"]);

        let clash = TabularOp::from_parts("rename", &json!("name:id")).unwrap();
        assert_eq!(clash.apply(&f).unwrap_err().kind(), ErrorKind::InvalidParams);

        let all = TabularOp::from_parts("drop", &json!("id,name,price")).unwrap();
        assert_eq!(all.apply(&f).unwrap_err().kind(), ErrorKind::InvalidParams);
    }

    #[test]
    fn filter_variants() {
        let f = frame();
        let ge = TabularOp::from_parts("filter", &json!("price>=7")).unwrap().apply(&f).unwrap();
        assert_eq!(ge.num_rows(), 2);

        let eq = TabularOp::from_parts("filter", &json!("name = 'apple'")).unwrap().apply(&f).unwrap();
        assert_eq!(eq.num_rows(), 2);

        let null = TabularOp::from_parts("filter", &json!("price is null")).unwrap().apply(&f).unwrap();
        assert_eq!(null.rows[0][1], Cell::Text("pear".into()));

        let not_null = TabularOp::from_parts("filter", &json!("price is not null")).unwrap().apply(&f).unwrap();
        assert_eq!(not_null.num_rows(), 3);

        let typed = TabularOp::from_parts("filter", &json!({"column": "id", "cmp": "<", "value": 3}))
            .unwrap()
            .apply(&f)
            .unwrap();
        assert_eq!(typed.num_rows(), 2);

        let contains = TabularOp::from_parts("filter", &json!("name contains pp")).unwrap().apply(&f).unwrap();
        assert_eq!(contains.num_rows(), 2);
    }

    #[test]
    fn sort_dedup_fill_head() {
        let f = frame();
        let sorted = TabularOp::from_parts("sort", &json!("price desc")).unwrap().apply(&f).unwrap();
        assert_eq!(sorted.rows[0][0], Cell::Int(3));
        assert_eq!(sorted.rows[3][0], Cell::Int(2));

        let dedup = TabularOp::from_parts("drop_duplicates", &json!("name")).unwrap().apply(&f).unwrap();
        assert_eq!(dedup.num_rows(), 3);
        let all = TabularOp::from_parts("dedup", &Value::Null).unwrap().apply(&f).unwrap();
        assert_eq!(all.num_rows(), 4);

        let filled = TabularOp::from_parts("fillna", &json!("price=0")).unwrap().apply(&f).unwrap();
        assert_eq!(filled.rows[1][2], Cell::Int(0));

        let head = TabularOp::from_parts("head", &json!(2)).unwrap().apply(&f).unwrap();
        assert_eq!(head.num_rows(), 2);
        assert_eq!(f.num_rows(), 4);
    }

    #[test]
    fn numeric_text_sorts_and_filters_as_numbers() {
        let f = Frame::from_csv(b"sku,price\na,2.50\nb,10\nc,+5\n", &CsvOptions::default()).unwrap();
        let sorted = TabularOp::from_parts("sort", &json!("price")).unwrap().apply(&f).unwrap();
        let skus: Vec<String> = sorted.rows.iter().map(|r| r[0].render()).collect();
        assert_eq!(skus, vec!["a", "c", "b"]);
        assert_eq!(sorted.to_csv().unwrap(), b"sku,price\na,2.50\nc,+5\nb,10\n".to_vec());

        let cheap = TabularOp::from_parts("filter", &json!("price<6")).unwrap().apply(&f).unwrap();
        assert_eq!(cheap.num_rows(), 2);
    }
}
