use serde_json::Value;
use std::str::FromStr;
use tracing::debug;

use crate::datastore::{RowWrite, WriteOp};
use crate::event::Row;
use crate::Error;

/// How the message key is derived from a row write.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum KeyStrategy {
    /// `schema.table` of the target table
    TableName,
    /// Values of the mapping's key columns
    #[default]
    PrimaryKey,
    /// Values at dotted paths into the row, e.g. `customer.id`
    Fields(Vec<String>),
    None,
}

impl KeyStrategy {
    pub fn extract_key(&self, write: &RowWrite) -> Option<String> {
        match self {
            KeyStrategy::TableName => Some(write.table.to_string()),
            KeyStrategy::PrimaryKey => {
                let parts: Option<Vec<String>> = write.key.values().map(scalar).collect();
                parts.filter(|p| !p.is_empty()).map(|p| p.join(":"))
            }
            KeyStrategy::Fields(paths) => {
                let image = match &write.op {
                    WriteOp::Upsert(row) => row,
                    WriteOp::Delete => &write.key,
                };
                composite_key(image, &write.key, paths)
            }
            KeyStrategy::None => None,
        }
    }
}

impl FromStr for KeyStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "table" | "table_name" => Ok(KeyStrategy::TableName),
            "primary_key" => Ok(KeyStrategy::PrimaryKey),
            "none" => Ok(KeyStrategy::None),
            _ => match s.strip_prefix("fields:") {
                Some(fields) => {
                    let paths: Vec<String> = fields
                        .split(',')
                        .map(str::trim)
                        .filter(|f| !f.is_empty())
                        .map(String::from)
                        .collect();
                    if paths.is_empty() {
                        return Err(Error::Config("key strategy 'fields:' names no field".into()));
                    }
                    Ok(KeyStrategy::Fields(paths))
                }
                None => Err(Error::Config(format!("unknown key strategy '{}'", s))),
            },
        }
    }
}

fn field_value<'a>(record: &'a Row, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

/// Joins the values at `paths`; the key image is consulted when the row
/// lacks a field, so deletes still key by their key columns.
fn composite_key(record: &Row, key: &Row, paths: &[String]) -> Option<String> {
    let mut parts = Vec::with_capacity(paths.len());
    for path in paths {
        let value = field_value(record, path).or_else(|| field_value(key, path));
        match value.and_then(scalar) {
            Some(part) => parts.push(part),
            None => {
                debug!("Missing field '{}' for message key", path);
                return None;
            }
        }
    }
    Some(parts.join(":"))
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
