//! Message envelopes for row writes.

use chrono::Utc;
use serde_json::{json, Value};
use std::str::FromStr;

use crate::datastore::{RowWrite, WriteOp};
use crate::event::{ChangeOperation, Row};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationFormat {
    /// Pretty printed envelope
    Json,
    JsonCompact,
    /// `{"payload": {"before", "after", "op", "source", "ts_ms"}}` with
    /// single-letter operations
    JsonDebezium,
}

impl FromStr for SerializationFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(SerializationFormat::Json),
            "json_compact" => Ok(SerializationFormat::JsonCompact),
            "json_debezium" | "debezium" => Ok(SerializationFormat::JsonDebezium),
            _ => Err(Error::Config(format!("unknown message format '{}'", s))),
        }
    }
}

pub struct JsonSerializer {
    format: SerializationFormat,
}

impl JsonSerializer {
    pub fn new(format: SerializationFormat) -> Self {
        Self { format }
    }

    pub fn serialize(&self, write: &RowWrite) -> Result<String> {
        let ts_ms = Utc::now().timestamp_millis();
        let op = effective_op(write);
        let after = match &write.op {
            WriteOp::Upsert(row) => Some(full_row(write, row)),
            WriteOp::Delete => None,
        };
        let before = (op == ChangeOperation::Delete).then_some(&write.key);

        let value = match self.format {
            SerializationFormat::Json | SerializationFormat::JsonCompact => json!({
                "op": op,
                "table": write.table.to_string(),
                "key": write.key,
                "after": after,
                "sequence": write.sequence.to_string(),
                "ts_ms": ts_ms,
            }),
            SerializationFormat::JsonDebezium => json!({
                "payload": {
                    "before": before,
                    "after": after,
                    "op": debezium_op(op),
                    "ts_ms": ts_ms,
                    "source": {
                        "connector": "cdc-relay",
                        "schema": write.table.schema,
                        "table": write.table.table,
                        "sequence": write.sequence.to_string(),
                    },
                },
            }),
        };

        let encoded = match self.format {
            SerializationFormat::Json => serde_json::to_string_pretty(&value)?,
            _ => serde_json::to_string(&value)?,
        };
        Ok(encoded)
    }
}

/// A write that removes the row is a delete for consumers, whatever
/// the source operation was.
fn effective_op(write: &RowWrite) -> ChangeOperation {
    match write.op {
        WriteOp::Delete => ChangeOperation::Delete,
        WriteOp::Upsert(_) if write.source_op == ChangeOperation::Delete => {
            ChangeOperation::Update
        }
        WriteOp::Upsert(_) => write.source_op,
    }
}

fn debezium_op(op: ChangeOperation) -> &'static str {
    match op {
        ChangeOperation::Insert => "c",
        ChangeOperation::Update => "u",
        ChangeOperation::Delete => "d",
    }
}

fn full_row(write: &RowWrite, row: &Row) -> Value {
    let mut full = write.key.clone();
    full.extend(row.iter().map(|(c, v)| (c.clone(), v.clone())));
    Value::Object(full)
}
