//! Row-change events flowing from capture to apply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A row image: column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Position of a change in the source's log.
///
/// `position` is the log position (audit sequence, or the commit LSN of the
/// transaction for PostgreSQL), `offset` the ordinal of the change inside
/// that position. Ordering is lexicographic.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SequenceNumber {
    pub position: u64,
    pub offset: u32,
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber {
        position: 0,
        offset: 0,
    };

    pub fn new(position: u64, offset: u32) -> Self {
        Self { position, offset }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.position, self.offset)
    }
}

impl FromStr for SequenceNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidMessage {
            message: format!("invalid sequence number '{}'", s),
        };
        let (position, offset) = s.split_once(':').unwrap_or((s, "0"));
        Ok(Self {
            position: position.parse().map_err(|_| invalid())?,
            offset: offset.parse().map_err(|_| invalid())?,
        })
    }
}

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

impl FromStr for TableRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok(Self::new(schema, table))
            }
            _ => Err(Error::Config(format!(
                "table reference '{}' must be schema.table",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    /// Single-letter code used in audit tables and message envelopes.
    pub fn code(&self) -> char {
        match self {
            ChangeOperation::Insert => 'I',
            ChangeOperation::Update => 'U',
            ChangeOperation::Delete => 'D',
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" | "i" => Some(ChangeOperation::Insert),
            "U" | "u" => Some(ChangeOperation::Update),
            "D" | "d" => Some(ChangeOperation::Delete),
            _ => None,
        }
    }
}

/// A change as read from the source, before it is bound to a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedChange {
    pub table: TableRef,
    pub op: ChangeOperation,
    pub before: Option<Row>,
    pub after: Option<Row>,
    pub transaction_id: Option<u64>,
    pub sequence: SequenceNumber,
}

/// A row-level change routed through a subscription.
///
/// `sequence` is strictly increasing per (subscription, table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub subscription_id: String,
    pub table: TableRef,
    pub op: ChangeOperation,
    pub before: Option<Row>,
    pub after: Option<Row>,
    pub transaction_id: Option<u64>,
    pub sequence: SequenceNumber,
    pub captured_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn from_capture(subscription_id: &str, change: CapturedChange) -> Self {
        Self {
            subscription_id: subscription_id.to_string(),
            table: change.table,
            op: change.op,
            before: change.before,
            after: change.after,
            transaction_id: change.transaction_id,
            sequence: change.sequence,
            captured_at: Utc::now(),
        }
    }

    /// The image that identifies the row: `before` for deletes, `after` otherwise.
    pub fn identity_image(&self) -> Option<&Row> {
        match self.op {
            ChangeOperation::Delete => self.before.as_ref(),
            _ => self.after.as_ref().or(self.before.as_ref()),
        }
    }
}
