//! Decoder for the `pgoutput` logical decoding plugin (protocol version 1).
//!
//! Messages come one per row of `pg_logical_slot_peek_binary_changes`.
//! Relation messages are cached so that later row messages can be
//! resolved to a table and column names. Every change is stamped with the
//! commit LSN of its transaction and its ordinal inside that transaction.

use bytes::Buf;
use std::collections::HashMap;
use tracing::{debug, trace};

use super::types::{format_lsn, parse_binary_value, parse_text_value};
use crate::event::{CapturedChange, ChangeOperation, Row, SequenceNumber, TableRef};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub id: u32,
    pub table: TableRef,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

#[derive(Debug, Clone, Copy)]
struct Transaction {
    final_lsn: u64,
    xid: u32,
    ordinal: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Begin { final_lsn: u64, xid: u32 },
    Commit { commit_lsn: u64 },
    Change(CapturedChange),
    Truncate(Vec<TableRef>),
}

#[derive(Default)]
pub struct PgOutputDecoder {
    relations: HashMap<u32, RelationInfo>,
    transaction: Option<Transaction>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(&self, id: u32) -> Option<&RelationInfo> {
        self.relations.get(&id)
    }

    /// Decodes one pgoutput message. Messages with no effect on row data
    /// (relation, type, origin) yield `None`.
    pub fn decode(&mut self, data: &[u8]) -> Result<Option<DecodedMessage>> {
        let mut cursor = data;
        if cursor.is_empty() {
            return Ok(None);
        }

        match cursor.get_u8() {
            b'B' => self.decode_begin(&mut cursor),
            b'C' => self.decode_commit(&mut cursor),
            b'R' => self.decode_relation(&mut cursor),
            b'I' => self.decode_insert(&mut cursor),
            b'U' => self.decode_update(&mut cursor),
            b'D' => self.decode_delete(&mut cursor),
            b'T' => self.decode_truncate(&mut cursor),
            b'Y' | b'O' | b'M' => Ok(None),
            other => {
                debug!("Unknown pgoutput message type: {}", other as char);
                Ok(None)
            }
        }
    }

    fn decode_begin(&mut self, cursor: &mut &[u8]) -> Result<Option<DecodedMessage>> {
        need(cursor, 20, "BEGIN")?;
        let final_lsn = cursor.get_u64();
        let _timestamp = cursor.get_i64();
        let xid = cursor.get_u32();

        self.transaction = Some(Transaction {
            final_lsn,
            xid,
            ordinal: 0,
        });
        trace!("BEGIN: lsn={}, xid={}", format_lsn(final_lsn), xid);
        Ok(Some(DecodedMessage::Begin { final_lsn, xid }))
    }

    fn decode_commit(&mut self, cursor: &mut &[u8]) -> Result<Option<DecodedMessage>> {
        need(cursor, 25, "COMMIT")?;
        let _flags = cursor.get_u8();
        let commit_lsn = cursor.get_u64();
        let _end_lsn = cursor.get_u64();
        let _timestamp = cursor.get_i64();

        self.transaction = None;
        trace!("COMMIT: lsn={}", format_lsn(commit_lsn));
        Ok(Some(DecodedMessage::Commit { commit_lsn }))
    }

    fn decode_relation(&mut self, cursor: &mut &[u8]) -> Result<Option<DecodedMessage>> {
        need(cursor, 4, "RELATION")?;
        let id = cursor.get_u32();
        let schema = match read_cstring(cursor)? {
            s if s.is_empty() => "pg_catalog".to_string(),
            s => s,
        };
        let table = read_cstring(cursor)?;

        need(cursor, 3, "RELATION")?;
        let _replica_identity = cursor.get_u8();
        let count = cursor.get_u16();

        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            need(cursor, 1, "RELATION column")?;
            let flags = cursor.get_u8();
            let name = read_cstring(cursor)?;
            need(cursor, 8, "RELATION column")?;
            let type_id = cursor.get_u32();
            let _type_modifier = cursor.get_i32();
            columns.push(ColumnInfo {
                name,
                type_id,
                is_key: flags & 1 != 0,
            });
        }

        let table = TableRef::new(schema, table);
        debug!("RELATION: {}={}", id, table);
        self.relations.insert(id, RelationInfo { id, table, columns });
        Ok(None)
    }

    fn decode_insert(&mut self, cursor: &mut &[u8]) -> Result<Option<DecodedMessage>> {
        need(cursor, 5, "INSERT")?;
        let relation = self.lookup(cursor.get_u32())?;
        match cursor.get_u8() {
            b'N' => {}
            other => {
                return Err(invalid(format!(
                    "unexpected tuple type in INSERT: {}",
                    other as char
                )))
            }
        }
        let after = decode_tuple(cursor, &relation.columns, false)?;
        self.change(&relation, ChangeOperation::Insert, None, Some(after))
    }

    fn decode_update(&mut self, cursor: &mut &[u8]) -> Result<Option<DecodedMessage>> {
        need(cursor, 5, "UPDATE")?;
        let relation = self.lookup(cursor.get_u32())?;

        let mut before = None;
        let mut tag = cursor.get_u8();
        if tag == b'K' || tag == b'O' {
            before = Some(decode_tuple(cursor, &relation.columns, tag == b'K')?);
            need(cursor, 1, "UPDATE")?;
            tag = cursor.get_u8();
        }
        if tag != b'N' {
            return Err(invalid(format!(
                "unexpected tuple type in UPDATE: {}",
                tag as char
            )));
        }
        let mut after = decode_tuple(cursor, &relation.columns, false)?;

        // Unchanged TOAST columns are absent from the new tuple
        if let Some(old) = &before {
            for (column, value) in old {
                after.entry(column.clone()).or_insert_with(|| value.clone());
            }
        }
        self.change(&relation, ChangeOperation::Update, before, Some(after))
    }

    fn decode_delete(&mut self, cursor: &mut &[u8]) -> Result<Option<DecodedMessage>> {
        need(cursor, 5, "DELETE")?;
        let relation = self.lookup(cursor.get_u32())?;
        let tag = cursor.get_u8();
        if tag != b'K' && tag != b'O' {
            return Err(invalid(format!(
                "unexpected tuple type in DELETE: {}",
                tag as char
            )));
        }
        let before = decode_tuple(cursor, &relation.columns, tag == b'K')?;
        self.change(&relation, ChangeOperation::Delete, Some(before), None)
    }

    fn decode_truncate(&mut self, cursor: &mut &[u8]) -> Result<Option<DecodedMessage>> {
        need(cursor, 5, "TRUNCATE")?;
        let count = cursor.get_u32();
        let _options = cursor.get_u8();
        let mut tables = Vec::with_capacity(count as usize);
        for _ in 0..count {
            need(cursor, 4, "TRUNCATE")?;
            tables.push(self.lookup(cursor.get_u32())?.table);
        }
        debug!(tables = ?tables, "TRUNCATE received");
        Ok(Some(DecodedMessage::Truncate(tables)))
    }

    fn lookup(&self, id: u32) -> Result<RelationInfo> {
        self.relations
            .get(&id)
            .cloned()
            .ok_or_else(|| invalid(format!("unknown relation id: {}", id)))
    }

    fn change(
        &mut self,
        relation: &RelationInfo,
        op: ChangeOperation,
        before: Option<Row>,
        after: Option<Row>,
    ) -> Result<Option<DecodedMessage>> {
        let transaction = self
            .transaction
            .as_mut()
            .ok_or_else(|| invalid(format!("{:?} outside of a transaction", op)))?;
        let sequence = SequenceNumber::new(transaction.final_lsn, transaction.ordinal);
        transaction.ordinal += 1;

        Ok(Some(DecodedMessage::Change(CapturedChange {
            table: relation.table.clone(),
            op,
            before,
            after,
            transaction_id: Some(u64::from(transaction.xid)),
            sequence,
        })))
    }
}

/// Decodes TupleData. With `key_only`, columns outside the replica
/// identity are left out, since the server sends them as nulls.
fn decode_tuple(cursor: &mut &[u8], columns: &[ColumnInfo], key_only: bool) -> Result<Row> {
    need(cursor, 2, "tuple")?;
    let count = cursor.get_u16() as usize;
    if count != columns.len() {
        return Err(invalid(format!(
            "column count mismatch: {} vs {}",
            count,
            columns.len()
        )));
    }

    let mut row = Row::new();
    for column in columns {
        need(cursor, 1, "tuple column")?;
        let value = match cursor.get_u8() {
            b'n' => Some(serde_json::Value::Null),
            // Unchanged TOAST value, not sent
            b'u' => None,
            b't' => {
                let data = read_value(cursor)?;
                Some(parse_text_value(&String::from_utf8_lossy(data), column.type_id))
            }
            b'b' => Some(parse_binary_value(read_value(cursor)?, column.type_id)),
            other => return Err(invalid(format!("unknown column kind: {}", other as char))),
        };
        if key_only && !column.is_key {
            continue;
        }
        if let Some(value) = value {
            row.insert(column.name.clone(), value);
        }
    }
    Ok(row)
}

fn read_value<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8]> {
    need(cursor, 4, "column value")?;
    let len = cursor.get_u32() as usize;
    need(cursor, len, "column value")?;
    let slice: &'a [u8] = cursor;
    let (value, rest) = slice.split_at(len);
    *cursor = rest;
    Ok(value)
}

fn read_cstring(cursor: &mut &[u8]) -> Result<String> {
    let end = cursor
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| invalid("unterminated string".to_string()))?;
    let value = String::from_utf8_lossy(&cursor[..end]).to_string();
    cursor.advance(end + 1);
    Ok(value)
}

fn need(cursor: &[u8], len: usize, what: &str) -> Result<()> {
    if cursor.len() < len {
        return Err(invalid(format!("truncated {} message", what)));
    }
    Ok(())
}

fn invalid(message: String) -> Error {
    Error::InvalidMessage { message }
}
