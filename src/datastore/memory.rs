//! In-process relational datastore.
//!
//! Keeps tables, a change log and dead letters in memory. It plays both
//! roles: mutations made through [`MemoryDatastore::insert`] and friends
//! are logged and can be captured, while writes applied as a target are
//! not. Used by tests, demos and embedders that want a loopback store.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{RowWrite, Snapshot, SourceConnection, TargetConnection, WriteOp};
use crate::apply::DeadLetterRecord;
use crate::capture::CaptureMode;
use crate::checkpoint::Checkpoint;
use crate::event::{CapturedChange, ChangeOperation, Row, SequenceNumber, TableRef};
use crate::mapping::TableSchema;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    rows: BTreeMap<String, Row>,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<TableRef, MemoryTable>,
    log: Vec<CapturedChange>,
    /// Changes at or below this position were truncated away
    log_floor: SequenceNumber,
    next_position: u64,
    next_xid: u64,
    dead_letters: Vec<DeadLetterRecord>,
    fail_next_applies: u32,
    fail_next_reads: u32,
    failing_keys: Vec<(TableRef, String)>,
    apply_calls: u64,
    acknowledged: Option<Checkpoint>,
    released: Option<SequenceNumber>,
}

#[derive(Default)]
pub struct MemoryDatastore {
    state: Mutex<MemoryState>,
}

/// Stable string form of a key row.
pub(crate) fn encode_key(key: &Row) -> String {
    let mut parts: Vec<(&String, &serde_json::Value)> = key.iter().collect();
    parts.sort_by(|a, b| a.0.cmp(b.0));
    parts
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(",")
}

fn key_of(schema: &TableSchema, row: &Row) -> Result<Row> {
    schema
        .primary_key
        .iter()
        .map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
        .collect::<Option<Row>>()
        .ok_or_else(|| Error::InvalidMessage {
            message: format!("row is missing primary key columns of {}", schema.table),
        })
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_table(&self, schema: TableSchema) {
        let mut state = self.lock();
        state.tables.insert(
            schema.table.clone(),
            MemoryTable {
                schema,
                rows: BTreeMap::new(),
            },
        );
    }

    pub fn schema(&self, table: &TableRef) -> Option<TableSchema> {
        self.lock().tables.get(table).map(|t| t.schema.clone())
    }

    /// Inserts a row and logs the change.
    pub fn insert(&self, table: &TableRef, row: Row) -> Result<SequenceNumber> {
        self.mutate(table, ChangeOperation::Insert, row)
    }

    /// Replaces a row (matched by primary key) and logs the change.
    pub fn update(&self, table: &TableRef, row: Row) -> Result<SequenceNumber> {
        self.mutate(table, ChangeOperation::Update, row)
    }

    /// Deletes the row with the given key and logs the change.
    pub fn delete(&self, table: &TableRef, key: Row) -> Result<SequenceNumber> {
        self.mutate(table, ChangeOperation::Delete, key)
    }

    fn mutate(&self, table: &TableRef, op: ChangeOperation, row: Row) -> Result<SequenceNumber> {
        let mut state = self.lock();
        let state = &mut *state;
        let entry = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::not_found("table", table.to_string()))?;
        let key = encode_key(&key_of(&entry.schema, &row)?);

        let (before, after) = match op {
            ChangeOperation::Insert => {
                if entry.rows.contains_key(&key) {
                    return Err(Error::InvalidMessage {
                        message: format!("duplicate key {} in {}", key, table),
                    });
                }
                entry.rows.insert(key, row.clone());
                (None, Some(row))
            }
            ChangeOperation::Update => {
                let before = entry.rows.insert(key.clone(), row.clone()).ok_or_else(|| {
                    Error::InvalidMessage {
                        message: format!("no row {} in {}", key, table),
                    }
                })?;
                (Some(before), Some(row))
            }
            ChangeOperation::Delete => {
                let before = entry.rows.remove(&key).ok_or_else(|| Error::InvalidMessage {
                    message: format!("no row {} in {}", key, table),
                })?;
                (Some(before), None)
            }
        };

        state.next_position += 1;
        state.next_xid += 1;
        let sequence = SequenceNumber::new(state.next_position, 0);
        state.log.push(CapturedChange {
            table: table.clone(),
            op,
            before,
            after,
            transaction_id: Some(state.next_xid),
            sequence,
        });
        Ok(sequence)
    }

    /// Writes a row without logging it, as an independent edit would.
    pub fn put_row_untracked(&self, table: &TableRef, row: Row) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::not_found("table", table.to_string()))?;
        let key = encode_key(&key_of(&entry.schema, &row)?);
        entry.rows.insert(key, row);
        Ok(())
    }

    pub fn rows(&self, table: &TableRef) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &TableRef, key: &Row) -> Option<Row> {
        self.lock()
            .tables
            .get(table)
            .and_then(|t| t.rows.get(&encode_key(key)).cloned())
    }

    /// Drops logged changes up to and including `upto`.
    pub fn truncate_log(&self, upto: SequenceNumber) {
        let mut state = self.lock();
        state.log.retain(|c| c.sequence > upto);
        if upto > state.log_floor {
            state.log_floor = upto;
        }
    }

    /// Makes the next `count` apply calls fail.
    pub fn fail_next_applies(&self, count: u32) {
        self.lock().fail_next_applies = count;
    }

    /// Makes the next `count` row reads fail.
    pub fn fail_next_reads(&self, count: u32) {
        self.lock().fail_next_reads = count;
    }

    /// Makes every write to the given key fail until cleared.
    pub fn fail_writes_for_key(&self, table: &TableRef, key: Row) {
        self.lock()
            .failing_keys
            .push((table.clone(), encode_key(&key)));
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_next_applies = 0;
        state.fail_next_reads = 0;
        state.failing_keys.clear();
    }

    pub fn apply_calls(&self) -> u64 {
        self.lock().apply_calls
    }

    pub fn dead_letter_records(&self) -> Vec<DeadLetterRecord> {
        self.lock().dead_letters.clone()
    }

    pub fn last_acknowledged(&self) -> Option<Checkpoint> {
        self.lock().acknowledged.clone()
    }

    /// Position every captured table had committed at the last acknowledgement.
    pub fn released_through(&self) -> Option<SequenceNumber> {
        self.lock().released
    }

    fn changes_after(
        &self,
        table: &TableRef,
        after: SequenceNumber,
        limit: usize,
    ) -> Vec<CapturedChange> {
        self.lock()
            .log
            .iter()
            .filter(|c| &c.table == table && c.sequence > after)
            .take(limit)
            .cloned()
            .collect()
    }
}

fn apply_write(
    tables: &mut HashMap<TableRef, MemoryTable>,
    failing_keys: &[(TableRef, String)],
    write: &RowWrite,
) -> Result<()> {
    let key = encode_key(&write.key);
    if failing_keys
        .iter()
        .any(|(table, failing)| table == &write.table && failing == &key)
    {
        return Err(Error::InvalidMessage {
            message: format!("write to {} key {} rejected", write.table, key),
        });
    }

    let table = tables
        .get_mut(&write.table)
        .ok_or_else(|| Error::not_found("table", write.table.to_string()))?;
    match &write.op {
        WriteOp::Upsert(row) => {
            let mut merged = table.rows.get(&key).cloned().unwrap_or_default();
            for (column, value) in row {
                merged.insert(column.clone(), value.clone());
            }
            table.rows.insert(key, merged);
        }
        WriteOp::Delete => {
            table.rows.remove(&key);
        }
    }
    Ok(())
}

#[async_trait]
impl SourceConnection for MemoryDatastore {
    async fn describe_table(&self, table: &TableRef) -> Result<TableSchema> {
        self.schema(table)
            .ok_or_else(|| Error::not_found("table", table.to_string()))
    }

    async fn read_log(
        &self,
        table: &TableRef,
        after: SequenceNumber,
        limit: usize,
    ) -> Result<Vec<CapturedChange>> {
        let floor = self.lock().log_floor;
        if after < floor {
            return Err(Error::LogGap {
                table: table.to_string(),
                checkpoint: after,
                message: format!("log truncated through {}", floor),
            });
        }
        Ok(self.changes_after(table, after, limit))
    }

    async fn poll_audit(
        &self,
        table: &TableRef,
        after: SequenceNumber,
        limit: usize,
    ) -> Result<Vec<CapturedChange>> {
        Ok(self.changes_after(table, after, limit))
    }

    async fn snapshot(&self, table: &TableRef, _mode: CaptureMode) -> Result<Snapshot> {
        let state = self.lock();
        let entry = state
            .tables
            .get(table)
            .ok_or_else(|| Error::not_found("table", table.to_string()))?;
        Ok(Snapshot {
            rows: entry.rows.values().cloned().collect(),
            checkpoint: SequenceNumber::new(state.next_position, 0),
        })
    }

    async fn acknowledge(
        &self,
        checkpoint: &Checkpoint,
        tables: &[TableRef],
        _mode: CaptureMode,
    ) -> Result<()> {
        let mut state = self.lock();
        state.acknowledged = Some(checkpoint.clone());
        state.released = checkpoint.low_watermark(tables);
        Ok(())
    }
}

#[async_trait]
impl TargetConnection for MemoryDatastore {
    async fn describe_table(&self, table: &TableRef) -> Result<Option<TableSchema>> {
        self.schema(table)
            .map(Some)
            .ok_or_else(|| Error::not_found("table", table.to_string()))
    }

    async fn fetch_row(&self, table: &TableRef, key: &Row) -> Result<Option<Row>> {
        {
            let mut state = self.lock();
            if state.fail_next_reads > 0 {
                state.fail_next_reads -= 1;
                return Err(Error::Connection("injected read failure".into()));
            }
        }
        Ok(self.row(table, key))
    }

    async fn apply(&self, writes: &[RowWrite], transactional: bool) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        state.apply_calls += 1;

        if state.fail_next_applies > 0 {
            state.fail_next_applies -= 1;
            return Err(Error::Connection("injected apply failure".into()));
        }

        if transactional {
            let mut staged = state.tables.clone();
            for write in writes {
                apply_write(&mut staged, &state.failing_keys, write)?;
            }
            state.tables = staged;
        } else {
            for write in writes {
                apply_write(&mut state.tables, &state.failing_keys, write)?;
            }
        }
        Ok(())
    }

    async fn write_dead_letter(&self, record: &DeadLetterRecord) -> Result<()> {
        self.lock().dead_letters.push(record.clone());
        Ok(())
    }

    async fn dead_letters(&self, subscription: &str) -> Result<Vec<DeadLetterRecord>> {
        Ok(self
            .lock()
            .dead_letters
            .iter()
            .filter(|r| r.subscription == subscription)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::ColumnDef;
    use serde_json::json;

    fn users() -> TableRef {
        TableRef::new("public", "users")
    }

    fn store() -> MemoryDatastore {
        let store = MemoryDatastore::new();
        store.create_table(TableSchema {
            table: users(),
            columns: vec![ColumnDef::new("id", "integer"), ColumnDef::new("name", "text")],
            primary_key: vec!["id".into()],
            unique_keys: vec![],
        });
        store
    }

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_mutations_are_logged_in_order() {
        let store = store();
        store.insert(&users(), row(json!({"id": 1, "name": "a"}))).unwrap();
        store.update(&users(), row(json!({"id": 1, "name": "b"}))).unwrap();
        store.delete(&users(), row(json!({"id": 1}))).unwrap();

        let changes = store.read_log(&users(), SequenceNumber::ZERO, 10).await.unwrap();
        let ops: Vec<ChangeOperation> = changes.iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                ChangeOperation::Insert,
                ChangeOperation::Update,
                ChangeOperation::Delete
            ]
        );
        assert_eq!(changes[1].before.as_ref().unwrap()["name"], "a");
        assert!(changes.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[tokio::test]
    async fn test_truncated_log_reports_gap() {
        let store = store();
        let first = store.insert(&users(), row(json!({"id": 1, "name": "a"}))).unwrap();
        store.insert(&users(), row(json!({"id": 2, "name": "b"}))).unwrap();
        store.truncate_log(SequenceNumber::new(2, 0));

        let err = store.read_log(&users(), first, 10).await.unwrap_err();
        assert!(matches!(err, Error::LogGap { .. }));
        assert!(store
            .read_log(&users(), SequenceNumber::new(2, 0), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_transactional_apply_is_all_or_nothing() {
        let store = store();
        store.fail_writes_for_key(&users(), row(json!({"id": 2})));

        let writes: Vec<RowWrite> = [1, 2]
            .iter()
            .map(|id| RowWrite {
                table: users(),
                key: row(json!({"id": id})),
                op: WriteOp::Upsert(row(json!({"id": id, "name": "x"}))),
                source_op: ChangeOperation::Insert,
                sequence: SequenceNumber::new(*id as u64, 0),
            })
            .collect();

        assert!(TargetConnection::apply(&store, &writes, true).await.is_err());
        assert!(store.rows(&users()).is_empty());

        assert!(TargetConnection::apply(&store, &writes, false).await.is_err());
        assert_eq!(store.rows(&users()).len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_checkpoint_matches_log_head() {
        let store = store();
        store.insert(&users(), row(json!({"id": 1, "name": "a"}))).unwrap();
        let head = store.insert(&users(), row(json!({"id": 2, "name": "b"}))).unwrap();

        let snapshot = store.snapshot(&users(), CaptureMode::Log).await.unwrap();
        assert_eq!(snapshot.rows.len(), 2);
        assert_eq!(snapshot.checkpoint, head);
    }
}
