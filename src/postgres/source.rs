//! Capture side of the PostgreSQL driver.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio_postgres::{Client, IsolationLevel};
use tracing::{debug, info, instrument, warn};

use super::audit::audit_row_to_change;
use super::decoder::{DecodedMessage, PgOutputDecoder};
use super::types::{format_lsn, parse_lsn};
use super::{column_list, qualified, text_rows, PostgresDatastore};
use crate::capture::CaptureMode;
use crate::checkpoint::Checkpoint;
use crate::datastore::{Snapshot, SourceConnection};
use crate::event::{CapturedChange, SequenceNumber, TableRef};
use crate::mapping::TableSchema;
use crate::{Error, Result};

/// A peek of the slot that held no changes of a table after `from`,
/// through the transaction committed at `through`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct IdleScan {
    pub from: SequenceNumber,
    pub through: SequenceNumber,
}

/// LSN the slot may be confirmed up to: just before the oldest position
/// any captured table still needs, so a partially applied transaction is
/// decoded again. A table idle since its committed position counts as
/// caught up through its scan.
fn release_lsn(
    checkpoint: &Checkpoint,
    tables: &[TableRef],
    scans: &HashMap<TableRef, IdleScan>,
) -> Option<u64> {
    let low = tables
        .iter()
        .map(|table| {
            let committed = checkpoint.position(table);
            match scans.get(table) {
                Some(scan) if committed >= scan.from => committed.max(scan.through),
                _ => committed,
            }
        })
        .min()?;
    low.position.checked_sub(1).filter(|lsn| *lsn > 0)
}

/// Restart position of the slot, `None` when the slot does not exist.
async fn slot_position(client: &Client, slot: &str) -> Result<Option<u64>> {
    let row = client
        .query_opt(
            "SELECT confirmed_flush_lsn::text, plugin::text \
             FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot],
        )
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let plugin: Option<String> = row.try_get(1)?;
    if plugin.as_deref() != Some("pgoutput") {
        return Err(Error::Config(format!(
            "replication slot '{}' is not a pgoutput logical slot",
            slot
        )));
    }
    let confirmed: Option<String> = row.try_get(0)?;
    confirmed.as_deref().map(parse_lsn).transpose()
}

impl PostgresDatastore {
    /// Makes sure the slot still holds every change after `after`.
    ///
    /// A fresh table (no checkpoint) may create the slot; a checkpointed
    /// one must find it, or changes were lost.
    async fn check_slot(&self, client: &Client, table: &TableRef, after: SequenceNumber) -> Result<()> {
        let slot = &self.settings.slot;
        let gap = |message: String| Error::LogGap {
            table: table.to_string(),
            checkpoint: after,
            message,
        };

        match slot_position(client, slot).await? {
            None if after.is_zero() => {
                client
                    .query_one(
                        "SELECT lsn::text FROM pg_create_logical_replication_slot($1, 'pgoutput')",
                        &[slot],
                    )
                    .await?;
                info!(slot = %slot, "Created logical replication slot");
                Ok(())
            }
            None => Err(gap(format!("replication slot '{}' does not exist", slot))),
            Some(confirmed) if !after.is_zero() && confirmed > after.position => Err(gap(format!(
                "replication slot '{}' was advanced to {} past the checkpoint {}",
                slot,
                format_lsn(confirmed),
                format_lsn(after.position)
            ))),
            Some(_) => Ok(()),
        }
    }
}

#[async_trait]
impl SourceConnection for PostgresDatastore {
    async fn describe_table(&self, table: &TableRef) -> Result<TableSchema> {
        self.describe(table).await
    }

    /// Peeks the slot without consuming it and keeps the changes of
    /// `table` after `after`. Releasing the slot is left to `acknowledge`.
    #[instrument(skip(self), fields(datastore = %self.name))]
    async fn read_log(
        &self,
        table: &TableRef,
        after: SequenceNumber,
        limit: usize,
    ) -> Result<Vec<CapturedChange>> {
        let rows = {
            let client = self.pool.get().await;
            self.check_slot(&client, table, after).await?;
            client
                .query(
                    "SELECT data FROM pg_logical_slot_peek_binary_changes($1, NULL, $2, \
                     'proto_version', '1', 'publication_names', $3)",
                    &[
                        &self.settings.slot,
                        &self.settings.peek_window,
                        &self.settings.publication,
                    ],
                )
                .await?
        };

        let mut decoder = PgOutputDecoder::new();
        let mut changes = Vec::new();
        let mut scanned_through = None;
        for row in rows {
            let data: Vec<u8> = row.try_get(0)?;
            match decoder.decode(&data)? {
                Some(DecodedMessage::Commit { commit_lsn }) => {
                    scanned_through = Some(commit_lsn);
                }
                Some(DecodedMessage::Change(change))
                    if &change.table == table && change.sequence > after =>
                {
                    changes.push(change);
                    if changes.len() >= limit {
                        break;
                    }
                }
                Some(DecodedMessage::Truncate(tables)) if tables.contains(table) => {
                    warn!(table = %table, "TRUNCATE is not replicated");
                }
                _ => {}
            }
        }
        if let (true, Some(lsn)) = (changes.is_empty(), scanned_through) {
            let scan = IdleScan {
                from: after,
                through: SequenceNumber::new(lsn, 0),
            };
            self.idle_scans
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(table.clone(), scan);
        }
        debug!(table = %table, changes = changes.len(), "Read slot changes");
        Ok(changes)
    }

    async fn poll_audit(
        &self,
        table: &TableRef,
        after: SequenceNumber,
        limit: usize,
    ) -> Result<Vec<CapturedChange>> {
        let client = self.pool.get().await;
        let sql = format!(
            "SELECT seq, op, before, after, txid FROM {} \
             WHERE schema_name = $1 AND table_name = $2 AND seq > $3 \
             ORDER BY seq LIMIT $4",
            qualified(&self.settings.audit_table)
        );
        let after_seq = i64::try_from(after.position).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = client
            .query(&sql, &[&table.schema, &table.table, &after_seq, &limit])
            .await?;
        rows.iter().map(|row| audit_row_to_change(table, row)).collect()
    }

    /// Copies the table inside a `REPEATABLE READ` transaction together
    /// with the position the copy is consistent with: the current WAL
    /// position for log capture, the newest audit sequence for polling.
    #[instrument(skip(self), fields(datastore = %self.name))]
    async fn snapshot(&self, table: &TableRef, mode: CaptureMode) -> Result<Snapshot> {
        let columns = self.load_columns(table).await?;

        let mut client = self.pool.get().await;
        let transaction = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await?;

        let checkpoint = match mode {
            CaptureMode::Log => {
                let lsn: String = transaction
                    .query_one("SELECT pg_current_wal_lsn()::text", &[])
                    .await?
                    .try_get(0)?;
                SequenceNumber::new(parse_lsn(&lsn)?, 0)
            }
            CaptureMode::Polling => {
                let sql = format!(
                    "SELECT coalesce(max(seq), 0) FROM {} \
                     WHERE schema_name = $1 AND table_name = $2",
                    qualified(&self.settings.audit_table)
                );
                let seq: i64 = transaction
                    .query_one(&sql, &[&table.schema, &table.table])
                    .await?
                    .try_get(0)?;
                SequenceNumber::new(u64::try_from(seq).unwrap_or(0), 0)
            }
        };

        let sql = format!(
            "SELECT {} FROM {}",
            column_list(columns.iter().map(|c| c.name.as_str())),
            qualified(table)
        );
        let rows = text_rows(transaction.simple_query(&sql).await?, &columns);
        transaction.commit().await?;

        info!(table = %table, rows = rows.len(), checkpoint = %checkpoint, "Snapshot read");
        Ok(Snapshot { rows, checkpoint })
    }

    /// Advances the slot past changes every captured table has committed.
    async fn acknowledge(
        &self,
        checkpoint: &Checkpoint,
        tables: &[TableRef],
        mode: CaptureMode,
    ) -> Result<()> {
        if mode != CaptureMode::Log {
            return Ok(());
        }
        let upto = {
            let scans = self.idle_scans.lock().unwrap_or_else(|e| e.into_inner());
            release_lsn(checkpoint, tables, &scans)
        };
        let Some(upto) = upto else {
            return Ok(());
        };

        let client = self.pool.get().await;
        let slot = &self.settings.slot;
        match slot_position(&client, slot).await? {
            Some(confirmed) if upto > confirmed => {
                client
                    .query_one(
                        "SELECT end_lsn::text FROM pg_replication_slot_advance($1, $2::text::pg_lsn)",
                        &[slot, &format_lsn(upto)],
                    )
                    .await?;
                debug!(slot = %slot, lsn = %format_lsn(upto), "Advanced replication slot");
            }
            _ => {}
        }
        Ok(())
    }
}
