//! Apply side of the PostgreSQL driver.
//!
//! Rows travel as one JSON parameter and are expanded server side with
//! `jsonb_populate_record`, so values are cast by the target's own
//! column types.

use async_trait::async_trait;
use tokio_postgres::GenericClient;
use tracing::{debug, info};

use super::types::{escape_identifier, escape_literal};
use super::{column_list, qualified, text_rows, PostgresDatastore};
use crate::apply::DeadLetterRecord;
use crate::datastore::{RowWrite, TargetConnection, WriteOp};
use crate::event::{ChangeEvent, Row, TableRef};
use crate::mapping::TableSchema;
use crate::Result;

/// `INSERT .. ON CONFLICT (key) DO UPDATE` of the columns present in `row`.
pub(crate) fn upsert_sql(table: &TableRef, key: &[&str], row: &Row) -> String {
    let table_name = qualified(table);
    let columns: Vec<&str> = row.keys().map(String::as_str).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !key.contains(*c))
        .map(|c| {
            let c = escape_identifier(c);
            format!("{c} = EXCLUDED.{c}")
        })
        .collect();
    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {table_name} ({cols}) \
         SELECT {cols} FROM jsonb_populate_record(NULL::{table_name}, $1::jsonb) \
         ON CONFLICT ({keys}) {on_conflict}",
        cols = column_list(columns.iter().copied()),
        keys = column_list(key.iter().copied()),
    )
}

/// `DELETE` of the row matching every column of the key image.
pub(crate) fn delete_sql(table: &TableRef, key: &[&str]) -> String {
    let table_name = qualified(table);
    format!(
        "DELETE FROM {table_name} AS t \
         USING jsonb_populate_record(NULL::{table_name}, $1::jsonb) AS k \
         WHERE {}",
        key_predicate(key)
    )
}

fn key_predicate(key: &[&str]) -> String {
    key.iter()
        .map(|c| {
            let c = escape_identifier(c);
            format!("t.{c} = k.{c}")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

async fn execute_write<C: GenericClient>(client: &C, write: &RowWrite) -> Result<()> {
    let key: Vec<&str> = write.key.keys().map(String::as_str).collect();
    let (sql, row) = match &write.op {
        WriteOp::Upsert(row) => {
            // The key must be part of the inserted row
            let mut full = write.key.clone();
            full.extend(row.iter().map(|(c, v)| (c.clone(), v.clone())));
            (upsert_sql(&write.table, &key, &full), full)
        }
        WriteOp::Delete => (delete_sql(&write.table, &key), write.key.clone()),
    };
    let affected = client
        .execute(sql.as_str(), &[&serde_json::Value::Object(row)])
        .await?;
    debug!(table = %write.table, sequence = %write.sequence, affected, "Applied write");
    Ok(())
}

impl PostgresDatastore {
    async fn ensure_dead_letter_table(&self) -> Result<()> {
        self.dead_letter_ready
            .get_or_try_init(|| async {
                let table = &self.settings.dead_letter_table;
                let ddl = format!(
                    "CREATE TABLE IF NOT EXISTS {name} (
                        id bigserial PRIMARY KEY,
                        subscription text NOT NULL,
                        source_table text NOT NULL,
                        sequence_position bigint NOT NULL,
                        sequence_offset bigint NOT NULL,
                        original_event jsonb NOT NULL,
                        failure_reason text NOT NULL,
                        attempt_count integer NOT NULL,
                        first_failed_at timestamptz NOT NULL,
                        recorded_at timestamptz NOT NULL DEFAULT now()
                    );
                    CREATE INDEX IF NOT EXISTS {index} ON {name} (subscription, id);",
                    name = qualified(table),
                    index = escape_identifier(&format!("{}_subscription", table.table)),
                );
                self.pool.get().await.batch_execute(&ddl).await?;
                info!(table = %table, "Dead-letter table ready");
                Ok::<_, crate::Error>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TargetConnection for PostgresDatastore {
    async fn describe_table(&self, table: &TableRef) -> Result<Option<TableSchema>> {
        self.describe(table).await.map(Some)
    }

    async fn fetch_row(&self, table: &TableRef, key: &Row) -> Result<Option<Row>> {
        let columns = self.columns(table).await?;
        let key_columns: Vec<&str> = key.keys().map(String::as_str).collect();
        let table_name = qualified(table);
        let key_json = serde_json::Value::Object(key.clone()).to_string();
        let sql = format!(
            "SELECT {} FROM {table_name} AS t, \
             jsonb_populate_record(NULL::{table_name}, {}::jsonb) AS k \
             WHERE {} LIMIT 1",
            columns
                .iter()
                .map(|c| format!("t.{}", escape_identifier(&c.name)))
                .collect::<Vec<_>>()
                .join(", "),
            escape_literal(&key_json),
            key_predicate(&key_columns),
        );
        let messages = self.pool.get().await.simple_query(&sql).await?;
        Ok(text_rows(messages, &columns).into_iter().next())
    }

    async fn apply(&self, writes: &[RowWrite], transactional: bool) -> Result<()> {
        let mut client = self.pool.get().await;
        if transactional {
            let transaction = client.transaction().await?;
            for write in writes {
                execute_write(&transaction, write).await?;
            }
            transaction.commit().await?;
        } else {
            for write in writes {
                execute_write(&*client, write).await?;
            }
        }
        Ok(())
    }

    async fn write_dead_letter(&self, record: &DeadLetterRecord) -> Result<()> {
        self.ensure_dead_letter_table().await?;
        let event = &record.original_event;
        let sql = format!(
            "INSERT INTO {} (subscription, source_table, sequence_position, sequence_offset, \
             original_event, failure_reason, attempt_count, first_failed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            qualified(&self.settings.dead_letter_table)
        );
        let position = i64::try_from(event.sequence.position).unwrap_or(i64::MAX);
        let offset = i64::from(event.sequence.offset);
        let attempts = i32::try_from(record.attempt_count).unwrap_or(i32::MAX);
        self.pool
            .get()
            .await
            .execute(
                &sql,
                &[
                    &record.subscription,
                    &event.table.to_string(),
                    &position,
                    &offset,
                    &serde_json::to_value(event)?,
                    &record.failure_reason,
                    &attempts,
                    &record.first_failed_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn dead_letters(&self, subscription: &str) -> Result<Vec<DeadLetterRecord>> {
        self.ensure_dead_letter_table().await?;
        let sql = format!(
            "SELECT original_event, failure_reason, attempt_count, first_failed_at \
             FROM {} WHERE subscription = $1 ORDER BY id",
            qualified(&self.settings.dead_letter_table)
        );
        let rows = self.pool.get().await.query(&sql, &[&subscription]).await?;
        rows.iter()
            .map(|row| -> Result<DeadLetterRecord> {
                let event: ChangeEvent = serde_json::from_value(row.try_get(0)?)?;
                let attempts: i32 = row.try_get(2)?;
                Ok(DeadLetterRecord::new(
                    event,
                    row.try_get::<_, String>(1)?,
                    u32::try_from(attempts).unwrap_or(0),
                    row.try_get(3)?,
                ))
            })
            .collect()
    }
}
