//! Trigger-fed audit table used by polling capture.
//!
//! Every audited table gets an `AFTER` row trigger that appends the old
//! and new row images to one shared audit table. Polling reads it in
//! `seq` order per table.

use tokio_postgres::Row as PgRow;

use super::qualified;
use super::types::{escape_identifier, escape_literal};
use crate::event::{CapturedChange, ChangeOperation, Row, SequenceNumber, TableRef};
use crate::{Error, Result};

/// Name of the shared trigger function, next to the audit table.
fn trigger_function(audit_table: &TableRef) -> TableRef {
    TableRef::new(&audit_table.schema, format!("{}_capture", audit_table.table))
}

/// DDL creating the audit table, its trigger function and the trigger
/// on `table`. Safe to run more than once.
pub fn audit_trigger_ddl(table: &TableRef, audit_table: &TableRef) -> String {
    let audit = qualified(audit_table);
    let function = qualified(&trigger_function(audit_table));
    let index = escape_identifier(&format!("{}_table_seq", audit_table.table));
    let trigger = escape_identifier(&format!("{}_trigger", audit_table.table));

    format!(
        r#"CREATE TABLE IF NOT EXISTS {audit} (
    seq bigserial PRIMARY KEY,
    schema_name text NOT NULL,
    table_name text NOT NULL,
    op char(1) NOT NULL,
    before jsonb,
    after jsonb,
    txid bigint NOT NULL DEFAULT txid_current(),
    changed_at timestamptz NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS {index} ON {audit} (schema_name, table_name, seq);

CREATE OR REPLACE FUNCTION {function}() RETURNS trigger
LANGUAGE plpgsql AS $cdc$
BEGIN
    IF TG_OP = 'INSERT' THEN
        INSERT INTO {audit} (schema_name, table_name, op, after)
        VALUES (TG_TABLE_SCHEMA, TG_TABLE_NAME, 'I', to_jsonb(NEW));
    ELSIF TG_OP = 'UPDATE' THEN
        INSERT INTO {audit} (schema_name, table_name, op, before, after)
        VALUES (TG_TABLE_SCHEMA, TG_TABLE_NAME, 'U', to_jsonb(OLD), to_jsonb(NEW));
    ELSIF TG_OP = 'DELETE' THEN
        INSERT INTO {audit} (schema_name, table_name, op, before)
        VALUES (TG_TABLE_SCHEMA, TG_TABLE_NAME, 'D', to_jsonb(OLD));
    END IF;
    RETURN NULL;
END;
$cdc$;

DROP TRIGGER IF EXISTS {trigger} ON {target};
CREATE TRIGGER {trigger}
    AFTER INSERT OR UPDATE OR DELETE ON {target}
    FOR EACH ROW EXECUTE FUNCTION {function}();

COMMENT ON TRIGGER {trigger} ON {target} IS {comment};
"#,
        target = qualified(table),
        comment = escape_literal(&format!("cdc-relay polling capture of {}", table)),
    )
}

/// Converts one row of `SELECT seq, op, before, after, txid`.
pub(crate) fn audit_row_to_change(table: &TableRef, row: &PgRow) -> Result<CapturedChange> {
    let seq: i64 = row.try_get(0)?;
    let code: String = row.try_get(1)?;
    let op = ChangeOperation::from_code(code.trim()).ok_or_else(|| Error::InvalidMessage {
        message: format!("unknown audit operation '{}' at seq {}", code, seq),
    })?;
    let before: Option<serde_json::Value> = row.try_get(2)?;
    let after: Option<serde_json::Value> = row.try_get(3)?;
    let txid: i64 = row.try_get(4)?;

    Ok(CapturedChange {
        table: table.clone(),
        op,
        before: image(before, seq)?,
        after: image(after, seq)?,
        transaction_id: u64::try_from(txid).ok(),
        sequence: SequenceNumber::new(u64::try_from(seq).unwrap_or(0), 0),
    })
}

fn image(value: Option<serde_json::Value>, seq: i64) -> Result<Option<Row>> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Object(row)) => Ok(Some(row)),
        Some(other) => Err(Error::InvalidMessage {
            message: format!("audit image at seq {} is not an object: {}", seq, other),
        }),
    }
}
