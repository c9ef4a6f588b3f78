//! PostgreSQL driver: log capture from a logical replication slot
//! (pgoutput), polling capture from a trigger-fed audit table, and
//! transactional apply.
//!
//! Connection options (`[datastores.connection]`):
//!
//! | key | default |
//! |---|---|
//! | `url` | unset; overrides the individual settings below |
//! | `host`, `port`, `database`, `user` | `localhost`, `5432`, `postgres`, `postgres` |
//! | `slot`, `publication` | `cdc_relay` |
//! | `audit_table` | `public.cdc_audit` |
//! | `dead_letter_table` | `public.cdc_dead_letter` |
//! | `pool_size` | `4` |
//! | `peek_window` | `10000` changes per slot read |

pub mod audit;
pub mod decoder;
pub mod source;
pub mod target;
pub mod types;

#[cfg(test)]
mod decoder_tests;
#[cfg(test)]
mod test_utils;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{error, info, warn};

use crate::datastore::{Connection, DatastoreDescriptor};
use crate::event::{Row, TableRef};
use crate::mapping::{ColumnDef, TableSchema};
use crate::{Error, Result};

pub use decoder::{DecodedMessage, PgOutputDecoder};
use types::{escape_identifier, parse_text_value};

/// Connects a PostgreSQL datastore. It serves as both source and target.
pub async fn connect(descriptor: &DatastoreDescriptor) -> Result<Connection> {
    let datastore = PostgresDatastore::connect(descriptor).await?;
    Ok(Connection::both(Arc::new(datastore)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostgresSettings {
    pub slot: String,
    pub publication: String,
    pub audit_table: TableRef,
    pub dead_letter_table: TableRef,
    pub pool_size: usize,
    pub peek_window: i32,
}

impl PostgresSettings {
    pub fn from_descriptor(descriptor: &DatastoreDescriptor) -> Result<Self> {
        let table = |key: &str, default: &str| -> Result<TableRef> {
            descriptor.option(key).unwrap_or(default).parse()
        };
        Ok(Self {
            slot: descriptor.option("slot").unwrap_or("cdc_relay").to_string(),
            publication: descriptor
                .option("publication")
                .unwrap_or("cdc_relay")
                .to_string(),
            audit_table: table("audit_table", "public.cdc_audit")?,
            dead_letter_table: table("dead_letter_table", "public.cdc_dead_letter")?,
            pool_size: descriptor.parsed_option("pool_size", 4usize)?.max(1),
            peek_window: descriptor.parsed_option("peek_window", 10_000i32)?.max(1),
        })
    }
}

fn client_config(descriptor: &DatastoreDescriptor) -> Result<tokio_postgres::Config> {
    let mut config = match descriptor.option("url") {
        Some(url) => url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| Error::Config(format!("datastore '{}': {}", descriptor.name, e)))?,
        None => {
            let mut config = tokio_postgres::Config::new();
            config
                .host(descriptor.option("host").unwrap_or("localhost"))
                .port(descriptor.parsed_option("port", 5432u16)?)
                .dbname(descriptor.option("database").unwrap_or("postgres"))
                .user(descriptor.option("user").unwrap_or("postgres"));
            config
        }
    };
    if let Some(credential) = &descriptor.credential {
        config.password(credential.resolve()?);
    }
    config
        .application_name("cdc-relay")
        .connect_timeout(Duration::from_secs(10));
    Ok(config)
}

/// Round-robin set of clients. A transaction holds its client for its
/// whole duration; independent queries run on different clients.
pub(crate) struct ClientPool {
    clients: Vec<Mutex<Client>>,
    next: AtomicUsize,
    connection_tasks: Vec<JoinHandle<()>>,
}

impl ClientPool {
    async fn connect(config: &tokio_postgres::Config, size: usize, name: &str) -> Result<Self> {
        let mut clients = Vec::with_capacity(size);
        let mut connection_tasks = Vec::with_capacity(size);
        for _ in 0..size {
            let (client, connection) = config.connect(NoTls).await?;
            let datastore = name.to_string();
            connection_tasks.push(tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!(datastore = %datastore, "Connection error: {}", e);
                }
            }));
            clients.push(Mutex::new(client));
        }
        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
            connection_tasks,
        })
    }

    pub(crate) async fn get(&self) -> MutexGuard<'_, Client> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        self.clients[index].lock().await
    }
}

impl Drop for ClientPool {
    fn drop(&mut self) {
        for task in &self.connection_tasks {
            task.abort();
        }
    }
}

/// Column of a live table, with the type OID used to interpret values.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PgColumn {
    pub name: String,
    pub type_id: u32,
    pub data_type: String,
    pub nullable: bool,
}

pub struct PostgresDatastore {
    name: String,
    settings: PostgresSettings,
    pool: ClientPool,
    columns: std::sync::Mutex<HashMap<TableRef, Arc<Vec<PgColumn>>>>,
    idle_scans: std::sync::Mutex<HashMap<TableRef, source::IdleScan>>,
    dead_letter_ready: OnceCell<()>,
}

impl PostgresDatastore {
    pub async fn connect(descriptor: &DatastoreDescriptor) -> Result<Self> {
        let settings = PostgresSettings::from_descriptor(descriptor)?;
        let config = client_config(descriptor)?;
        info!(
            datastore = %descriptor.name,
            pool_size = settings.pool_size,
            "Connecting to PostgreSQL"
        );
        let pool = ClientPool::connect(&config, settings.pool_size, &descriptor.name).await?;

        let datastore = Self {
            name: descriptor.name.clone(),
            settings,
            pool,
            columns: std::sync::Mutex::new(HashMap::new()),
            idle_scans: std::sync::Mutex::new(HashMap::new()),
            dead_letter_ready: OnceCell::new(),
        };
        if descriptor.capabilities().supports_log_cdc {
            datastore.check_wal_level().await?;
        }
        Ok(datastore)
    }

    pub fn settings(&self) -> &PostgresSettings {
        &self.settings
    }

    async fn check_wal_level(&self) -> Result<()> {
        let client = self.pool.get().await;
        let level: String = client.query_one("SHOW wal_level", &[]).await?.try_get(0)?;
        if level != "logical" {
            warn!(
                datastore = %self.name,
                wal_level = %level,
                "wal_level is not 'logical'; log capture will fail, use capture_mode = \"polling\""
            );
        }
        Ok(())
    }

    /// Reads the live column list, refreshing the cache.
    pub(crate) async fn load_columns(&self, table: &TableRef) -> Result<Arc<Vec<PgColumn>>> {
        let client = self.pool.get().await;
        let rows = client
            .query(
                "SELECT a.attname::text, a.atttypid, format_type(a.atttypid, a.atttypmod), \
                 NOT a.attnotnull \
                 FROM pg_attribute a \
                 WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped \
                 ORDER BY a.attnum",
                &[&qualified(table)],
            )
            .await?;
        if rows.is_empty() {
            return Err(Error::not_found("table", table.to_string()));
        }

        let columns = rows
            .iter()
            .map(|row| -> Result<PgColumn> {
                Ok(PgColumn {
                    name: row.try_get(0)?,
                    type_id: row.try_get(1)?,
                    data_type: row.try_get(2)?,
                    nullable: row.try_get(3)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let columns = Arc::new(columns);
        self.columns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(table.clone(), columns.clone());
        Ok(columns)
    }

    pub(crate) async fn columns(&self, table: &TableRef) -> Result<Arc<Vec<PgColumn>>> {
        let cached = self
            .columns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
            .cloned();
        match cached {
            Some(columns) => Ok(columns),
            None => self.load_columns(table).await,
        }
    }

    /// Columns, primary key and unique keys of a table.
    pub(crate) async fn describe(&self, table: &TableRef) -> Result<TableSchema> {
        let columns = self.load_columns(table).await?;

        let client = self.pool.get().await;
        let rows = client
            .query(
                "SELECT i.indisprimary, array_agg(a.attname::text ORDER BY k.ord) \
                 FROM pg_index i \
                 CROSS JOIN LATERAL unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord) \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum \
                 WHERE i.indrelid = to_regclass($1) AND i.indisunique \
                   AND i.indpred IS NULL AND i.indexprs IS NULL \
                 GROUP BY i.indexrelid, i.indisprimary \
                 ORDER BY i.indisprimary DESC, i.indexrelid",
                &[&qualified(table)],
            )
            .await?;

        let mut primary_key = Vec::new();
        let mut unique_keys = Vec::new();
        for row in rows {
            let is_primary: bool = row.try_get(0)?;
            let key: Vec<String> = row.try_get(1)?;
            if is_primary {
                primary_key = key;
            } else {
                unique_keys.push(key);
            }
        }

        Ok(TableSchema {
            table: table.clone(),
            columns: columns
                .iter()
                .map(|c| ColumnDef {
                    name: c.name.clone(),
                    data_type: c.data_type.clone(),
                    nullable: c.nullable,
                })
                .collect(),
            primary_key,
            unique_keys,
        })
    }
}

/// `"schema"."table"`
pub(crate) fn qualified(table: &TableRef) -> String {
    format!(
        "{}.{}",
        escape_identifier(&table.schema),
        escape_identifier(&table.table)
    )
}

/// Comma separated list of quoted column names.
pub(crate) fn column_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names
        .into_iter()
        .map(escape_identifier)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Rows of a simple query selecting `columns` in order. Simple queries
/// return text values, the same format logical decoding emits, so rows
/// read here compare equal to captured images.
pub(crate) fn text_rows(messages: Vec<SimpleQueryMessage>, columns: &[PgColumn]) -> Vec<Row> {
    messages
        .into_iter()
        .filter_map(|message| match message {
            SimpleQueryMessage::Row(row) => Some(
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| {
                        let value = match row.get(i) {
                            Some(text) => parse_text_value(text, column.type_id),
                            None => serde_json::Value::Null,
                        };
                        (column.name.clone(), value)
                    })
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

impl std::fmt::Debug for PostgresDatastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDatastore")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{DatastoreKind, Driver};

    #[test]
    fn test_settings_defaults_and_overrides() {
        let descriptor = DatastoreDescriptor::new("pg", DatastoreKind::Relational, Driver::Postgres);
        let settings = PostgresSettings::from_descriptor(&descriptor).unwrap();
        assert_eq!(settings.slot, "cdc_relay");
        assert_eq!(settings.pool_size, 4);
        assert_eq!(settings.audit_table, TableRef::new("public", "cdc_audit"));

        let descriptor = descriptor
            .with_option("slot", "orders_slot")
            .with_option("pool_size", "2")
            .with_option("dead_letter_table", "ops.dlq");
        let settings = PostgresSettings::from_descriptor(&descriptor).unwrap();
        assert_eq!(settings.slot, "orders_slot");
        assert_eq!(settings.pool_size, 2);
        assert_eq!(settings.dead_letter_table, TableRef::new("ops", "dlq"));
    }

    #[test]
    fn test_invalid_options_are_config_errors() {
        let descriptor = DatastoreDescriptor::new("pg", DatastoreKind::Relational, Driver::Postgres)
            .with_option("pool_size", "many");
        assert!(matches!(
            PostgresSettings::from_descriptor(&descriptor),
            Err(Error::Config(_))
        ));

        let descriptor = DatastoreDescriptor::new("pg", DatastoreKind::Relational, Driver::Postgres)
            .with_option("audit_table", "no_schema");
        assert!(PostgresSettings::from_descriptor(&descriptor).is_err());
    }

    #[test]
    fn test_client_config_from_options() {
        let descriptor = DatastoreDescriptor::new("pg", DatastoreKind::Relational, Driver::Postgres)
            .with_option("host", "db.internal")
            .with_option("port", "6543")
            .with_option("database", "app");
        let config = client_config(&descriptor).unwrap();
        assert_eq!(config.get_ports(), &[6543]);
        assert_eq!(config.get_dbname(), Some("app"));

        let descriptor = DatastoreDescriptor::new("pg", DatastoreKind::Relational, Driver::Postgres)
            .with_option("url", "postgresql://replicator@db:5433/orders");
        let config = client_config(&descriptor).unwrap();
        assert_eq!(config.get_user(), Some("replicator"));
        assert_eq!(config.get_dbname(), Some("orders"));
    }

    #[test]
    fn test_quoting_helpers() {
        assert_eq!(
            qualified(&TableRef::new("public", "Users")),
            "\"public\".\"Users\""
        );
        assert_eq!(column_list(["id", "name"]), "\"id\", \"name\"");
    }
}
