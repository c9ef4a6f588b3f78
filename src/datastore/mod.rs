//! Datastores: descriptors, the pluggable capture/apply interface, and
//! the registry that resolves names to lazily connected handles.

pub mod memory;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::apply::DeadLetterRecord;
use crate::capture::CaptureMode;
use crate::checkpoint::Checkpoint;
use crate::event::{CapturedChange, ChangeOperation, Row, SequenceNumber, TableRef};
use crate::mapping::TableSchema;
use crate::{Error, Result};

pub use memory::MemoryDatastore;
pub use registry::{DatastoreHandle, DatastoreRegistry, RegistryEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreKind {
    Relational,
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    Postgres,
    Kafka,
    Memory,
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Driver::Postgres => "postgres",
            Driver::Kafka => "kafka",
            Driver::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Where a secret comes from. Secrets are never written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialRef {
    /// Name of an environment variable
    Env(String),
    /// Path of a file holding the secret
    File(PathBuf),
}

impl CredentialRef {
    pub fn resolve(&self) -> Result<String> {
        match self {
            CredentialRef::Env(var) => std::env::var(var).map_err(|_| {
                Error::Config(format!("credential variable '{}' is not set", var))
            }),
            CredentialRef::File(path) => std::fs::read_to_string(path)
                .map(|s| s.trim_end_matches(['\n', '\r']).to_string())
                .map_err(|e| {
                    Error::Config(format!("cannot read credential file {:?}: {}", path, e))
                }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_log_cdc: bool,
    pub supports_transactional_apply: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastoreDescriptor {
    pub name: String,
    pub kind: DatastoreKind,
    pub driver: Driver,
    /// Driver-specific connection settings (host, port, database, brokers, ...)
    #[serde(default)]
    pub connection: BTreeMap<String, String>,
    #[serde(default)]
    pub credential: Option<CredentialRef>,
    /// Overrides the driver default; cannot enable what the driver lacks.
    #[serde(default)]
    pub supports_log_cdc: Option<bool>,
    #[serde(default)]
    pub supports_transactional_apply: Option<bool>,
    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,
}

impl DatastoreDescriptor {
    pub fn new(name: impl Into<String>, kind: DatastoreKind, driver: Driver) -> Self {
        Self {
            name: name.into(),
            kind,
            driver,
            connection: BTreeMap::new(),
            credential: None,
            supports_log_cdc: None,
            supports_transactional_apply: None,
            connect_max_attempts: default_connect_max_attempts(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<String>) -> Self {
        self.connection.insert(key.to_string(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.connection.get(key).map(String::as_str)
    }

    /// Parses an option, falling back to `default` when it is unset.
    pub fn parsed_option<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.option(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| {
                Error::Config(format!(
                    "datastore '{}': invalid {} '{}'",
                    self.name, key, value
                ))
            }),
        }
    }

    /// Driver capabilities narrowed by the configured flags.
    pub fn capabilities(&self) -> Capabilities {
        let driver = match self.driver {
            Driver::Postgres | Driver::Memory => Capabilities {
                supports_log_cdc: true,
                supports_transactional_apply: true,
            },
            Driver::Kafka => Capabilities {
                supports_log_cdc: false,
                supports_transactional_apply: false,
            },
        };
        Capabilities {
            supports_log_cdc: driver.supports_log_cdc && self.supports_log_cdc.unwrap_or(true),
            supports_transactional_apply: driver.supports_transactional_apply
                && self.supports_transactional_apply.unwrap_or(true),
        }
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("datastore name must not be empty".into()));
        }
        let expected = match self.driver {
            Driver::Kafka => DatastoreKind::Queue,
            Driver::Postgres | Driver::Memory => DatastoreKind::Relational,
        };
        if self.kind != expected {
            return Err(Error::Config(format!(
                "datastore '{}': driver {} requires kind {:?}",
                self.name, self.driver, expected
            )));
        }
        Ok(())
    }
}

fn default_connect_max_attempts() -> u32 {
    8
}

/// Rows and the log position they are consistent with.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub rows: Vec<Row>,
    pub checkpoint: SequenceNumber,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Upsert(Row),
    Delete,
}

/// One keyed row write against a target table.
#[derive(Debug, Clone, PartialEq)]
pub struct RowWrite {
    pub table: TableRef,
    pub key: Row,
    pub op: WriteOp,
    pub source_op: ChangeOperation,
    pub sequence: SequenceNumber,
}

/// Capture side of a datastore driver.
#[async_trait]
pub trait SourceConnection: Send + Sync {
    async fn describe_table(&self, table: &TableRef) -> Result<TableSchema>;

    /// Changes of `table` strictly after `after`, oldest first, from the
    /// transaction log. Fails with `LogGap` when the log no longer holds
    /// every change after `after`.
    async fn read_log(
        &self,
        table: &TableRef,
        after: SequenceNumber,
        limit: usize,
    ) -> Result<Vec<CapturedChange>>;

    /// Changes of `table` strictly after `after` from the audit table.
    async fn poll_audit(
        &self,
        table: &TableRef,
        after: SequenceNumber,
        limit: usize,
    ) -> Result<Vec<CapturedChange>>;

    /// Current rows, read atomically with the position they reflect.
    /// The position is expressed in the sequence space of `mode`.
    async fn snapshot(&self, table: &TableRef, mode: CaptureMode) -> Result<Snapshot>;

    /// Lets the source release log entries every table in `tables` has
    /// committed. A table without a checkpoint entry holds the log back.
    async fn acknowledge(
        &self,
        _checkpoint: &Checkpoint,
        _tables: &[TableRef],
        _mode: CaptureMode,
    ) -> Result<()> {
        Ok(())
    }
}

/// Apply side of a datastore driver.
#[async_trait]
pub trait TargetConnection: Send + Sync {
    /// `None` for schemaless targets such as queues.
    async fn describe_table(&self, table: &TableRef) -> Result<Option<TableSchema>>;

    async fn fetch_row(&self, table: &TableRef, key: &Row) -> Result<Option<Row>>;

    /// Whether `fetch_row` reflects the target's state.
    fn supports_read_back(&self) -> bool {
        true
    }

    /// Applies writes in order. With `transactional`, either all become
    /// visible or none do.
    async fn apply(&self, writes: &[RowWrite], transactional: bool) -> Result<()>;

    async fn write_dead_letter(&self, record: &DeadLetterRecord) -> Result<()>;

    async fn dead_letters(&self, subscription: &str) -> Result<Vec<DeadLetterRecord>>;
}

/// Established connection: the roles a driver provides.
#[derive(Clone, Default)]
pub struct Connection {
    pub source: Option<Arc<dyn SourceConnection>>,
    pub target: Option<Arc<dyn TargetConnection>>,
}

impl Connection {
    pub fn both<T>(driver: Arc<T>) -> Self
    where
        T: SourceConnection + TargetConnection + 'static,
    {
        Self {
            source: Some(driver.clone()),
            target: Some(driver),
        }
    }

    pub fn target_only<T: TargetConnection + 'static>(driver: Arc<T>) -> Self {
        Self {
            source: None,
            target: Some(driver),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("source", &self.source.is_some())
            .field("target", &self.target.is_some())
            .finish()
    }
}
