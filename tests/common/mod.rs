#![allow(dead_code)]

use cdc_relay::datastore::{Connection, CredentialRef, DatastoreDescriptor, DatastoreKind, Driver};
use cdc_relay::mapping::{ColumnDef, TableSchema};
use cdc_relay::{Config, DatastoreRegistry, Engine, MemoryDatastore, Row, TableRef};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// One memory source (`src`) replicating `public.users` into a memory
/// target (`dst`) as `replica.users`.
pub const USERS_CONFIG: &str = r#"
    [engine]
    shutdown_timeout_secs = 5

    [[datastores]]
    name = "src"
    kind = "relational"
    driver = "memory"

    [[datastores]]
    name = "dst"
    kind = "relational"
    driver = "memory"

    [[channels]]
    name = "users"
    source = "src"
    target = "dst"
    batch_size = 10
    batch_timeout_secs = 0.02
    poll_interval_ms = 5

    [[channels.tables]]
    source_schema = "public"
    source_table = "users"
    target_schema = "replica"

    [[subscriptions]]
    name = "users-sub"
    channel = "users"
    retry = { max_attempts = 5, backoff_secs = 0.01 }
"#;

pub struct Pipeline {
    pub dir: TempDir,
    pub engine: Engine,
    pub source: Arc<MemoryDatastore>,
    pub target: Arc<MemoryDatastore>,
}

pub fn users() -> TableRef {
    TableRef::new("public", "users")
}

pub fn replica_users() -> TableRef {
    TableRef::new("replica", "users")
}

pub fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().expect("row literal must be an object")
}

pub fn users_schema(table: TableRef) -> TableSchema {
    TableSchema {
        table,
        columns: vec![ColumnDef::new("id", "integer"), ColumnDef::new("name", "text")],
        primary_key: vec!["id".into()],
        unique_keys: vec![],
    }
}

pub fn memory_store(tables: &[TableRef]) -> Arc<MemoryDatastore> {
    let store = Arc::new(MemoryDatastore::new());
    for table in tables {
        store.create_table(users_schema(table.clone()));
    }
    store
}

/// Builds an engine over preregistered memory stores.
pub async fn pipeline_with(
    config: &str,
    source: Arc<MemoryDatastore>,
    target: Arc<MemoryDatastore>,
) -> Pipeline {
    let dir = TempDir::new().unwrap();
    let mut config = Config::from_toml_str(config).unwrap();
    config.engine.state_dir = dir.path().to_path_buf();

    let registry = Arc::new(DatastoreRegistry::new());
    for (name, store) in [("src", source.clone()), ("dst", target.clone())] {
        registry
            .register_with(
                DatastoreDescriptor::new(name, DatastoreKind::Relational, Driver::Memory),
                Connection::both(store),
            )
            .unwrap();
    }

    Pipeline {
        engine: Engine::new(config, registry).await.unwrap(),
        dir,
        source,
        target,
    }
}

pub async fn pipeline(config: &str) -> Pipeline {
    pipeline_with(
        config,
        memory_store(&[users()]),
        memory_store(&[replica_users()]),
    )
    .await
}

/// Polls `condition` until it holds, failing the test after 10 seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

/// PostgreSQL descriptor from the `TEST_PG_*` environment.
pub fn pg_descriptor(name: &str) -> DatastoreDescriptor {
    let pid = std::process::id();
    let mut descriptor = DatastoreDescriptor::new(name, DatastoreKind::Relational, Driver::Postgres)
        .with_option("host", env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".into()))
        .with_option("port", env::var("TEST_PG_PORT").unwrap_or_else(|_| "5432".into()))
        .with_option(
            "database",
            env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".into()),
        )
        .with_option("user", env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".into()))
        .with_option("slot", format!("test_slot_{}", pid))
        .with_option("publication", format!("test_publication_{}", pid));
    if env::var("TEST_PG_PASSWORD").is_ok() {
        descriptor.credential = Some(CredentialRef::Env("TEST_PG_PASSWORD".into()));
    }
    descriptor
}

/// Plain client for test setup, using the same environment.
pub async fn pg_client() -> tokio_postgres::Client {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".into()))
        .port(
            env::var("TEST_PG_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
        )
        .dbname(&env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".into()))
        .user(&env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".into()))
        .password(env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".into()));

    let (client, connection) = config.connect(tokio_postgres::NoTls).await.unwrap();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("test connection error: {}", e);
        }
    });
    client
}
