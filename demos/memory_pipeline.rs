use cdc_relay::datastore::{Connection, DatastoreKind, Driver};
use cdc_relay::mapping::{ColumnDef, TableSchema};
use cdc_relay::{
    Config, DatastoreDescriptor, DatastoreRegistry, Engine, MemoryDatastore, Row, TableRef,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

const CONFIG: &str = r#"
    [engine]
    shutdown_timeout_secs = 5

    [[datastores]]
    name = "ledger"
    kind = "relational"
    driver = "memory"

    [[datastores]]
    name = "reporting"
    kind = "relational"
    driver = "memory"

    [[channels]]
    name = "accounts"
    source = "ledger"
    target = "reporting"
    batch_size = 50
    batch_timeout_secs = 0.05

    [[channels.tables]]
    source_schema = "public"
    source_table = "accounts"
    target_schema = "reporting"
    initial_snapshot = true
    columns = [
        { source = "id", target = "account_id" },
        { source = "balance", target = "balance" },
    ]

    [[subscriptions]]
    name = "accounts-reporting"
    channel = "accounts"
    on_error = "route-to-dlq"
"#;

fn schema(table: TableRef, key: &str) -> TableSchema {
    TableSchema {
        table,
        columns: vec![ColumnDef::new(key, "integer"), ColumnDef::new("balance", "numeric")],
        primary_key: vec![key.to_string()],
        unique_keys: vec![],
    }
}

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("cdc_relay=debug,info")
        .init();

    let accounts = TableRef::new("public", "accounts");
    let reporting = TableRef::new("reporting", "accounts");

    let ledger = Arc::new(MemoryDatastore::new());
    ledger.create_table(schema(accounts.clone(), "id"));
    let target = Arc::new(MemoryDatastore::new());
    target.create_table(schema(reporting.clone(), "account_id"));

    // Rows present before the subscription starts arrive via the snapshot
    for id in 1..=3 {
        ledger.insert(&accounts, row(json!({"id": id, "balance": 100 * id})))?;
    }

    let registry = Arc::new(DatastoreRegistry::new());
    registry.register_with(
        DatastoreDescriptor::new("ledger", DatastoreKind::Relational, Driver::Memory),
        Connection::both(ledger.clone()),
    )?;
    registry.register_with(
        DatastoreDescriptor::new("reporting", DatastoreKind::Relational, Driver::Memory),
        Connection::both(target.clone()),
    )?;

    // Memory stores restart from scratch, so checkpoints must too
    let state_dir = tempfile::TempDir::new()?;
    let mut config = Config::from_toml_str(CONFIG)?;
    config.engine.state_dir = state_dir.path().to_path_buf();

    let engine = Engine::new(config, registry).await?;
    let state = engine.start("accounts-reporting").await?;
    info!("Subscription is {}", state);

    ledger.update(&accounts, row(json!({"id": 2, "balance": 250})))?;
    ledger.delete(&accounts, row(json!({"id": 3})))?;
    let head = ledger.insert(&accounts, row(json!({"id": 4, "balance": 400})))?;

    let status = engine
        .subscription("accounts-reporting")?
        .wait_for(|s| s.last_checkpoint.get("public.accounts") == Some(&head))
        .await?;
    info!("Caught up: {}", serde_json::to_string_pretty(&status)?);

    for account in target.rows(&reporting) {
        info!("reporting.accounts: {}", serde_json::Value::Object(account));
    }

    engine.shutdown().await;
    Ok(())
}
