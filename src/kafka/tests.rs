use super::*;
use crate::datastore::{DatastoreKind, Driver, RowWrite, TargetConnection, WriteOp};
use crate::event::{ChangeOperation, SequenceNumber};
use serde_json::{json, Value};

fn descriptor() -> DatastoreDescriptor {
    DatastoreDescriptor::new("events", DatastoreKind::Queue, Driver::Kafka)
        .with_option("brokers", "localhost:9092, localhost:9093")
        .with_option("topic_prefix", "test")
}

fn write(source_op: ChangeOperation, op: WriteOp) -> RowWrite {
    RowWrite {
        table: TableRef::new("replica", "users"),
        key: json!({"id": 1}).as_object().cloned().unwrap(),
        op,
        source_op,
        sequence: SequenceNumber::new(42, 3),
    }
}

fn upsert(source_op: ChangeOperation) -> RowWrite {
    let row = json!({"name": "Alice", "email": "alice@example.com"});
    write(source_op, WriteOp::Upsert(row.as_object().cloned().unwrap()))
}

#[test]
fn test_settings_defaults() {
    let settings = KafkaSettings::from_descriptor(&descriptor()).unwrap();
    assert_eq!(settings.brokers, vec!["localhost:9092", "localhost:9093"]);
    assert_eq!(settings.format, SerializationFormat::JsonCompact);
    assert_eq!(settings.key_strategy, KeyStrategy::PrimaryKey);
    assert_eq!(settings.acks, "all");
    assert!(settings.auto_create_topics);
    assert_eq!(settings.sasl_username, None);
}

#[test]
fn test_settings_require_brokers() {
    let bare = DatastoreDescriptor::new("events", DatastoreKind::Queue, Driver::Kafka);
    assert!(matches!(
        KafkaSettings::from_descriptor(&bare),
        Err(Error::Config(_))
    ));

    let bad = descriptor().with_option("format", "avro");
    assert!(KafkaSettings::from_descriptor(&bad).is_err());
}

#[test]
fn test_topic_name_generation() {
    let settings = KafkaSettings::from_descriptor(&descriptor()).unwrap();
    assert_eq!(
        settings.topic_name(&TableRef::new("replica", "users")),
        "test.replica.users"
    );
    assert_eq!(settings.dead_letter_topic(), "test.dead_letter");
}

#[test]
fn test_compact_envelope() {
    let serializer = JsonSerializer::new(SerializationFormat::JsonCompact);
    let encoded = serializer.serialize(&upsert(ChangeOperation::Insert)).unwrap();
    assert!(!encoded.contains('\n'));

    let parsed: Value = serde_json::from_str(&encoded).unwrap();
    assert_eq!(parsed["op"], "INSERT");
    assert_eq!(parsed["table"], "replica.users");
    assert_eq!(parsed["key"], json!({"id": 1}));
    assert_eq!(parsed["after"]["id"], 1);
    assert_eq!(parsed["after"]["name"], "Alice");
    assert_eq!(parsed["sequence"], "42:3");
}

#[test]
fn test_pretty_envelope() {
    let serializer = JsonSerializer::new(SerializationFormat::Json);
    let encoded = serializer.serialize(&upsert(ChangeOperation::Update)).unwrap();
    assert!(encoded.contains("\"op\": \"UPDATE\""));
    assert!(encoded.contains('\n'));
}

#[test]
fn test_debezium_envelope() {
    let serializer = JsonSerializer::new(SerializationFormat::JsonDebezium);

    let insert: Value =
        serde_json::from_str(&serializer.serialize(&upsert(ChangeOperation::Insert)).unwrap())
            .unwrap();
    assert_eq!(insert["payload"]["op"], "c");
    assert_eq!(insert["payload"]["before"], Value::Null);
    assert_eq!(insert["payload"]["source"]["connector"], "cdc-relay");
    assert_eq!(insert["payload"]["source"]["table"], "users");

    // An update that moves the row out of the filter removes it downstream
    let removed = write(ChangeOperation::Update, WriteOp::Delete);
    let delete: Value =
        serde_json::from_str(&serializer.serialize(&removed).unwrap()).unwrap();
    assert_eq!(delete["payload"]["op"], "d");
    assert_eq!(delete["payload"]["before"], json!({"id": 1}));
    assert_eq!(delete["payload"]["after"], Value::Null);
}

#[tokio::test]
async fn test_producer_creation_without_broker() {
    // Creating the producer does not contact the brokers
    let settings = KafkaSettings::from_descriptor(&descriptor()).unwrap();
    assert!(KafkaProducer::new(&settings, None).is_ok());
}

#[tokio::test]
#[ignore] // Requires running Kafka, TEST_KAFKA_BROKERS
async fn test_publish_row_writes() {
    let brokers =
        std::env::var("TEST_KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string());
    let descriptor = descriptor().with_option("brokers", brokers);
    let target = KafkaTarget::connect(&descriptor).await.unwrap();

    assert!(!target.supports_read_back());
    target
        .apply(
            &[
                upsert(ChangeOperation::Insert),
                write(ChangeOperation::Delete, WriteOp::Delete),
            ],
            false,
        )
        .await
        .unwrap();
    assert!(matches!(
        target.dead_letters("sub").await,
        Err(Error::Unsupported(_))
    ));
}
