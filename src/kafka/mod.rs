//! Kafka driver: an apply-only queue target.
//!
//! Every target table maps to one topic, `<topic_prefix>.<schema>.<table>`.
//! Rows cannot be read back, so subscriptions writing here behave as
//! source-wins and never detect conflicts.
//!
//! Connection options (`[datastores.connection]`):
//!
//! | key | default |
//! |---|---|
//! | `brokers` | required, comma separated |
//! | `topic_prefix` | `cdc` |
//! | `format` | `json_compact` (`json`, `json_debezium`) |
//! | `key_strategy` | `primary_key` (`table`, `none`, `fields:a,b.c`) |
//! | `compression`, `acks` | `snappy`, `all` |
//! | `linger_ms`, `batch_size`, `message_timeout_ms` | `100`, `16384`, `30000` |
//! | `auto_create_topics` | `true` |
//! | `partitions`, `replication_factor` | `3`, `1` |
//! | `sasl_username`, `sasl_mechanism`, `security_protocol` | unset, `PLAIN`, `SASL_SSL` |

pub mod key_strategy;
pub mod producer;
pub mod serializer;
pub mod target;
pub mod topic_manager;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use crate::datastore::{Connection, DatastoreDescriptor};
use crate::event::TableRef;
use crate::{Error, Result};

pub use key_strategy::KeyStrategy;
pub use producer::KafkaProducer;
pub use serializer::{JsonSerializer, SerializationFormat};
pub use target::KafkaTarget;
pub use topic_manager::TopicManager;

/// Connects a Kafka datastore. It can only serve as a target.
pub async fn connect(descriptor: &DatastoreDescriptor) -> Result<Connection> {
    let target = KafkaTarget::connect(descriptor).await?;
    Ok(Connection::target_only(Arc::new(target)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    pub topic_prefix: String,
    pub format: SerializationFormat,
    pub key_strategy: KeyStrategy,
    pub compression: String,
    pub acks: String,
    pub linger_ms: u32,
    pub batch_size: usize,
    pub message_timeout_ms: u64,
    pub auto_create_topics: bool,
    pub partitions: i32,
    pub replication_factor: i32,
    pub sasl_username: Option<String>,
    pub sasl_mechanism: String,
    pub security_protocol: String,
}

impl KafkaSettings {
    pub fn from_descriptor(descriptor: &DatastoreDescriptor) -> Result<Self> {
        let brokers: Vec<String> = descriptor
            .option("brokers")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(String::from)
            .collect();
        if brokers.is_empty() {
            return Err(Error::Config(format!(
                "datastore '{}': kafka requires at least one broker",
                descriptor.name
            )));
        }

        Ok(Self {
            brokers,
            topic_prefix: descriptor.option("topic_prefix").unwrap_or("cdc").to_string(),
            format: descriptor.parsed_option("format", SerializationFormat::JsonCompact)?,
            key_strategy: descriptor.parsed_option("key_strategy", KeyStrategy::PrimaryKey)?,
            compression: descriptor.option("compression").unwrap_or("snappy").to_string(),
            acks: descriptor.option("acks").unwrap_or("all").to_string(),
            linger_ms: descriptor.parsed_option("linger_ms", 100)?,
            batch_size: descriptor.parsed_option("batch_size", 16_384)?,
            message_timeout_ms: descriptor.parsed_option("message_timeout_ms", 30_000)?,
            auto_create_topics: descriptor.parsed_option("auto_create_topics", true)?,
            partitions: descriptor.parsed_option("partitions", 3)?,
            replication_factor: descriptor.parsed_option("replication_factor", 1)?,
            sasl_username: descriptor.option("sasl_username").map(String::from),
            sasl_mechanism: descriptor.option("sasl_mechanism").unwrap_or("PLAIN").to_string(),
            security_protocol: descriptor
                .option("security_protocol")
                .unwrap_or("SASL_SSL")
                .to_string(),
        })
    }

    /// Topic receiving the changes of `table`.
    pub fn topic_name(&self, table: &TableRef) -> String {
        format!("{}.{}.{}", self.topic_prefix, table.schema, table.table)
    }

    pub fn dead_letter_topic(&self) -> String {
        format!("{}.dead_letter", self.topic_prefix)
    }
}
