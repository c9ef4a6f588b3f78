use async_trait::async_trait;
use futures::future::try_join_all;
use std::fmt;
use tracing::{debug, info, warn};

use super::{JsonSerializer, KafkaProducer, KafkaSettings, TopicManager};
use crate::apply::DeadLetterRecord;
use crate::datastore::{DatastoreDescriptor, RowWrite, TargetConnection};
use crate::event::{Row, TableRef};
use crate::mapping::TableSchema;
use crate::{Error, Result};

/// Publishes row writes as messages, one topic per target table.
pub struct KafkaTarget {
    name: String,
    settings: KafkaSettings,
    producer: KafkaProducer,
    serializer: JsonSerializer,
    topics: Option<TopicManager>,
}

impl KafkaTarget {
    pub async fn connect(descriptor: &DatastoreDescriptor) -> Result<Self> {
        let settings = KafkaSettings::from_descriptor(descriptor)?;
        let password = descriptor
            .credential
            .as_ref()
            .map(|credential| credential.resolve())
            .transpose()?;

        let producer = KafkaProducer::new(&settings, password.clone())?;
        let topics = if settings.auto_create_topics {
            Some(TopicManager::new(&settings, password)?)
        } else {
            None
        };
        info!(
            datastore = %descriptor.name,
            brokers = %settings.brokers.join(","),
            topic_prefix = %settings.topic_prefix,
            "Kafka producer ready"
        );

        Ok(Self {
            name: descriptor.name.clone(),
            serializer: JsonSerializer::new(settings.format),
            settings,
            producer,
            topics,
        })
    }

    async fn ensure_topic(&self, topic: &str) -> Result<()> {
        match &self.topics {
            Some(manager) => manager.ensure_topic_exists(topic).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TargetConnection for KafkaTarget {
    async fn describe_table(&self, _table: &TableRef) -> Result<Option<TableSchema>> {
        Ok(None)
    }

    async fn fetch_row(&self, _table: &TableRef, _key: &Row) -> Result<Option<Row>> {
        Ok(None)
    }

    fn supports_read_back(&self) -> bool {
        false
    }

    /// Enqueues every write before awaiting deliveries. Order holds per
    /// partition since the producer is idempotent.
    async fn apply(&self, writes: &[RowWrite], transactional: bool) -> Result<()> {
        if transactional {
            warn!(datastore = %self.name, "Kafka writes are not transactional");
        }

        let mut messages = Vec::with_capacity(writes.len());
        for write in writes {
            let topic = self.settings.topic_name(&write.table);
            self.ensure_topic(&topic).await?;
            let key = self.settings.key_strategy.extract_key(write);
            let payload = self.serializer.serialize(write)?;
            messages.push((topic, key, payload));
        }

        try_join_all(
            messages
                .iter()
                .map(|(topic, key, payload)| self.producer.send(topic, key.as_deref(), payload)),
        )
        .await?;
        debug!(datastore = %self.name, messages = messages.len(), "Published writes");
        Ok(())
    }

    async fn write_dead_letter(&self, record: &DeadLetterRecord) -> Result<()> {
        let topic = self.settings.dead_letter_topic();
        self.ensure_topic(&topic).await?;
        let payload = serde_json::to_string(record)?;
        self.producer
            .send(&topic, Some(&record.subscription), &payload)
            .await
    }

    async fn dead_letters(&self, _subscription: &str) -> Result<Vec<DeadLetterRecord>> {
        Err(Error::Unsupported(format!(
            "datastore '{}' cannot list dead letters; consume topic '{}' instead",
            self.name,
            self.settings.dead_letter_topic()
        )))
    }
}

impl Drop for KafkaTarget {
    fn drop(&mut self) {
        if let Err(e) = self.producer.flush() {
            warn!(datastore = %self.name, "Failed to flush producer: {}", e);
        }
    }
}

impl fmt::Debug for KafkaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaTarget")
            .field("name", &self.name)
            .field("brokers", &self.settings.brokers)
            .field("topic_prefix", &self.settings.topic_prefix)
            .finish()
    }
}
