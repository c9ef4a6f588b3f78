use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::producer::client_config;
use super::KafkaSettings;
use crate::Result;

pub struct TopicManager {
    admin_client: AdminClient<DefaultClientContext>,
    default_partitions: i32,
    default_replication_factor: i32,
    known_topics: Mutex<HashSet<String>>,
}

impl TopicManager {
    pub fn new(settings: &KafkaSettings, password: Option<String>) -> Result<Self> {
        let admin_client: AdminClient<_> = client_config(settings, password).create()?;
        Ok(Self {
            admin_client,
            default_partitions: settings.partitions,
            default_replication_factor: settings.replication_factor,
            known_topics: Mutex::new(HashSet::new()),
        })
    }

    /// Creates the topic unless it was already seen or already exists.
    #[instrument(skip(self))]
    pub async fn ensure_topic_exists(&self, topic_name: &str) -> Result<()> {
        let mut known = self.known_topics.lock().await;
        if known.contains(topic_name) {
            debug!("Topic '{}' already verified to exist", topic_name);
            return Ok(());
        }
        self.create_topic(topic_name).await?;
        known.insert(topic_name.to_string());
        Ok(())
    }

    async fn create_topic(&self, topic_name: &str) -> Result<()> {
        let new_topic = NewTopic::new(
            topic_name,
            self.default_partitions,
            TopicReplication::Fixed(self.default_replication_factor),
        )
        .set("cleanup.policy", "delete")
        .set("retention.ms", "604800000"); // 7 days

        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(30)));
        let results = self.admin_client.create_topics(&[new_topic], &opts).await?;

        for result in results {
            match result {
                Ok(topic) => info!("Created topic: {}", topic),
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!("Topic '{}' already exists", topic)
                }
                Err((_topic, error)) => return Err(KafkaError::AdminOp(error).into()),
            }
        }
        Ok(())
    }
}
