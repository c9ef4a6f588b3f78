use std::time::Duration;

use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tracing::debug;

use super::KafkaSettings;
use crate::{Error, Result};

pub struct KafkaProducer {
    producer: FutureProducer,
    queue_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(settings: &KafkaSettings, password: Option<String>) -> Result<Self> {
        let producer: FutureProducer = client_config(settings, password).create()?;
        Ok(Self {
            producer,
            queue_timeout: Duration::from_millis(settings.message_timeout_ms),
        })
    }

    /// Sends one message and waits for the broker acknowledgement.
    pub async fn send(&self, topic: &str, key: Option<&str>, payload: &str) -> Result<()> {
        let mut record = FutureRecord::<str, str>::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        let (partition, offset) = self
            .producer
            .send(record, self.queue_timeout)
            .await
            .map_err(|(e, _)| Error::Kafka(e))?;
        debug!(topic, partition, offset, "Delivered message");
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.producer.flush(self.queue_timeout)?;
        Ok(())
    }
}

pub(crate) fn client_config(settings: &KafkaSettings, password: Option<String>) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", settings.brokers.join(","))
        .set("compression.type", &settings.compression)
        .set("acks", &settings.acks)
        .set("linger.ms", settings.linger_ms.to_string())
        .set("batch.size", settings.batch_size.to_string())
        .set("message.timeout.ms", settings.message_timeout_ms.to_string());
    // Keeps per-partition order across retries
    if settings.acks == "all" {
        config.set("enable.idempotence", "true");
    }
    if let Some(username) = &settings.sasl_username {
        config
            .set("security.protocol", &settings.security_protocol)
            .set("sasl.mechanism", &settings.sasl_mechanism)
            .set("sasl.username", username)
            .set("sasl.password", password.unwrap_or_default());
    }
    config
}
