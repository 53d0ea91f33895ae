//! Publishes to a broker topic with message key = idempotency key.

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;

use super::Result;

/// Thin wrapper over `rdkafka`'s `FutureProducer`, fixed to one topic.
pub struct BrokerProducer {
    producer: FutureProducer,
    topic: String,
}

impl BrokerProducer {
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "30000")
            .create()?;
        Ok(Self {
            producer,
            topic: topic.into(),
        })
    }

    /// Sends one message keyed by `key`, waiting for broker
    /// acknowledgement before returning.
    pub async fn send(&self, key: &str, payload: &str) -> Result<()> {
        self.producer
            .send(
                FutureRecord::to(&self.topic).key(key).payload(payload),
                Timeout::Never,
            )
            .await
            .map_err(|(err, _msg)| err)?;
        Ok(())
    }

    /// Sends a whole batch concurrently; the first failure is
    /// returned and aborts the rest of the batch from the caller's
    /// point of view. In-flight sends are not cancelled, but their
    /// results are discarded: any send error fails the whole drain.
    pub async fn send_batch(&self, items: &[(String, String)]) -> Result<()> {
        let sends = items
            .iter()
            .map(|(key, payload)| self.send(key, payload));
        futures::future::try_join_all(sends).await?;
        Ok(())
    }
}
