//! Broker plumbing for the `T_req`/`T_res` topics.

pub mod consumer;
pub mod producer;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

pub use consumer::BrokerConsumer;
pub use producer::BrokerProducer;
