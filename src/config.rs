//! Per-binary configuration, read once at startup from the
//! environment variables named in the external-interfaces contract.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(String),
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name.to_string()))
}

fn optional_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Configuration for the back tier: HTTP front door, `TaskStore`,
/// `OutboxPump`, `SessionRegistry`.
#[derive(Debug, Clone)]
pub struct BackConfig {
    pub address: String,
    pub database_dsn: String,
    pub s3_access_key_id: String,
    pub s3_secret_access_key: String,
    pub s3_bucket_name: String,
    pub jwt_secret: String,
    pub kafka_address: String,
    pub kafka_topic: String,
    pub kafka_topic_result: String,
    pub kafka_consumer_group: String,
    pub redis_address: String,
    pub outbox_interval: Duration,
}

impl BackConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            address: required("BACK_ADDRESS")?,
            database_dsn: required("DATABASE_DSN")?,
            s3_access_key_id: required("S3_ACCESSKEYID")?,
            s3_secret_access_key: required("S3_SECRETACCESSKEY")?,
            s3_bucket_name: required("S3_BUCKETNAME")?,
            jwt_secret: required("JWT_SECRET")?,
            kafka_address: required("KAFKA_ADDRESS")?,
            kafka_topic: required("KAFKA_TOPIC")?,
            kafka_topic_result: required("KAFKA_TOPIC_RESULT")?,
            kafka_consumer_group: required("KAFKA_CONSUMER_GROUP")?,
            redis_address: required("REDIS_ADDRESS")?,
            outbox_interval: Duration::from_secs(optional_parsed("OUTBOX_INTERVAL_SECS", 3)),
        })
    }
}

/// Configuration for the worker tier: broker consumer/producer,
/// `IdempotencyGuard`, object store, upscaler invocation.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_dsn: String,
    pub s3_access_key_id: String,
    pub s3_secret_access_key: String,
    pub s3_bucket_name: String,
    pub kafka_address: String,
    pub kafka_topic: String,
    pub kafka_topic_result: String,
    pub kafka_consumer_group: String,
    pub redis_address: String,
    pub worker_slots: usize,
    pub idempotency_ttl: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_dsn: required("DATABASE_DSN")?,
            s3_access_key_id: required("S3_ACCESSKEYID")?,
            s3_secret_access_key: required("S3_SECRETACCESSKEY")?,
            s3_bucket_name: required("S3_BUCKETNAME")?,
            kafka_address: required("KAFKA_ADDRESS")?,
            kafka_topic: required("KAFKA_TOPIC")?,
            kafka_topic_result: required("KAFKA_TOPIC_RESULT")?,
            kafka_consumer_group: required("KAFKA_CONSUMER_GROUP")?,
            redis_address: required("REDIS_ADDRESS")?,
            worker_slots: optional_parsed("WORKER_SLOTS", 1),
            idempotency_ttl: Duration::from_secs(optional_parsed(
                "IDEMPOTENCY_TTL_SECS",
                24 * 60 * 60,
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_parsed_falls_back_on_unset_var() {
        std::env::remove_var("DOES_NOT_EXIST_UPSCALER_VAR");
        let v: u64 = optional_parsed("DOES_NOT_EXIST_UPSCALER_VAR", 7);
        assert_eq!(v, 7);
    }

    #[test]
    fn optional_parsed_falls_back_on_unparseable_value() {
        std::env::set_var("UPSCALER_TEST_BAD_NUMBER", "not-a-number");
        let v: u64 = optional_parsed("UPSCALER_TEST_BAD_NUMBER", 9);
        assert_eq!(v, 9);
        std::env::remove_var("UPSCALER_TEST_BAD_NUMBER");
    }
}
