//! Worker tier entry point: consumes `T_req`, runs the upscaler, and
//! produces to `T_res`.

use std::sync::Arc;

use upscaler::broker::{BrokerConsumer, BrokerProducer};
use upscaler::config::WorkerConfig;
use upscaler::idempotency::IdempotencyGuard;
use upscaler::objectstore::{HttpObjectStore, ObjectStore};
use upscaler::worker::{UpscalerConfig, Worker};

fn init_logging() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  upscaler worker tier v{}", upscaler::VERSION);
    log::info!("═══════════════════════════════════════════════════════════");

    let config = WorkerConfig::from_env()?;

    let consumer = Arc::new(BrokerConsumer::new(
        &config.kafka_address,
        &config.kafka_consumer_group,
        &config.kafka_topic,
    )?);
    let result_producer = Arc::new(BrokerProducer::new(
        &config.kafka_address,
        &config.kafka_topic_result,
    )?);
    let guard = Arc::new(
        IdempotencyGuard::connect_with_ttl(
            &config.redis_address,
            config.idempotency_ttl.as_secs(),
        )
        .await?,
    );
    let object_store: Arc<dyn ObjectStore> = Arc::new(HttpObjectStore::new(
        config.s3_access_key_id.clone(),
        config.s3_secret_access_key.clone(),
        config.s3_bucket_name.clone(),
    ));

    let worker = Worker::new(
        consumer,
        result_producer,
        guard,
        object_store,
        UpscalerConfig::default(),
        config.worker_slots,
    );

    log::info!(
        "worker ready, {} concurrent slot(s) on topic {}",
        config.worker_slots,
        config.kafka_topic
    );

    tokio::select! {
        _ = worker.run() => {},
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutdown signal received");
            worker.shutdown();
        }
    }

    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  upscaler worker tier shutdown complete");
    log::info!("═══════════════════════════════════════════════════════════");
    Ok(())
}
