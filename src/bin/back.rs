//! Back tier entry point: persists tasks, drains the outbox to the
//! broker, and holds the live-session registry.

use std::sync::Arc;

use upscaler::broker::{BrokerConsumer, BrokerProducer};
use upscaler::config::BackConfig;
use upscaler::objectstore::{HttpObjectStore, ObjectStore};
use upscaler::taskstore::postgres::{PostgresConfig, PostgresTaskStore};
use upscaler::{CachedStore, CompletionSink, OutboxPump, SessionRegistry, TaskStore};

fn init_logging() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  upscaler back tier v{}", upscaler::VERSION);
    log::info!("═══════════════════════════════════════════════════════════");

    let config = BackConfig::from_env()?;

    let store = PostgresTaskStore::connect(PostgresConfig::new(&config.database_dsn)).await?;
    let store: Arc<dyn TaskStore> = Arc::new(CachedStore::new(Arc::new(store)).await?);
    log::info!("task store ready, cache warmed from persistent queue");

    let sessions = Arc::new(SessionRegistry::new());

    let producer = Arc::new(BrokerProducer::new(&config.kafka_address, &config.kafka_topic)?);
    let pump = Arc::new(
        OutboxPump::new(store.clone(), producer).with_interval(config.outbox_interval),
    );

    let pump_handle = {
        let pump = pump.clone();
        tokio::spawn(async move { pump.run().await })
    };

    let object_store: Arc<dyn ObjectStore> = Arc::new(HttpObjectStore::new(
        config.s3_access_key_id.clone(),
        config.s3_secret_access_key.clone(),
        config.s3_bucket_name.clone(),
    ));
    let result_consumer = Arc::new(BrokerConsumer::new(
        &config.kafka_address,
        &config.kafka_consumer_group,
        &config.kafka_topic_result,
    )?);
    let completion_sink = Arc::new(CompletionSink::new(
        result_consumer,
        store.clone(),
        object_store,
        sessions.clone(),
    ));
    let completion_handle = {
        let completion_sink = completion_sink.clone();
        tokio::spawn(async move { completion_sink.run().await })
    };

    log::info!("listening on {}", config.address);
    // The HTTP front door (route handlers, JWT verification, static
    // file serving, WebSocket upgrade) lives outside this crate's
    // scope; it would attach/detach sessions on `sessions` and serve
    // `store` and `sessions` to request handlers.
    tokio::signal::ctrl_c().await?;

    log::info!("shutdown signal received, draining outbox pump");
    pump.shutdown();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), pump_handle).await;
    completion_sink.shutdown();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), completion_handle).await;
    sessions.shutdown().await;

    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  upscaler back tier shutdown complete");
    log::info!("═══════════════════════════════════════════════════════════");
    Ok(())
}
