//! `OutboxPump`: one background task per back-tier process, draining
//! the transactional outbox into the broker on a fixed tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::broker::BrokerProducer;
use crate::taskstore::{TaskStore, TaskStoreError};

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("task store error: {0}")]
    TaskStore(#[from] TaskStoreError),
}

pub type Result<T> = std::result::Result<T, OutboxError>;

pub struct OutboxPump {
    store: Arc<dyn TaskStore>,
    producer: Arc<BrokerProducer>,
    interval: Duration,
    batch_size: i64,
    running: Arc<AtomicBool>,
}

impl OutboxPump {
    pub fn new(store: Arc<dyn TaskStore>, producer: Arc<BrokerProducer>) -> Self {
        Self {
            store,
            producer,
            interval: Duration::from_secs(3),
            batch_size: 100,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Runs until `shutdown` is called. Each tick performs one
    /// `drain_outbox`; ticks do not overlap.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut ticker = tokio::time::interval(self.interval);

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.tick().await {
                log::error!("outbox drain failed: {e}");
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let producer = self.producer.clone();
        let sent = self
            .store
            .drain_outbox(
                self.batch_size,
                &move |items| {
                    let producer = producer.clone();
                    Box::pin(async move {
                        let batch: Vec<(String, String)> = items
                            .into_iter()
                            .map(|i| (i.idempotency_key, i.payload))
                            .collect();
                        producer
                            .send_batch(&batch)
                            .await
                            .map_err(|e| TaskStoreError::InvariantViolation(e.to_string()))
                    })
                },
            )
            .await?;
        if sent > 0 {
            log::info!("drained {sent} outbox rows");
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
