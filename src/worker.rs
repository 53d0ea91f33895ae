//! `Worker`: consumes `T_req`, runs the external upscaler under a
//! bounded concurrency slot, uploads the result, and publishes to
//! `T_res`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::broker::{BrokerConsumer, BrokerProducer};
use crate::idempotency::Guard;
use crate::model::{BrokerRequest, BrokerResult, ProcessResult};
use crate::objectstore::ObjectStore;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("broker error: {0}")]
    Broker(#[from] crate::broker::BrokerError),

    #[error("idempotency guard error: {0}")]
    Guard(#[from] crate::idempotency::IdempotencyError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// External upscaler invocation parameters. Split out so tests can
/// substitute a stub binary instead of a real GPU process.
#[derive(Debug, Clone)]
pub struct UpscalerConfig {
    pub binary: String,
    pub model: String,
}

impl Default for UpscalerConfig {
    fn default() -> Self {
        Self {
            binary: "realesrgan-ncnn-vulkan".to_string(),
            model: "realesrgan-x4plus".to_string(),
        }
    }
}

pub struct Worker {
    consumer: Arc<BrokerConsumer>,
    result_producer: Arc<BrokerProducer>,
    guard: Arc<dyn Guard>,
    object_store: Arc<dyn ObjectStore>,
    upscaler: UpscalerConfig,
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        consumer: Arc<BrokerConsumer>,
        result_producer: Arc<BrokerProducer>,
        guard: Arc<dyn Guard>,
        object_store: Arc<dyn ObjectStore>,
        upscaler: UpscalerConfig,
        slots: usize,
    ) -> Self {
        Self {
            consumer,
            result_producer,
            guard,
            object_store,
            upscaler,
            semaphore: Arc::new(Semaphore::new(slots)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            let msg = match self.consumer.recv().await {
                Ok(msg) => msg,
                Err(e) => {
                    log::error!("broker recv failed: {e}");
                    continue;
                }
            };

            let request: BrokerRequest = match serde_json::from_slice(&msg.payload) {
                Ok(req) => req,
                Err(e) => {
                    log::warn!("dropping malformed T_req message: {e}");
                    let _ = self.consumer.commit(&msg);
                    continue;
                }
            };

            let already_seen = match self.guard.check_and_save(&msg.key).await {
                Ok(is_new) => !is_new,
                Err(e) => {
                    // An unknown answer, not a duplicate: leave the offset
                    // uncommitted so the broker redelivers once the guard
                    // backing store recovers.
                    log::error!("idempotency guard error, will redeliver: {e}");
                    continue;
                }
            };
            if already_seen {
                log::debug!("duplicate delivery for key {}, skipping", msg.key);
                let _ = self.consumer.commit(&msg);
                continue;
            }

            let permit = self.semaphore.clone().acquire_owned().await.unwrap();
            let object_store = self.object_store.clone();
            let result_producer = self.result_producer.clone();
            let upscaler = self.upscaler.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let result = match std::panic::AssertUnwindSafe(process_request(
                    &object_store,
                    &upscaler,
                    &request,
                ))
                .catch_unwind()
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        log::error!(
                            "worker slot panicked processing file {}",
                            request.file_id
                        );
                        BrokerResult {
                            result: ProcessResult::Error,
                            error: "internal error: worker slot panicked".to_string(),
                            dest_file_key: request.dest_file_key.clone(),
                            user_id: request.user_id,
                            file_id: request.file_id,
                            queue_id: request.queue_id,
                        }
                    }
                };
                let payload = match serde_json::to_string(&result) {
                    Ok(p) => p,
                    Err(e) => {
                        log::error!("failed to encode T_res payload: {e}");
                        return;
                    }
                };
                if let Err(e) = result_producer
                    .send(&request.file_id.to_string(), &payload)
                    .await
                {
                    log::error!("failed to publish T_res for file {}: {e}", request.file_id);
                }
            });

            // Committed right after enqueue: the broker won't redeliver on
            // worker crash, and the idempotency guard plus the completion
            // sink's terminal-state no-op absorb any resulting duplicate.
            if let Err(e) = self.consumer.commit(&msg) {
                log::error!("failed to commit offset: {e}");
            }
        }
    }
}

async fn process_request(
    object_store: &Arc<dyn ObjectStore>,
    upscaler: &UpscalerConfig,
    request: &BrokerRequest,
) -> BrokerResult {
    match run_pipeline(object_store, upscaler, request).await {
        Ok(()) => BrokerResult {
            result: ProcessResult::Processed,
            error: String::new(),
            dest_file_key: request.dest_file_key.clone(),
            user_id: request.user_id,
            file_id: request.file_id,
            queue_id: request.queue_id,
        },
        Err(e) => {
            log::warn!("upscale pipeline failed for file {}: {e}", request.file_id);
            BrokerResult {
                result: ProcessResult::Error,
                error: e.to_string(),
                dest_file_key: request.dest_file_key.clone(),
                user_id: request.user_id,
                file_id: request.file_id,
                queue_id: request.queue_id,
            }
        }
    }
}

async fn run_pipeline(
    object_store: &Arc<dyn ObjectStore>,
    upscaler: &UpscalerConfig,
    request: &BrokerRequest,
) -> anyhow::Result<()> {
    let input_path = object_store
        .download_to_temp(&request.src_file_url, &request.file_extension)
        .await?;
    let mut output_path = input_path.clone();
    output_path.set_file_name(format!(
        "out-{}{}",
        request.file_id, request.file_extension
    ));

    let cleanup = |input: &std::path::Path, output: &std::path::Path| {
        let _ = std::fs::remove_file(input);
        let _ = std::fs::remove_file(output);
    };

    let run_result = run_upscaler(upscaler, &input_path, &output_path).await;
    if let Err(e) = run_result {
        cleanup(&input_path, &output_path);
        return Err(e);
    }

    let upload_result = object_store.upload(&request.dest_file_url, &output_path).await;
    cleanup(&input_path, &output_path);
    upload_result?;
    Ok(())
}

async fn run_upscaler(
    upscaler: &UpscalerConfig,
    input: &std::path::Path,
    output: &std::path::Path,
) -> anyhow::Result<()> {
    let status = tokio::process::Command::new(&upscaler.binary)
        .arg("-i")
        .arg(input)
        .arg("-o")
        .arg(output)
        .arg("-n")
        .arg(&upscaler.model)
        .status()
        .await?;
    if !status.success() {
        anyhow::bail!("upscaler exited with {status}");
    }
    Ok(())
}
