//! `CompletionSink`: consumes `T_res`, finalizes state via
//! `CachedStore`, and wakes the owning client's live session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::broker::BrokerConsumer;
use crate::model::{BrokerResult, FinishedTask};
use crate::objectstore::{ObjectStore, ObjectStoreError};
use crate::session::SessionRegistry;
use crate::taskstore::{TaskStore, TaskStoreError};

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("broker error: {0}")]
    Broker(#[from] crate::broker::BrokerError),

    #[error("task store error: {0}")]
    TaskStore(#[from] TaskStoreError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),
}

pub type Result<T> = std::result::Result<T, CompletionError>;

pub struct CompletionSink {
    consumer: Arc<BrokerConsumer>,
    store: Arc<dyn TaskStore>,
    object_store: Arc<dyn ObjectStore>,
    sessions: Arc<SessionRegistry>,
    running: AtomicBool,
}

impl CompletionSink {
    pub fn new(
        consumer: Arc<BrokerConsumer>,
        store: Arc<dyn TaskStore>,
        object_store: Arc<dyn ObjectStore>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            consumer,
            store,
            object_store,
            sessions,
            running: AtomicBool::new(false),
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

            let result: BrokerResult = match serde_json::from_slice(&msg.payload) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("dropping malformed T_res message: {e}");
                    let _ = self.consumer.commit(&msg);
                    continue;
                }
            };

            if let Err(e) = self.handle(result).await {
                log::error!("completion handling failed, will redeliver: {e}");
                continue;
            }

            if let Err(e) = self.consumer.commit(&msg) {
                log::error!("failed to commit offset: {e}");
            }
        }
    }

    async fn handle(&self, result: BrokerResult) -> Result<()> {
        let dest_url = self
            .object_store
            .get_presigned_get(&result.dest_file_key)
            .await?;

        self.store
            .finish_tasks(&[FinishedTask {
                file_id: result.file_id,
                user_id: result.user_id,
                queue_id: result.queue_id,
                result: result.result,
                error: result.error,
                dest_url,
            }])
            .await?;

        // A send failure (offline client) is logged, not propagated: the
        // dashboard refreshes on next poll regardless.
        if let Err(e) = self.sessions.send(result.user_id, "update").await {
            log::warn!("failed to notify user {}: {e}", result.user_id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewTask, ProcessResult};
    use crate::taskstore::memory::InMemoryTaskStore;
    use async_trait::async_trait;

    struct StubObjectStore;

    #[async_trait]
    impl ObjectStore for StubObjectStore {
        async fn get_presigned_put(
            &self,
            _count: usize,
        ) -> crate::objectstore::Result<Vec<crate::objectstore::PresignedPut>> {
            unimplemented!()
        }
        async fn get_presigned_get(&self, key: &str) -> crate::objectstore::Result<String> {
            Ok(format!("https://cdn.example/{key}"))
        }
        async fn download_to_temp(
            &self,
            _url: &str,
            _ext: &str,
        ) -> crate::objectstore::Result<std::path::PathBuf> {
            unimplemented!()
        }
        async fn upload(&self, _url: &str, _path: &std::path::Path) -> crate::objectstore::Result<()> {
            unimplemented!()
        }
    }

    struct FailingObjectStore;

    #[async_trait]
    impl ObjectStore for FailingObjectStore {
        async fn get_presigned_put(
            &self,
            _count: usize,
        ) -> crate::objectstore::Result<Vec<crate::objectstore::PresignedPut>> {
            unimplemented!()
        }
        async fn get_presigned_get(&self, _key: &str) -> crate::objectstore::Result<String> {
            Err(ObjectStoreError::UploadFailed(reqwest::StatusCode::SERVICE_UNAVAILABLE))
        }
        async fn download_to_temp(
            &self,
            _url: &str,
            _ext: &str,
        ) -> crate::objectstore::Result<std::path::PathBuf> {
            unimplemented!()
        }
        async fn upload(&self, _url: &str, _path: &std::path::Path) -> crate::objectstore::Result<()> {
            unimplemented!()
        }
    }

    fn task(name: &str) -> NewTask {
        NewTask {
            file_name: name.to_string(),
            src_url: "s".into(),
            src_key: "sk".into(),
            dest_url: "d".into(),
            dest_key: "dk".into(),
        }
    }

    async fn finish_via_store(
        store: &dyn TaskStore,
        object_store: &dyn ObjectStore,
        sessions: &SessionRegistry,
        result: BrokerResult,
    ) -> Result<()> {
        let dest_url = object_store
            .get_presigned_get(&result.dest_file_key)
            .await?;
        store
            .finish_tasks(&[FinishedTask {
                file_id: result.file_id,
                user_id: result.user_id,
                queue_id: result.queue_id,
                result: result.result,
                error: result.error,
                dest_url,
            }])
            .await?;
        if let Err(e) = sessions.send(result.user_id, "update").await {
            log::warn!("failed to notify user {}: {e}", result.user_id);
        }
        Ok(())
    }

    #[tokio::test]
    async fn s6_completion_without_session_does_not_block() {
        let store = InMemoryTaskStore::new();
        let u = store.create_user().await.unwrap();
        let created = store.create_tasks(u, &[task("a")]).await.unwrap();
        let object_store = StubObjectStore;
        let sessions = SessionRegistry::new();

        finish_via_store(
            &store,
            &object_store,
            &sessions,
            BrokerResult {
                result: ProcessResult::Processed,
                error: String::new(),
                dest_file_key: "dk".into(),
                user_id: u,
                file_id: created.user_files[0].id,
                queue_id: created.queue_items[0].id,
            },
        )
        .await
        .unwrap();

        let state = store.get_state(u).await.unwrap();
        assert_eq!(state[0].link, "https://cdn.example/dk");
    }

    #[tokio::test]
    async fn a_failed_presigned_get_leaves_the_task_unfinished() {
        let store = InMemoryTaskStore::new();
        let u = store.create_user().await.unwrap();
        let created = store.create_tasks(u, &[task("a")]).await.unwrap();
        let object_store = FailingObjectStore;
        let sessions = SessionRegistry::new();

        let err = finish_via_store(
            &store,
            &object_store,
            &sessions,
            BrokerResult {
                result: ProcessResult::Processed,
                error: String::new(),
                dest_file_key: "dk".into(),
                user_id: u,
                file_id: created.user_files[0].id,
                queue_id: created.queue_items[0].id,
            },
        )
        .await;

        assert!(err.is_err());
        let state = store.get_state(u).await.unwrap();
        assert_eq!(state[0].status, crate::model::FileState::Pending);
    }

    #[tokio::test]
    async fn duplicate_completion_is_a_noop_not_an_error() {
        let store = InMemoryTaskStore::new();
        let u = store.create_user().await.unwrap();
        let created = store.create_tasks(u, &[task("a")]).await.unwrap();
        let object_store = StubObjectStore;
        let sessions = SessionRegistry::new();

        let result = BrokerResult {
            result: ProcessResult::Processed,
            error: String::new(),
            dest_file_key: "dk".into(),
            user_id: u,
            file_id: created.user_files[0].id,
            queue_id: created.queue_items[0].id,
        };
        finish_via_store(&store, &object_store, &sessions, result.clone())
            .await
            .unwrap();
        finish_via_store(&store, &object_store, &sessions, result)
            .await
            .unwrap();
    }
}
