//! Persistent task store: queue + userfiles + outbox, transactional.
//!
//! `TaskStore` is a tagged abstraction (per the design notes: one
//! concrete implementation per build, no runtime plugin loading) with
//! two implementations: [`postgres::PostgresTaskStore`] for production
//! and [`memory::InMemoryTaskStore`] for tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ClientUserItem, FinishedTask, NewTask, OutboxRecord, QueueEntry, UserFile, UserId};

#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type Result<T> = std::result::Result<T, TaskStoreError>;

/// Outcome of `create_tasks`: parallel arrays of the queue rows and
/// user-file rows created, one pair per input task, in input order.
#[derive(Debug, Clone)]
pub struct CreatedTasks {
    pub queue_items: Vec<QueueEntry>,
    pub user_files: Vec<UserFile>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_tasks(&self, user_id: UserId, tasks: &[NewTask]) -> Result<CreatedTasks>;

    async fn get_state(&self, user_id: UserId) -> Result<Vec<ClientUserItem>>;

    async fn create_user(&self) -> Result<UserId>;

    async fn finish_tasks(&self, results: &[FinishedTask]) -> Result<()>;

    /// Drains up to `limit` pending outbox rows, hands them to `send_fn`,
    /// and marks them `SENT` iff `send_fn` succeeds. A non-error, empty
    /// batch is a no-op commit.
    async fn drain_outbox(
        &self,
        limit: i64,
        send_fn: &(dyn Fn(Vec<OutboxRecord>) -> futures::future::BoxFuture<'_, Result<()>> + Send + Sync),
    ) -> Result<usize>;

    async fn get_queue(&self) -> Result<Vec<QueueEntry>>;

    async fn get_user_files(&self, user_id: UserId) -> Result<Vec<UserFile>>;
}
