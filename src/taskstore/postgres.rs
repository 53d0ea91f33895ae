//! Postgres-backed `TaskStore`.
//!
//! Built over a pooled `sqlx::PgPool` with bootstrap migrations run at
//! construction time.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Row, Transaction};

use crate::model::{
    BrokerRequest, ClientUserItem, FileState, FinishedTask, NewTask, OutboxRecord, OutboxStatus,
    QueueEntry, UserFile, UserId,
};

use super::{CreatedTasks, Result, TaskStore, TaskStoreError};

/// Pool tuning: min/max connections, connect/idle timeouts.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub dsn: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl PostgresConfig {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            min_connections: 2,
            max_connections: 20,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

pub struct PostgresTaskStore {
    pool: sqlx::PgPool,
}

impl PostgresTaskStore {
    /// Connects, runs the embedded migrations, and returns a ready
    /// store. Migration failure is fatal, the process should not
    /// start against an unmigrated schema.
    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&config.dsn)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        log::info!("database migrations applied");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

fn row_to_client_item(row: &PgRow) -> Result<ClientUserItem> {
    let status: String = row.try_get("state")?;
    let status: FileState = status.parse().map_err(TaskStoreError::InvariantViolation)?;
    Ok(ClientUserItem {
        order_num: row.try_get("order_num")?,
        file_name: row.try_get("file_name")?,
        link: row.try_get("link")?,
        queue_position: row.try_get("queue_position")?,
        status,
    })
}

fn row_to_userfile(row: &PgRow) -> Result<UserFile> {
    let state: String = row.try_get("state")?;
    Ok(UserFile {
        id: row.try_get("id")?,
        queue_ref: row.try_get("queue_id")?,
        user_id: row.try_get("user_id")?,
        order_num: row.try_get("order_num")?,
        src_url: row.try_get("src_file_url")?,
        src_key: row.try_get("src_file_key")?,
        dest_url: row.try_get("dest_file_url")?,
        dest_key: row.try_get("dest_file_key")?,
        state: state.parse().map_err(TaskStoreError::InvariantViolation)?,
        created_at: row.try_get("created_at")?,
        file_name: row.try_get("file_name")?,
    })
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn create_tasks(&self, user_id: UserId, tasks: &[NewTask]) -> Result<CreatedTasks> {
        let mut tx: Transaction<'_, sqlx::Postgres> = self.pool.begin().await?;
        let mut queue_items = Vec::with_capacity(tasks.len());
        let mut user_files = Vec::with_capacity(tasks.len());

        for task in tasks {
            let queue_row = sqlx::query("INSERT INTO queue DEFAULT VALUES RETURNING id, order_num")
                .fetch_one(&mut *tx)
                .await?;
            let queue_id: i64 = queue_row.try_get("id")?;
            let order_num: i64 = queue_row.try_get("order_num")?;

            let file_row = sqlx::query(
                "INSERT INTO userfiles
                     (queue_id, user_id, order_num, src_file_url, src_file_key,
                      dest_file_url, dest_file_key, state, file_name)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 'PENDING', $8)
                 RETURNING id, created_at",
            )
            .bind(queue_id)
            .bind(user_id)
            .bind(order_num)
            .bind(&task.src_url)
            .bind(&task.src_key)
            .bind(&task.dest_url)
            .bind(&task.dest_key)
            .bind(&task.file_name)
            .fetch_one(&mut *tx)
            .await?;
            let file_id: i64 = file_row.try_get("id")?;
            let created_at = file_row.try_get("created_at")?;

            let ext = std::path::Path::new(&task.file_name)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(".{e}"))
                .unwrap_or_default();
            let payload = BrokerRequest {
                src_file_url: task.src_url.clone(),
                dest_file_url: task.dest_url.clone(),
                dest_file_key: task.dest_key.clone(),
                file_id,
                file_extension: ext,
                user_id,
                queue_id,
            };
            let payload_json = serde_json::to_string(&payload)?;

            sqlx::query(
                "INSERT INTO outbox (payload, idempotency_key, status)
                 VALUES ($1, $2, 'PENDING')",
            )
            .bind(&payload_json)
            .bind(file_id.to_string())
            .execute(&mut *tx)
            .await?;

            queue_items.push(QueueEntry {
                id: queue_id,
                order: order_num,
            });
            user_files.push(UserFile {
                id: file_id,
                queue_ref: Some(queue_id),
                user_id,
                order_num,
                src_url: task.src_url.clone(),
                src_key: task.src_key.clone(),
                dest_url: task.dest_url.clone(),
                dest_key: task.dest_key.clone(),
                state: FileState::Pending,
                created_at,
                file_name: task.file_name.clone(),
            });
        }

        tx.commit().await?;
        Ok(CreatedTasks {
            queue_items,
            user_files,
        })
    }

    async fn get_state(&self, user_id: UserId) -> Result<Vec<ClientUserItem>> {
        let rows = sqlx::query(
            "SELECT
                 uf.order_num AS order_num,
                 uf.file_name AS file_name,
                 CASE WHEN uf.state = 'PENDING' THEN '' ELSE uf.dest_file_url END AS link,
                 COALESCE(q.queue_position, -1) AS queue_position,
                 uf.state AS state
             FROM userfiles uf
             LEFT JOIN (
                 SELECT id, ROW_NUMBER() OVER (ORDER BY id) AS queue_position
                 FROM queue
             ) q ON q.id = uf.queue_id
             WHERE uf.user_id = $1
             ORDER BY uf.order_num ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_client_item).collect()
    }

    async fn create_user(&self) -> Result<UserId> {
        let row = sqlx::query("INSERT INTO users DEFAULT VALUES RETURNING id")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn finish_tasks(&self, results: &[FinishedTask]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for res in results {
            let row = sqlx::query("SELECT queue_id, state FROM userfiles WHERE id = $1")
                .bind(res.file_id)
                .fetch_optional(&mut *tx)
                .await?;

            let Some(row) = row else {
                return Err(TaskStoreError::InvariantViolation(format!(
                    "finish_tasks: no userfile row for file_id {}",
                    res.file_id
                )));
            };

            let queue_id: Option<i64> = row.try_get("queue_id")?;
            let state: String = row.try_get("state")?;
            let state: FileState = state.parse().map_err(TaskStoreError::InvariantViolation)?;

            if queue_id.is_none() || state.is_terminal() {
                log::warn!(
                    "finish_tasks: file {} already terminal, skipping",
                    res.file_id
                );
                continue;
            }

            sqlx::query(
                "UPDATE userfiles SET state = $1, dest_file_url = $2, queue_id = NULL
                 WHERE id = $3",
            )
            .bind(res.result.as_file_state().as_str())
            .bind(&res.dest_url)
            .bind(res.file_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM queue WHERE id = $1")
                .bind(queue_id.unwrap())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn drain_outbox(
        &self,
        limit: i64,
        send_fn: &(dyn Fn(Vec<OutboxRecord>) -> BoxFuture<'_, Result<()>> + Send + Sync),
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT id, payload, idempotency_key, status, created_at, processed_at
             FROM outbox
             WHERE status = 'PENDING'
             ORDER BY created_at
             LIMIT $1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.try_get("status")?;
            items.push(OutboxRecord {
                id: row.try_get("id")?,
                payload: row.try_get("payload")?,
                idempotency_key: row.try_get("idempotency_key")?,
                status: if status == "SENT" {
                    OutboxStatus::Sent
                } else {
                    OutboxStatus::Pending
                },
                created_at: row.try_get("created_at")?,
                processed_at: row.try_get("processed_at")?,
            });
        }

        // Broker acceptance happens inside the transaction: a send error
        // rolls the whole batch back rather than flipping any row to SENT.
        send_fn(items.clone()).await?;

        let now = Utc::now();
        let ids: Vec<i64> = items.iter().map(|i| i.id).collect();
        sqlx::query(
            "UPDATE outbox SET status = 'SENT', processed_at = $1 WHERE id = ANY($2)",
        )
        .bind(now)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(items.len())
    }

    async fn get_queue(&self) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query("SELECT id, order_num FROM queue ORDER BY order_num ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(QueueEntry {
                    id: row.try_get("id")?,
                    order: row.try_get("order_num")?,
                })
            })
            .collect()
    }

    async fn get_user_files(&self, user_id: UserId) -> Result<Vec<UserFile>> {
        let rows = sqlx::query(
            "SELECT id, queue_id, user_id, order_num, src_file_url, src_file_key,
                    dest_file_url, dest_file_key, state, created_at, file_name
             FROM userfiles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_userfile).collect()
    }
}
