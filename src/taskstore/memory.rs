//! In-memory `TaskStore`, used by `CachedStore`'s own tests and as a
//! lightweight fixture for `Worker`/`CompletionSink` tests so unit
//! tests don't need a live Postgres instance.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::model::{
    BrokerRequest, ClientUserItem, FileState, FinishedTask, NewTask, OutboxRecord, OutboxStatus,
    QueueEntry, UserFile, UserId,
};

use super::{CreatedTasks, Result, TaskStore, TaskStoreError};

#[derive(Default)]
struct State {
    next_user_id: i64,
    next_queue_id: i64,
    next_file_id: i64,
    next_outbox_id: i64,
    next_order: i64,
    users: HashSet<UserId>,
    /// `queue_id -> order`, ordered by id so iteration == `ORDER BY id`.
    queue: BTreeMap<i64, i64>,
    userfiles: HashMap<i64, UserFile>,
    outbox: BTreeMap<i64, OutboxRecord>,
    /// Rows currently claimed by an in-flight `drain_outbox` call,
    /// simulating `FOR UPDATE SKIP LOCKED`.
    locked_outbox: HashSet<i64>,
}

/// In-memory stand-in for the persistent store. Not durable, not
/// meant for production use.
pub struct InMemoryTaskStore {
    state: Mutex<State>,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_tasks(&self, user_id: UserId, tasks: &[NewTask]) -> Result<CreatedTasks> {
        let mut state = self.state.lock().await;
        let mut queue_items = Vec::with_capacity(tasks.len());
        let mut user_files = Vec::with_capacity(tasks.len());

        for task in tasks {
            let queue_id = state.next_queue_id;
            state.next_queue_id += 1;
            let order = state.next_order;
            state.next_order += 1;
            state.queue.insert(queue_id, order);
            let entry = QueueEntry { id: queue_id, order };

            let file_id = state.next_file_id;
            state.next_file_id += 1;
            let file = UserFile {
                id: file_id,
                queue_ref: Some(queue_id),
                user_id,
                order_num: order,
                src_url: task.src_url.clone(),
                src_key: task.src_key.clone(),
                dest_url: task.dest_url.clone(),
                dest_key: task.dest_key.clone(),
                state: FileState::Pending,
                created_at: Utc::now(),
                file_name: task.file_name.clone(),
            };
            state.userfiles.insert(file_id, file.clone());

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
            let outbox_id = state.next_outbox_id;
            state.next_outbox_id += 1;
            state.outbox.insert(
                outbox_id,
                OutboxRecord {
                    id: outbox_id,
                    payload: serde_json::to_string(&payload)?,
                    idempotency_key: file_id.to_string(),
                    status: OutboxStatus::Pending,
                    created_at: Utc::now(),
                    processed_at: None,
                },
            );

            queue_items.push(entry);
            user_files.push(file);
        }

        Ok(CreatedTasks {
            queue_items,
            user_files,
        })
    }

    async fn get_state(&self, user_id: UserId) -> Result<Vec<ClientUserItem>> {
        let state = self.state.lock().await;
        let live_order: Vec<i64> = state.queue.keys().copied().collect();

        let mut items: Vec<ClientUserItem> = state
            .userfiles
            .values()
            .filter(|f| f.user_id == user_id)
            .map(|f| {
                let queue_position = match f.queue_ref {
                    Some(qid) => live_order
                        .iter()
                        .position(|&id| id == qid)
                        .map(|pos| pos as i64 + 1)
                        .unwrap_or(-1),
                    None => -1,
                };
                let link = if f.state == FileState::Pending {
                    String::new()
                } else {
                    f.dest_url.clone()
                };
                ClientUserItem {
                    order_num: f.order_num,
                    file_name: f.file_name.clone(),
                    link,
                    queue_position,
                    status: f.state,
                }
            })
            .collect();

        items.sort_by_key(|i| i.order_num);
        Ok(items)
    }

    async fn create_user(&self) -> Result<UserId> {
        let mut state = self.state.lock().await;
        state.next_user_id += 1;
        let id = state.next_user_id;
        state.users.insert(id);
        Ok(id)
    }

    async fn finish_tasks(&self, results: &[FinishedTask]) -> Result<()> {
        let mut state = self.state.lock().await;

        for res in results {
            let Some(file) = state.userfiles.get(&res.file_id).cloned() else {
                return Err(TaskStoreError::InvariantViolation(format!(
                    "finish_tasks: no userfile row for file_id {}",
                    res.file_id
                )));
            };

            if file.state.is_terminal() || file.queue_ref.is_none() {
                log::warn!(
                    "finish_tasks: file {} already terminal, skipping",
                    res.file_id
                );
                continue;
            }

            state.queue.remove(&res.queue_id);
            if let Some(f) = state.userfiles.get_mut(&res.file_id) {
                f.state = res.result.as_file_state();
                f.dest_url = res.dest_url.clone();
                f.queue_ref = None;
            }
        }

        Ok(())
    }

    async fn drain_outbox(
        &self,
        limit: i64,
        send_fn: &(dyn Fn(Vec<OutboxRecord>) -> BoxFuture<'_, Result<()>> + Send + Sync),
    ) -> Result<usize> {
        let batch = {
            let mut state = self.state.lock().await;
            let ids: Vec<i64> = state
                .outbox
                .iter()
                .filter(|(id, rec)| {
                    rec.status == OutboxStatus::Pending && !state.locked_outbox.contains(id)
                })
                .take(limit as usize)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                state.locked_outbox.insert(*id);
            }
            ids.into_iter()
                .map(|id| state.outbox.get(&id).unwrap().clone())
                .collect::<Vec<_>>()
        };

        if batch.is_empty() {
            return Ok(0);
        }

        let result = send_fn(batch.clone()).await;

        let mut state = self.state.lock().await;
        for rec in &batch {
            state.locked_outbox.remove(&rec.id);
        }

        match result {
            Ok(()) => {
                let now = Utc::now();
                for rec in &batch {
                    if let Some(row) = state.outbox.get_mut(&rec.id) {
                        row.status = OutboxStatus::Sent;
                        row.processed_at = Some(now);
                    }
                }
                Ok(batch.len())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_queue(&self) -> Result<Vec<QueueEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<QueueEntry> = state
            .queue
            .iter()
            .map(|(&id, &order)| QueueEntry { id, order })
            .collect();
        entries.sort_by_key(|e| e.order);
        Ok(entries)
    }

    async fn get_user_files(&self, user_id: UserId) -> Result<Vec<UserFile>> {
        let state = self.state.lock().await;
        Ok(state
            .userfiles
            .values()
            .filter(|f| f.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessResult;

    fn task(name: &str) -> NewTask {
        NewTask {
            file_name: name.to_string(),
            src_url: "s".into(),
            src_key: "sk".into(),
            dest_url: "d".into(),
            dest_key: "dk".into(),
        }
    }

    #[tokio::test]
    async fn s1_happy_path_single_file() {
        let store = InMemoryTaskStore::new();
        let u = store.create_user().await.unwrap();
        store.create_tasks(u, &[task("a.png")]).await.unwrap();

        let state = store.get_state(u).await.unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].order_num, 1);
        assert_eq!(state[0].file_name, "a.png");
        assert_eq!(state[0].link, "");
        assert_eq!(state[0].queue_position, 1);
        assert_eq!(state[0].status, FileState::Pending);
    }

    #[tokio::test]
    async fn s2_drain_and_finish() {
        let store = InMemoryTaskStore::new();
        let u = store.create_user().await.unwrap();
        let created = store.create_tasks(u, &[task("a.png")]).await.unwrap();
        let file = &created.user_files[0];
        let queue_id = created.queue_items[0].id;

        let sent = store
            .drain_outbox(
                100,
                &|_items| Box::pin(async move { Ok(()) }),
            )
            .await
            .unwrap();
        assert_eq!(sent, 1);

        store
            .finish_tasks(&[FinishedTask {
                file_id: file.id,
                user_id: u,
                queue_id,
                result: ProcessResult::Processed,
                error: String::new(),
                dest_url: "https://cdn/dk".into(),
            }])
            .await
            .unwrap();

        let state = store.get_state(u).await.unwrap();
        assert_eq!(state[0].status, FileState::Processed);
        assert_eq!(state[0].link, "https://cdn/dk");
        assert_eq!(state[0].queue_position, -1);
        assert!(store.get_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn s3_queue_position_across_users() {
        let store = InMemoryTaskStore::new();
        let u1 = store.create_user().await.unwrap();
        let u2 = store.create_user().await.unwrap();

        let ta = store.create_tasks(u1, &[task("a")]).await.unwrap();
        let tbc = store.create_tasks(u2, &[task("b"), task("c")]).await.unwrap();
        let td = store.create_tasks(u1, &[task("d")]).await.unwrap();

        let s1 = store.get_state(u1).await.unwrap();
        let s2 = store.get_state(u2).await.unwrap();
        assert_eq!(s1[0].queue_position, 1);
        assert_eq!(s2[0].queue_position, 2);
        assert_eq!(s2[1].queue_position, 3);
        assert_eq!(s1[1].queue_position, 4);

        store
            .finish_tasks(&[FinishedTask {
                file_id: tbc.user_files[0].id,
                user_id: u2,
                queue_id: tbc.queue_items[0].id,
                result: ProcessResult::Processed,
                error: String::new(),
                dest_url: "u".into(),
            }])
            .await
            .unwrap();

        let s1 = store.get_state(u1).await.unwrap();
        let s2 = store.get_state(u2).await.unwrap();
        assert_eq!(s1[0].queue_position, 1);
        assert_eq!(s2[1].queue_position, 2);
        assert_eq!(s1[1].queue_position, 3);
        let _ = ta;
        let _ = td;
    }

    #[tokio::test]
    async fn finish_tasks_on_unknown_queue_ref_is_a_noop() {
        let store = InMemoryTaskStore::new();
        let u = store.create_user().await.unwrap();
        let created = store.create_tasks(u, &[task("a")]).await.unwrap();
        let file = &created.user_files[0];
        let queue_id = created.queue_items[0].id;

        let finished = FinishedTask {
            file_id: file.id,
            user_id: u,
            queue_id,
            result: ProcessResult::Processed,
            error: String::new(),
            dest_url: "x".into(),
        };
        store.finish_tasks(&[finished.clone()]).await.unwrap();
        // Second call for the same file must not error.
        store.finish_tasks(&[finished]).await.unwrap();
    }

    #[tokio::test]
    async fn finish_tasks_on_missing_file_row_fails_the_batch() {
        let store = InMemoryTaskStore::new();
        let err = store
            .finish_tasks(&[FinishedTask {
                file_id: 999,
                user_id: 1,
                queue_id: 1,
                result: ProcessResult::Processed,
                error: String::new(),
                dest_url: "x".into(),
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, TaskStoreError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn s5_concurrent_drain_has_no_overlap() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let store = Arc::new(InMemoryTaskStore::new());
        let u = store.create_user().await.unwrap();
        let tasks: Vec<NewTask> = (0..200).map(|i| task(&format!("f{i}"))).collect();
        store.create_tasks(u, &tasks).await.unwrap();

        let seen = Arc::new(std::sync::Mutex::new(HashSet::new()));
        let total_sent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let seen = seen.clone();
            let total_sent = total_sent.clone();
            handles.push(tokio::spawn(async move {
                let seen_inner = seen.clone();
                let n = store
                    .drain_outbox(
                        100,
                        &move |items| {
                            let seen_inner = seen_inner.clone();
                            Box::pin(async move {
                                let mut seen = seen_inner.lock().unwrap();
                                for item in &items {
                                    assert!(seen.insert(item.id), "row sent twice: {}", item.id);
                                }
                                Ok(())
                            })
                        },
                    )
                    .await
                    .unwrap();
                total_sent.fetch_add(n, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(total_sent.load(Ordering::SeqCst), 200);
        assert_eq!(seen.lock().unwrap().len(), 200);
    }
}
