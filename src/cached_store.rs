//! `CachedStore`: wraps a `TaskStore` and keeps a rank tree plus a
//! per-user file map hot, so dashboard reads don't hit the database on
//! every request.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock as SyncRwLock;

use crate::model::{ClientUserItem, FileState, FinishedTask, NewTask, OutboxRecord, QueueEntry, UserFile, UserId};
use crate::ost::{ConcurrentOrderStatTree, OrderedItem, RankIndex};
use crate::taskstore::{CreatedTasks, Result, TaskStore, TaskStoreError};

#[derive(Debug, Clone, Copy)]
struct RankNode {
    queue_id: i64,
    order: i64,
}

impl OrderedItem for RankNode {
    fn order(&self) -> i64 {
        self.order
    }
    fn id(&self) -> i64 {
        self.queue_id
    }
}

struct UserFileLoader {
    inner: Arc<dyn TaskStore>,
}

#[async_trait]
impl crate::cache::Loader<UserId, Arc<SyncRwLock<HashMap<i64, UserFile>>>> for UserFileLoader {
    type Error = TaskStoreError;

    async fn load(
        &self,
        user_id: &UserId,
    ) -> std::result::Result<Arc<SyncRwLock<HashMap<i64, UserFile>>>, Self::Error> {
        let files = self.inner.get_user_files(*user_id).await?;
        let map: HashMap<i64, UserFile> = files.into_iter().map(|f| (f.id, f)).collect();
        Ok(Arc::new(SyncRwLock::new(map)))
    }
}

type FileMapCache = crate::cache::LoadOnMissCache<UserId, Arc<SyncRwLock<HashMap<i64, UserFile>>>, UserFileLoader>;

/// Facade over a `TaskStore` with the same read/write surface plus
/// memoized, consistent-within-one-RTT reads.
pub struct CachedStore {
    inner: Arc<dyn TaskStore>,
    tree: ConcurrentOrderStatTree<RankNode>,
    rank_index: RankIndex,
    file_cache: FileMapCache,
}

impl CachedStore {
    /// Loads every live queue entry from the backing store and
    /// populates the rank tree. The per-user file cache starts cold.
    pub async fn new(inner: Arc<dyn TaskStore>) -> Result<Self> {
        let tree = ConcurrentOrderStatTree::new();
        let rank_index = RankIndex::new();

        for entry in inner.get_queue().await? {
            tree.insert(RankNode {
                queue_id: entry.id,
                order: entry.order,
            });
            rank_index.insert(entry.id, entry.order);
        }

        let file_cache = crate::cache::LoadOnMissCache::new(
            500,
            UserFileLoader {
                inner: inner.clone(),
            },
        );

        Ok(Self {
            inner,
            tree,
            rank_index,
            file_cache,
        })
    }

    fn insert_live_entry(&self, entry: QueueEntry) {
        self.tree.insert(RankNode {
            queue_id: entry.id,
            order: entry.order,
        });
        self.rank_index.insert(entry.id, entry.order);
    }

    fn remove_live_entry(&self, queue_id: i64) {
        if let Some((order, id)) = self.rank_index.remove(queue_id) {
            self.tree.delete(order, id);
        }
    }

    async fn user_file_map(
        &self,
        user_id: UserId,
    ) -> std::result::Result<Arc<SyncRwLock<HashMap<i64, UserFile>>>, TaskStoreError> {
        self.file_cache.get_or_load(&user_id).await
    }
}

#[async_trait]
impl TaskStore for CachedStore {
    async fn create_tasks(&self, user_id: UserId, tasks: &[NewTask]) -> Result<CreatedTasks> {
        let created = self.inner.create_tasks(user_id, tasks).await?;

        for entry in &created.queue_items {
            self.insert_live_entry(*entry);
        }

        let map = self.user_file_map(user_id).await?;
        {
            let mut map = map.write();
            for file in &created.user_files {
                map.insert(file.id, file.clone());
            }
        }

        Ok(created)
    }

    async fn get_state(&self, user_id: UserId) -> Result<Vec<ClientUserItem>> {
        let map = self.user_file_map(user_id).await?;
        let files: Vec<UserFile> = map.read().values().cloned().collect();

        let mut items: Vec<ClientUserItem> = files
            .into_iter()
            .map(|f| {
                let queue_position = match f.queue_ref {
                    Some(qid) => match self.rank_index.get(qid) {
                        Some((order, id)) => self.tree.rank(order, id),
                        None => 0,
                    },
                    None => 0,
                };
                let link = if f.state == FileState::Pending {
                    String::new()
                } else {
                    f.dest_url.clone()
                };
                ClientUserItem {
                    order_num: f.order_num,
                    file_name: f.file_name,
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
        self.inner.create_user().await
    }

    async fn finish_tasks(&self, results: &[FinishedTask]) -> Result<()> {
        self.inner.finish_tasks(results).await?;

        for res in results {
            self.remove_live_entry(res.queue_id);

            let map = self.user_file_map(res.user_id).await?;
            let mut map = map.write();
            if let Some(file) = map.get_mut(&res.file_id) {
                file.state = res.result.as_file_state();
                file.dest_url = res.dest_url.clone();
                file.queue_ref = None;
            }
        }

        Ok(())
    }

    async fn drain_outbox(
        &self,
        limit: i64,
        send_fn: &(dyn Fn(Vec<OutboxRecord>) -> BoxFuture<'_, Result<()>> + Send + Sync),
    ) -> Result<usize> {
        self.inner.drain_outbox(limit, send_fn).await
    }

    async fn get_queue(&self) -> Result<Vec<QueueEntry>> {
        self.inner.get_queue().await
    }

    async fn get_user_files(&self, user_id: UserId) -> Result<Vec<UserFile>> {
        self.inner.get_user_files(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessResult;
    use crate::taskstore::memory::InMemoryTaskStore;

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
    async fn cached_store_mirrors_queue_position() {
        let inner: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let store = CachedStore::new(inner).await.unwrap();
        let u = store.create_user().await.unwrap();
        store.create_tasks(u, &[task("a"), task("b")]).await.unwrap();

        let state = store.get_state(u).await.unwrap();
        assert_eq!(state[0].queue_position, 1);
        assert_eq!(state[1].queue_position, 2);
    }

    #[tokio::test]
    async fn finish_tasks_evicts_tree_and_updates_cache() {
        let inner: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let store = CachedStore::new(inner).await.unwrap();
        let u = store.create_user().await.unwrap();
        let created = store.create_tasks(u, &[task("a")]).await.unwrap();
        let file = &created.user_files[0];
        let queue_id = created.queue_items[0].id;

        store
            .finish_tasks(&[FinishedTask {
                file_id: file.id,
                user_id: u,
                queue_id,
                result: ProcessResult::Processed,
                error: String::new(),
                dest_url: "https://cdn/x".into(),
            }])
            .await
            .unwrap();

        let state = store.get_state(u).await.unwrap();
        assert_eq!(state[0].status, FileState::Processed);
        assert_eq!(state[0].queue_position, 0);
        assert_eq!(store.get_queue().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn startup_populates_tree_from_backing_store() {
        let inner = Arc::new(InMemoryTaskStore::new());
        let u = inner.create_user().await.unwrap();
        inner.create_tasks(u, &[task("a"), task("b")]).await.unwrap();

        let store = CachedStore::new(inner).await.unwrap();
        assert_eq!(store.get_queue().await.unwrap().len(), 2);
        // the tree should already carry both entries without any get_state call
        let state = store.get_state(u).await.unwrap();
        assert_eq!(state[0].queue_position, 1);
        assert_eq!(state[1].queue_position, 2);
    }
}
