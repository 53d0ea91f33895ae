//! Bounded LRU cache with single-flight load-on-miss.
//!
//! Mirrors the upstream `lrulom` wrapper, but closes the race in the
//! original: two concurrent misses on the same key there could both
//! invoke the loader. Here every concurrent miss on a key shares one
//! in-flight `OnceCell`, so the loader runs exactly once.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::OnceCell;

#[derive(Debug, Error)]
pub enum CacheError<E> {
    #[error("load failed: {0}")]
    Load(#[from] E),
}

pub type Result<T, E> = std::result::Result<T, CacheError<E>>;

/// User-supplied loader invoked on a cache miss.
#[async_trait]
pub trait Loader<K, V>: Send + Sync {
    type Error: std::error::Error + Clone + Send + Sync + 'static;

    async fn load(&self, key: &K) -> std::result::Result<V, Self::Error>;
}

struct Lru<K, V> {
    capacity: usize,
    map: std::collections::HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> Lru<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: std::collections::HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &K) -> Option<V> {
        let value = self.map.get(key).cloned()?;
        self.touch(key);
        Some(value)
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos).unwrap();
            self.order.push_back(k);
        }
    }

    fn put(&mut self, key: K, value: V) {
        if self.map.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return;
        }
        self.order.push_back(key);
        if self.map.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
    }

    fn remove(&mut self, key: &K) {
        if self.map.remove(key).is_some() {
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                self.order.remove(pos);
            }
        }
    }
}

/// Fixed-capacity LRU from `K` to `V` with single-flight load-on-miss.
pub struct LoadOnMissCache<K, V, L>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: Loader<K, V>,
{
    lru: Mutex<Lru<K, V>>,
    in_flight: DashMap<K, Arc<OnceCell<std::result::Result<V, L::Error>>>>,
    loader: L,
}

impl<K, V, L> LoadOnMissCache<K, V, L>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: Loader<K, V>,
{
    pub fn new(capacity: usize, loader: L) -> Self {
        Self {
            lru: Mutex::new(Lru::new(capacity)),
            in_flight: DashMap::new(),
            loader,
        }
    }

    /// `(value, hit)`. `hit` is false only the first time a key is
    /// seen, or after it falls out of the LRU.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lru.lock().get(key)
    }

    pub fn put(&self, key: K, value: V) {
        self.lru.lock().put(key, value);
    }

    pub fn remove(&self, key: &K) {
        self.lru.lock().remove(key);
    }

    /// Returns the cached value, or loads it exactly once across every
    /// concurrent caller that misses on the same key.
    pub async fn get_or_load(&self, key: &K) -> std::result::Result<V, L::Error> {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let cell = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_init(|| async { self.loader.load(key).await })
            .await
            .clone();

        // Only the caller that sees its own cell still pointed at by the
        // map clears it; a second eviction-then-reload cycle would have
        // installed a fresh cell under the same key.
        if let Some(entry) = self.in_flight.get(key) {
            if Arc::ptr_eq(&entry, &cell) {
                drop(entry);
                self.in_flight.remove(key);
            }
        }

        if let Ok(ref value) = result {
            self.put(key.clone(), value.clone());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, thiserror::Error)]
    #[error("load error")]
    struct LoadErr;

    struct CountingLoader {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Loader<i64, String> for CountingLoader {
        type Error = LoadErr;

        async fn load(&self, key: &i64) -> std::result::Result<String, LoadErr> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok(format!("value-{key}"))
        }
    }

    #[tokio::test]
    async fn concurrent_misses_load_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(LoadOnMissCache::new(
            10,
            CountingLoader {
                calls: calls.clone(),
            },
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_or_load(&1).await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "value-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn eviction_forces_reload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = LoadOnMissCache::new(
            1,
            CountingLoader {
                calls: calls.clone(),
            },
        );
        cache.get_or_load(&1).await.unwrap();
        cache.get_or_load(&2).await.unwrap();
        assert!(cache.get(&1).is_none());
        cache.get_or_load(&1).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn put_and_remove_are_synchronous() {
        struct NeverLoader;
        #[async_trait]
        impl Loader<i64, i64> for NeverLoader {
            type Error = LoadErr;
            async fn load(&self, _key: &i64) -> std::result::Result<i64, LoadErr> {
                unreachable!()
            }
        }
        let cache = LoadOnMissCache::new(4, NeverLoader);
        cache.put(1, 100);
        assert_eq!(cache.get(&1), Some(100));
        cache.remove(&1);
        assert_eq!(cache.get(&1), None);
    }
}
