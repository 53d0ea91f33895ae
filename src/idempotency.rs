//! Short-TTL key store guarding against duplicate side effects when a
//! broker message is redelivered.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;

const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

/// Implemented by the Redis-backed guard and by test fixtures.
#[async_trait]
pub trait Guard: Send + Sync {
    async fn check_and_save(&self, key: &str) -> Result<bool>;
}

/// Guards against duplicate processing of the same idempotency key
/// within a TTL window. `check_and_save` is a single atomic
/// `SET key 1 NX EX ttl`, not a separate `EXISTS` then `SET`: that
/// sequence would let two concurrent callers both see "not present".
pub struct IdempotencyGuard {
    redis: ConnectionManager,
    ttl_secs: u64,
}

impl IdempotencyGuard {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        Self::connect_with_ttl(redis_url, DEFAULT_TTL_SECS).await
    }

    pub async fn connect_with_ttl(redis_url: &str, ttl_secs: u64) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis, ttl_secs })
    }

}

#[async_trait]
impl Guard for IdempotencyGuard {
    /// Returns true exactly once per key within the TTL window.
    async fn check_and_save(&self, key: &str) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(reply.is_some())
    }
}

/// An in-memory stand-in for tests that don't want a live Redis,
/// implementing the same atomic-check-and-save contract. Shared by
/// this module's tests and by `worker`/`completion` tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    pub struct FakeGuard {
        seen: Mutex<HashSet<String>>,
    }

    impl Default for FakeGuard {
        fn default() -> Self {
            Self::new()
        }
    }

    impl FakeGuard {
        pub fn new() -> Self {
            Self {
                seen: Mutex::new(HashSet::new()),
            }
        }
    }

    #[async_trait]
    impl Guard for FakeGuard {
        async fn check_and_save(&self, key: &str) -> Result<bool> {
            Ok(self.seen.lock().await.insert(key.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeGuard;
    use super::*;

    #[tokio::test]
    async fn first_call_true_second_call_false() {
        let guard = FakeGuard::new();
        assert!(guard.check_and_save("42").await.unwrap());
        assert!(!guard.check_and_save("42").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_callers_only_one_wins() {
        use std::sync::Arc;
        let guard = Arc::new(FakeGuard::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = guard.clone();
            handles.push(tokio::spawn(
                async move { guard.check_and_save("k").await },
            ));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap().unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
