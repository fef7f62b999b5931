//! Per-user executor pool.
//!
//! One executor per user key (`user::<name>`, `__global__` otherwise), held
//! in a DashMap for lock-free reads. On connection-reset markers the entry is
//! rebuilt once and the call retried; entries are never evicted (the key
//! population is the configured user set).

use dashmap::DashMap;
use std::sync::Arc;

use super::executor::{ExecError, ExecOptions, ExecResult, SqlExecutor, is_connection_reset};

pub const GLOBAL_POOL_KEY: &str = "__global__";

pub type ExecutorFactory = dyn Fn(&str) -> Arc<dyn SqlExecutor> + Send + Sync;

pub struct ExecutorPool {
    factory: Box<ExecutorFactory>,
    pools: DashMap<String, Arc<dyn SqlExecutor>>,
}

impl ExecutorPool {
    pub fn new(factory: Box<ExecutorFactory>) -> Self {
        Self { factory, pools: DashMap::new() }
    }

    pub fn pool_key(user: Option<&str>) -> String {
        match user {
            Some(name) if !name.trim().is_empty() => format!("user::{}", name.trim()),
            _ => GLOBAL_POOL_KEY.to_string(),
        }
    }

    fn get(&self, key: &str) -> Arc<dyn SqlExecutor> {
        if let Some(executor) = self.pools.get(key) {
            return Arc::clone(&executor);
        }
        let executor = (self.factory)(key);
        self.pools.insert(key.to_string(), Arc::clone(&executor));
        tracing::info!("Created executor pool entry for {}", key);
        executor
    }

    pub fn reset(&self, key: &str) {
        if self.pools.remove(key).is_some() {
            tracing::info!("Reset executor pool entry for {}", key);
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.pools.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Execute under the user's pool, rebuilding the entry once on a
    /// connection-reset class failure.
    pub async fn execute(
        &self,
        user: Option<&str>,
        sql: &str,
        opts: &ExecOptions,
    ) -> Result<ExecResult, ExecError> {
        let key = Self::pool_key(user);
        let executor = self.get(&key);
        match executor.execute(sql, opts).await {
            Ok(result) => Ok(result),
            Err(err) if is_connection_reset(&err.message) => {
                tracing::warn!("Connection reset on {}: {}; rebuilding pool and retrying", key, err);
                self.reset(&key);
                let executor = self.get(&key);
                executor.execute(sql, opts).await
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyExecutor {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SqlExecutor for FlakyExecutor {
        async fn execute(&self, _sql: &str, _opts: &ExecOptions) -> Result<ExecResult, ExecError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Err(ExecError::new("DPY-4011: the database closed the connection", 1))
            } else {
                Ok(ExecResult { row_count: 1, ..Default::default() })
            }
        }
    }

    #[tokio::test]
    async fn connection_reset_triggers_one_rebuild_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_factory = Arc::clone(&calls);
        let pool = ExecutorPool::new(Box::new(move |_key| {
            Arc::new(FlakyExecutor { calls: Arc::clone(&calls_for_factory) }) as Arc<dyn SqlExecutor>
        }));

        let result = pool
            .execute(Some("alice"), "SELECT 1 FROM DUAL", &ExecOptions::default())
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn user_keys_are_isolated() {
        let pool = ExecutorPool::new(Box::new(|_key| {
            Arc::new(FlakyExecutor { calls: Arc::new(AtomicUsize::new(1)) })
                as Arc<dyn SqlExecutor>
        }));
        let _ = pool.execute(Some("alice"), "SELECT 1 FROM DUAL", &ExecOptions::default()).await;
        let _ = pool.execute(None, "SELECT 1 FROM DUAL", &ExecOptions::default()).await;
        assert_eq!(pool.pool_count(), 2);
        assert!(pool.keys().contains(&"user::alice".to_string()));
        assert!(pool.keys().contains(&GLOBAL_POOL_KEY.to_string()));
    }
}
