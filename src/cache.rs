use crate::error::{Result, SandboxError};
use crate::vars::EnvMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;

type CacheKey = (String, String);

/// Memoized sandbox environments keyed by `(backend type, env cache key)`.
///
/// Each key owns a once-cell: concurrent callers for the same key wait for a
/// single resolution, and a successful result is never recomputed. Failed
/// resolutions leave the cell empty so the next caller retries.
#[derive(Default)]
pub struct EnvironmentCache {
    store: Mutex<HashMap<CacheKey, Arc<OnceCell<Arc<EnvMap>>>>>,
}

impl EnvironmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache shared by all sandboxes
    pub fn global() -> Arc<EnvironmentCache> {
        static GLOBAL: OnceLock<Arc<EnvironmentCache>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Self::new())).clone()
    }

    pub async fn get_or_create<F, Fut>(
        &self,
        backend_type: &str,
        cache_key: &str,
        resolver: F,
    ) -> Result<Arc<EnvMap>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<EnvMap>>,
    {
        let cell = {
            let mut store = self.store.lock();
            store
                .entry((backend_type.to_string(), cache_key.to_string()))
                .or_default()
                .clone()
        };

        if let Some(env) = cell.get() {
            crate::log_env_resolved!(backend_type, cache_key, env.len(), true);
            return Ok(env.clone());
        }

        let env = cell
            .get_or_try_init(|| async {
                let env = resolver().await.map_err(|e| SandboxError::Environment {
                    sandbox_type: backend_type.to_string(),
                    cache_key: cache_key.to_string(),
                    reason: format!("{:#}", e),
                })?;
                crate::log_env_resolved!(backend_type, cache_key, env.len(), false);
                Ok::<_, SandboxError>(Arc::new(env))
            })
            .await?;

        Ok(env.clone())
    }

    pub fn contains(&self, backend_type: &str, cache_key: &str) -> bool {
        self.store
            .lock()
            .get(&(backend_type.to_string(), cache_key.to_string()))
            .map(|cell| cell.initialized())
            .unwrap_or(false)
    }

    /// Number of resolved environments
    pub fn len(&self) -> usize {
        self.store
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.store.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_resolver_called_once() {
        let cache = EnvironmentCache::new();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let resolve = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok([("PATH", "/sandbox/bin")].into_iter().collect::<EnvMap>())
        };

        let first = cache.get_or_create("docker", "centos7", resolve).await.unwrap();
        let second = cache.get_or_create("docker", "centos7", resolve).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.get("PATH"), Some("/sandbox/bin"));
        assert!(cache.contains("docker", "centos7"));
    }

    #[tokio::test]
    async fn test_keys_are_separated_by_type() {
        let cache = EnvironmentCache::new();
        let a = cache
            .get_or_create("docker", "x", || async { Ok(EnvMap::new()) })
            .await
            .unwrap();
        let b = cache
            .get_or_create("bash", "x", || async { Ok(EnvMap::new()) })
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = EnvironmentCache::new();

        let err = cache
            .get_or_create("bash", "broken.sh", || async {
                Err(anyhow::anyhow!("setup script exited with 1"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Environment { .. }));
        assert!(!cache.contains("bash", "broken.sh"));

        let env = cache
            .get_or_create("bash", "broken.sh", || async {
                Ok([("OK", "1")].into_iter().collect::<EnvMap>())
            })
            .await
            .unwrap();
        assert_eq!(env.get("OK"), Some("1"));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_resolution() {
        let cache = Arc::new(EnvironmentCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_create("docker", "slow", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(EnvMap::new())
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
