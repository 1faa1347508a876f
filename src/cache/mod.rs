//! Directory configuration cache
//!
//! Memoizes `getDirectoryConfig` results per key for the lifetime of one
//! loaded runner instance. Invalidation is all-or-nothing.

use std::collections::HashMap;
use std::future::Future;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::error::Result;
use crate::plugin::types::DirectoryConfig;

/// Key used when the caller does not name a configuration
pub const DEFAULT_KEY: &str = "default";

/// Resolve an optional configuration key
pub fn cache_key(key: Option<&str>) -> &str {
    key.unwrap_or(DEFAULT_KEY)
}

#[derive(Default)]
pub struct DirectoryConfigCache {
    entries: Mutex<HashMap<String, DirectoryConfig>>,
}

impl DirectoryConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value for `key`, without touching the runner
    pub async fn get(&self, key: Option<&str>) -> Option<DirectoryConfig> {
        self.entries.lock().await.get(cache_key(key)).cloned()
    }

    /// Return the cached value for `key` or fetch and store it
    ///
    /// The lock is held across `fetch`, so concurrent misses on the same
    /// cache issue a single runner call. Failed fetches are not cached.
    pub async fn get_or_fetch<F, Fut>(&self, key: Option<&str>, fetch: F) -> Result<DirectoryConfig>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DirectoryConfig>>,
    {
        let key = cache_key(key);
        let mut entries = self.entries.lock().await;

        if let Some(config) = entries.get(key) {
            debug!(key = %key, "Directory config cache hit");
            return Ok(config.clone());
        }

        let config = fetch().await?;
        entries.insert(key.to_string(), config.clone());
        Ok(config)
    }

    /// Drop every cached entry
    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        if !entries.is_empty() {
            debug!(entries = entries.len(), "Clearing directory config cache");
        }
        entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::BridgeError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(search_disabled: bool) -> DirectoryConfig {
        DirectoryConfig {
            search_disabled: Some(search_disabled),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_one_fetch_per_key() {
        let cache = DirectoryConfigCache::new();
        let fetches = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_fetch(None, || async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(config(true))
                })
                .await
                .unwrap();
            assert_eq!(value, config(true));
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        cache
            .get_or_fetch(Some("latest"), || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(config(false))
            })
            .await
            .unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);

        // An absent key and the explicit default key share an entry
        assert_eq!(cache.get(Some(DEFAULT_KEY)).await, Some(config(true)));
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = DirectoryConfigCache::new();

        let err = cache
            .get_or_fetch(None, || async { Err(BridgeError::NotReady("runner.a".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotReady(_)));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_clear_is_wholesale() {
        let cache = DirectoryConfigCache::new();
        cache.get_or_fetch(None, || async { Ok(config(true)) }).await.unwrap();
        cache.get_or_fetch(Some("a"), || async { Ok(config(false)) }).await.unwrap();

        cache.clear().await;
        assert!(cache.is_empty().await);
        assert_eq!(cache.get(None).await, None);
    }
}
