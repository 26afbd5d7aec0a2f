//! Single-flight TTL cache
//!
//! On a miss, the first requester installs a pending entry and runs the
//! loader; concurrent requesters for the same key await that entry instead
//! of running their own loaders.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};

use crate::errors::PipedError;

enum EntryState<V> {
    Ready { value: V, expires_at: Instant },
    Pending(watch::Receiver<Option<Result<V, String>>>),
}

/// A keyed cache with per-key single-flight loading.
pub struct SingleflightCache<V> {
    entries: Mutex<HashMap<String, EntryState<V>>>,
    ttl: Duration,
}

impl<V: Clone + Send + Sync> SingleflightCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Get the cached value for the key, running the loader on a miss.
    /// Only one loader runs per key at a time; a failed load is not cached.
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> Result<V, PipedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, PipedError>>,
    {
        let tx = {
            let mut entries = self.entries.lock().await;
            match entries.get(key) {
                Some(EntryState::Ready { value, expires_at }) if *expires_at > Instant::now() => {
                    return Ok(value.clone());
                }
                Some(EntryState::Pending(rx)) => {
                    let mut rx = rx.clone();
                    drop(entries);
                    // Await the in-flight loader.
                    loop {
                        if let Some(result) = rx.borrow().clone() {
                            return result.map_err(PipedError::Internal);
                        }
                        if rx.changed().await.is_err() {
                            return Err(PipedError::Internal(
                                "in-flight cache loader dropped".to_string(),
                            ));
                        }
                    }
                }
                _ => {
                    let (tx, rx) = watch::channel(None);
                    entries.insert(key.to_string(), EntryState::Pending(rx));
                    tx
                }
            }
        };

        let result = loader().await;

        let mut entries = self.entries.lock().await;
        match &result {
            Ok(value) => {
                entries.insert(
                    key.to_string(),
                    EntryState::Ready {
                        value: value.clone(),
                        expires_at: Instant::now() + self.ttl,
                    },
                );
            }
            Err(_) => {
                entries.remove(key);
            }
        }
        drop(entries);

        let shared = result
            .as_ref()
            .map(|v| v.clone())
            .map_err(|e| e.to_string());
        let _ = tx.send(Some(shared));

        result
    }

    /// Drop a cached entry, forcing the next get to reload.
    pub async fn invalidate(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        if matches!(entries.get(key), Some(EntryState::Ready { .. })) {
            entries.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_hit_skips_loader() {
        let cache: SingleflightCache<u32> = SingleflightCache::new(Duration::from_secs(60));
        let loads = AtomicU32::new(0);

        let v = cache
            .get_or_load("k", || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(v, 7);

        let v = cache
            .get_or_load("k", || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(8)
            })
            .await
            .unwrap();
        assert_eq!(v, 7);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_run_one_loader() {
        let cache: Arc<SingleflightCache<u32>> =
            Arc::new(SingleflightCache::new(Duration::from_secs(60)));
        let loads = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let loads = loads.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("k", || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        // Hold the flight open long enough for others to join.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_not_cached() {
        let cache: SingleflightCache<u32> = SingleflightCache::new(Duration::from_secs(60));

        let err = cache
            .get_or_load("k", || async { Err(PipedError::Internal("boom".into())) })
            .await;
        assert!(err.is_err());

        let v = cache.get_or_load("k", || async { Ok(5) }).await.unwrap();
        assert_eq!(v, 5);
    }
}
