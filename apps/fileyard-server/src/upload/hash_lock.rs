//! Per-hash lock table
//!
//! Finalizing one content hash (lookup, blob placement, record insert or repair)
//! must not interleave with another finalize of the same hash. Entries exist
//! only while some task holds or waits for the hash.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct HashLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// Holds the lock for one hash until dropped
pub struct HashLockGuard {
    key: String,
    table: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl HashLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `hash`
    pub async fn acquire(&self, hash: &str) -> HashLockGuard {
        let key = hash.to_ascii_uppercase();
        let lock = {
            let mut table = self.inner.lock();
            table
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = lock.lock_owned().await;

        HashLockGuard {
            key,
            table: self.inner.clone(),
            guard: Some(guard),
        }
    }

    /// Number of hashes currently held or awaited
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for HashLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut table = self.table.lock();
        // Only the table's own reference left: nobody holds or waits for it
        if table
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            table.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = HashLocks::new();
        {
            let _guard = locks.acquire("abc").await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_same_hash_is_exclusive() {
        let locks = HashLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                // Mixed case maps to the same key
                let hash = if i % 2 == 0 { "ABCDEF" } else { "abcdef" };
                tokio::spawn(async move {
                    let _guard = locks.acquire(hash).await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_hashes_do_not_block() {
        let locks = HashLocks::new();
        let _a = locks.acquire("aaa").await;

        let b = tokio::time::timeout(Duration::from_secs(1), locks.acquire("bbb")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
