use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Row-level mutual exclusion. One async mutex per key, created on first
/// use; multi-key acquisition sorts and dedups the keys so two operations
/// touching the same pair in swapped roles cannot deadlock.
pub struct LockTable<K> {
    locks: RwLock<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for LockTable<K>
where
    K: Eq + Hash + Ord + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> LockTable<K>
where
    K: Eq + Hash + Ord + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    async fn handle(&self, key: &K) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(key) {
                return lock.clone();
            }
        }
        let mut locks = self.locks.write().await;
        locks.entry(key.clone()).or_default().clone()
    }

    pub async fn acquire(&self, key: &K) -> OwnedMutexGuard<()> {
        self.handle(key).await.lock_owned().await
    }

    /// Acquire several row locks in the fixed global order (ascending key).
    pub async fn acquire_ordered(&self, keys: &[K]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<K> = keys.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for key in &sorted {
            guards.push(self.acquire(key).await);
        }
        guards
    }
}
