//! Job and keyed locks.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard, OwnedMutexGuard};
use tracing::debug;

/// Single-flight guard for a periodic job. An overlapping tick gets `None`.
pub struct JobLock {
    name: &'static str,
    lock: AsyncMutex<()>,
}

impl JobLock {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            lock: AsyncMutex::new(()),
        }
    }

    pub fn try_start(&self) -> Option<MutexGuard<'_, ()>> {
        let guard = self.lock.try_lock().ok();
        if guard.is_none() {
            debug!(job = self.name, "previous run still in progress, skipping tick");
        }
        guard
    }
}

/// One async mutex per key, created on first use.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Drop entries nobody holds.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_job_lock_is_single_flight() {
        let job = JobLock::new("compute");
        let first = job.try_start();
        assert!(first.is_some());
        assert!(job.try_start().is_none());
        drop(first);
        assert!(job.try_start().is_some());
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::<u64>::new());
        let guard = locks.lock(&1).await;

        // Another key is free.
        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock(&2)).await;
        assert!(other.is_ok());

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&1).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }
}
