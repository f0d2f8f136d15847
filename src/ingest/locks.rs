use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per key, created on first use.
///
/// Used to serialise cursor writers per contract and QF runs per round within
/// one process. Cross-process exclusion comes from the SQLite write lock.
#[derive(Debug)]
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
        let mutex = {
            let mut map = match self.locks.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.entry(key.clone()).or_default().clone()
        };
        mutex.lock_owned().await
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_same_key_excludes_other_keys_do_not() {
        let locks: KeyedLocks<String> = KeyedLocks::new();
        let a = "a".to_string();
        let b = "b".to_string();
        let wait = Duration::from_millis(20);

        let guard = locks.lock(&a).await;
        assert!(timeout(wait, locks.lock(&a)).await.is_err());
        assert!(timeout(wait, locks.lock(&b)).await.is_ok());
        drop(guard);
        assert!(timeout(wait, locks.lock(&a)).await.is_ok());
    }
}
