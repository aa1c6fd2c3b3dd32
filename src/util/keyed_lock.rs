// Per-key async mutual exclusion
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lock that serialises callers holding the same key while callers with
/// different keys proceed in parallel. Entries are dropped as soon as the
/// last holder or waiter for a key goes away.
pub struct KeyedLock<K: Eq + Hash + Clone> {
    locks: Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn acquire(&self, key: K) -> KeyedLockGuard<K> {
        let lock = {
            let mut locks = lock_map(&self.locks);
            locks.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        let guard = lock.lock_owned().await;
        KeyedLockGuard {
            key,
            locks: self.locks.clone(),
            _guard: guard,
        }
    }

    /// Number of keys currently held or waited on
    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct KeyedLockGuard<K: Eq + Hash + Clone> {
    key: K,
    locks: Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>,
    _guard: OwnedMutexGuard<()>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedLockGuard<K> {
    fn drop(&mut self) {
        let mut locks = lock_map(&self.locks);
        // one reference in the map and one inside our own guard: nobody is waiting
        let unused = locks
            .get(&self.key)
            .map(|lock| Arc::strong_count(lock) == 2)
            .unwrap_or(false);
        if unused {
            locks.remove(&self.key);
        }
    }
}

fn lock_map<K>(locks: &Mutex<HashMap<K, Arc<AsyncMutex<()>>>>) -> std::sync::MutexGuard<'_, HashMap<K, Arc<AsyncMutex<()>>>> {
    match locks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
