//! Per-transfer-id mutual exclusion.
//!
//! Two receive cycles for the same id must not append to the cache file
//! concurrently; cycles for different ids never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedMutexGuard;

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Registry of async locks keyed by transfer id.
///
/// Entries exist only while some cycle holds or waits on them.
#[derive(Debug, Clone, Default)]
pub struct TransferLocks {
    map: Arc<Mutex<LockMap>>,
}

impl TransferLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other holder owns `id`, then takes it.
    pub async fn acquire(&self, id: &str) -> TransferGuard {
        let lock = {
            let mut map = lock_map(&self.map);
            Arc::clone(map.entry(id.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        TransferGuard {
            id: id.to_string(),
            guard: Some(guard),
            map: Arc::clone(&self.map),
        }
    }

    /// Number of ids currently held or awaited.
    pub fn len(&self) -> usize {
        lock_map(&self.map).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds one id's lock until dropped.
#[derive(Debug)]
pub struct TransferGuard {
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
    map: Arc<Mutex<LockMap>>,
}

impl TransferGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        // Release first so the strong count reflects only waiters.
        drop(self.guard.take());
        let mut map = lock_map(&self.map);
        if let Some(lock) = map.get(&self.id)
            && Arc::strong_count(lock) == 1
        {
            map.remove(&self.id);
        }
    }
}

fn lock_map(map: &Mutex<LockMap>) -> MutexGuard<'_, LockMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_id_is_exclusive() {
        let locks = TransferLocks::new();
        let first = locks.acquire("a").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("a").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_ids_do_not_block() {
        let locks = TransferLocks::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_secs(1), locks.acquire("b"))
            .await
            .unwrap();
        assert_eq!(b.id(), "b");
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn entry_removed_after_last_release() {
        let locks = TransferLocks::new();
        drop(locks.acquire("a").await);
        assert!(locks.is_empty());
    }
}
