/// Per-name mutual exclusion
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Async mutexes keyed by name. Distinct names never contend.
///
/// Entries nobody holds or waits on are dropped the next time a lock is taken.
#[derive(Default)]
pub struct NameLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `name`. Released when the guard drops.
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // the map's own clone is the only reference to an idle entry
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry(name.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_name_is_exclusive() {
        let locks = NameLocks::new();
        let guard = locks.lock("dev").await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.lock("dev")).await;
        assert!(blocked.is_err());
        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock("prod")).await;
        assert!(other.is_ok());

        drop(guard);
        let again = tokio::time::timeout(Duration::from_millis(50), locks.lock("dev")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = NameLocks::new();
        for i in 0..16 {
            drop(locks.lock(&format!("env-{}", i)).await);
        }

        let held = locks.lock("dev").await;
        assert_eq!(locks.len(), 1);

        // a held entry survives pruning
        let _other = locks.lock("prod").await;
        assert_eq!(locks.len(), 2);
        drop(held);
    }
}
