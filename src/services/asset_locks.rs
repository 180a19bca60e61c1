//! Per-asset serialization.
//!
//! The advisory lock stored inside metadata is only safe if its
//! load → check → apply → persist sequence cannot interleave with another
//! caller's. `AssetLocks` hands out one async mutex per asset id; callers on
//! different ids never wait on each other.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::OwnedMutexGuard;

use crate::models::asset::AssetId;

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Clone, Default)]
pub struct AssetLocks {
    slots: Arc<Mutex<HashMap<AssetId, Slot>>>,
}

/// Exclusive access to one asset until dropped.
pub struct AssetGuard {
    id: AssetId,
    locks: AssetLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl AssetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<AssetId, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: AssetId) -> AssetGuard {
        // Declared before the wait so it drops after it: a cancelled wait
        // still prunes the slot.
        let mut held = AssetGuard {
            id,
            locks: self.clone(),
            guard: None,
        };
        let slot = self.slots().entry(id).or_default().clone();
        let waiting = slot.lock_owned();
        tokio::pin!(waiting);
        held.guard = Some((&mut waiting).await);
        held
    }

    /// Number of ids currently held or awaited.
    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.slots().len()
    }
}

impl Drop for AssetGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.locks.slots();
        // Only the map itself still references the slot: nobody holds or
        // waits for it, so forget it.
        if slots
            .get(&self.id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_id_is_exclusive() {
        let locks = AssetLocks::new();
        let id = AssetId::new();
        let first = locks.acquire(id).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(first);
        contender.await.unwrap();
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn distinct_ids_do_not_contend() {
        let locks = AssetLocks::new();
        let _a = locks.acquire(AssetId::new()).await;
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.acquire(AssetId::new()))
            .await
            .expect("second id must not wait");
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn abandoned_wait_forgets_the_slot() {
        let locks = AssetLocks::new();
        let id = AssetId::new();
        let first = locks.acquire(id).await;

        let mut waiting = Box::pin(locks.acquire(id));
        assert!(futures::poll!(waiting.as_mut()).is_pending());
        drop(first);
        assert_eq!(locks.active(), 1);

        drop(waiting);
        assert_eq!(locks.active(), 0);
    }
}
