use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

/// Per-workspace write serialization. Held across the oracle check and the
/// store write so two writers on one workspace never both see it free.
#[derive(Default)]
pub struct WorkspaceLocks {
    inner: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl WorkspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, workspace_id: Ulid) -> OwnedMutexGuard<()> {
        let mutex = self.inner.entry(workspace_id).or_default().clone();
        mutex.lock_owned().await
    }

    /// Lock several workspaces in id order so concurrent multi-locks cannot deadlock.
    pub async fn lock_many(&self, ids: &[Ulid]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock(id).await);
        }
        guards
    }

    /// Drop entries for workspaces that no longer exist. Entries still held are kept.
    pub fn forget(&self, ids: &[Ulid]) {
        for id in ids {
            self.inner.remove_if(id, |_, m| Arc::strong_count(m) == 1);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_workspace_serializes() {
        let locks = Arc::new(WorkspaceLocks::new());
        let ws = Ulid::new();
        let guard = locks.lock(ws).await;

        let l2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = l2.lock(ws).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn different_workspaces_do_not_block() {
        let locks = WorkspaceLocks::new();
        let _a = locks.lock(Ulid::new()).await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.lock(Ulid::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lock_many_dedups() {
        let locks = WorkspaceLocks::new();
        let ws = Ulid::new();
        let guards = locks.lock_many(&[ws, ws]).await;
        assert_eq!(guards.len(), 1);
    }

    #[tokio::test]
    async fn forget_keeps_held_entries() {
        let locks = WorkspaceLocks::new();
        let held = Ulid::new();
        let idle = Ulid::new();
        let _g = locks.lock(held).await;
        drop(locks.lock(idle).await);
        locks.forget(&[held, idle]);
        assert_eq!(locks.len(), 1);
    }
}
