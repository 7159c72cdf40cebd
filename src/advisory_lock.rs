//! Per-disk advisory locks (§5 [AMBIENT]): serialize job starts against
//! the same live QCOW2 file, keyed on `(vmContextId, diskIndex)`.
//!
//! Modeled on `pbs-datastore::chunk_store`'s `ProcessLocker`, adapted to
//! an in-process async lock since the hub is a single daemon
//! rather than multiple cooperating CLIs: a process-wide map of
//! `Arc<tokio::sync::Mutex<()>>`, one per key, created lazily and kept
//! alive only while held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

use vbr_api_types::VmContextId;

pub type LockKey = (VmContextId, u32);

#[derive(Default)]
pub struct AdvisoryLocks {
    table: StdMutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

impl AdvisoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: LockKey) -> Arc<Mutex<()>> {
        let mut table = self.table.lock().expect("advisory lock table poisoned");
        table.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Acquire every key in `keys`, sorted first so two callers racing to
    /// lock the same disk set always take their mutexes in the same order
    /// and can't deadlock on each other.
    pub async fn lock_all(&self, mut keys: Vec<LockKey>) -> Vec<OwnedMutexGuard<()>> {
        keys.sort_by(|a, b| a.0.0.cmp(&b.0.0).then(a.1.cmp(&b.1)));
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let mutex = self.entry(key);
            guards.push(mutex.lock_owned().await);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_lock_on_same_key_waits_for_the_first_to_drop() {
        let locks = Arc::new(AdvisoryLocks::new());
        let ctx = VmContextId("vm-1".to_string());

        let first = locks.lock_all(vec![(ctx.clone(), 2000)]).await;

        let locks2 = locks.clone();
        let ctx2 = ctx.clone();
        let handle = tokio::spawn(async move {
            let _second = locks2.lock_all(vec![(ctx2, 2000)]).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        drop(first);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let locks = AdvisoryLocks::new();
        let ctx = VmContextId("vm-1".to_string());
        let _a = locks.lock_all(vec![(ctx.clone(), 2000)]).await;
        let _b = locks.lock_all(vec![(ctx, 2001)]).await;
    }
}
