//! Per-entity pessimistic locks.
//!
//! redb serializes write transactions but has no row locks, and a
//! deployment step must hold its rows across an awaited scheduler query.
//! The `LockTable` hands out one async mutex per entity id. A holder keeps
//! the returned [`EntityLock`] alive until its transaction has committed
//! or been abandoned; dropping it releases the row to the next waiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

type Entries = HashMap<String, Arc<AsyncMutex<()>>>;

/// Lock table keyed by entity id. Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct LockTable {
    entries: Arc<Mutex<Entries>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`.
    pub async fn lock(&self, key: &str) -> EntityLock {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(key.to_string()).or_default())
        };
        let guard = entry.lock_owned().await;
        trace!(%key, "entity locked");
        EntityLock {
            key: key.to_string(),
            guard: Some(guard),
            table: self.clone(),
        }
    }

    /// Lock every key in the order given, skipping repeats.
    ///
    /// Callers must pass keys in a globally consistent order (deployment,
    /// app, then processes) so that two steps never wait on each other.
    pub async fn lock_in_order(&self, keys: &[&str]) -> Vec<EntityLock> {
        let mut held: Vec<EntityLock> = Vec::with_capacity(keys.len());
        for key in keys {
            if held.iter().any(|lock| lock.key() == *key) {
                continue;
            }
            held.push(self.lock(key).await);
        }
        held
    }

    /// Number of entities currently locked or awaited.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive hold on one entity id, released on drop.
pub struct EntityLock {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: LockTable,
}

impl EntityLock {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for EntityLock {
    fn drop(&mut self) {
        let mut entries = self.table.entries.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        // Waiters clone the entry under the table lock, so a count of one
        // means nobody else holds or awaits this key.
        if let Some(entry) = entries.get(&self.key)
            && Arc::strong_count(entry) == 1
        {
            entries.remove(&self.key);
        }
        trace!(key = %self.key, "entity unlocked");
    }
}
