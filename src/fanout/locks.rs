//! Per-target exclusive locks
//!
//! At most one operation runs against a rank or device at a time. Locks are
//! taken without waiting: contention is reported back as `Busy` instead of
//! queueing the second caller.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Guard held by the task operating on a target; dropping it releases the target
pub type TargetGuard = OwnedMutexGuard<()>;

/// Lazily-created lock per target key
#[derive(Debug)]
pub struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    /// Take the target's lock if nobody holds it
    pub fn try_acquire(&self, key: &K) -> Option<TargetGuard> {
        self.lock_for(key).try_lock_owned().ok()
    }

    /// True while an operation holds the target
    pub fn is_locked(&self, key: &K) -> bool {
        self.locks
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of targets that ever had a lock created
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
