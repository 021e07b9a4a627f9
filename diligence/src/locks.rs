//! Keyed mutual exclusion for read-modify-write cycles.
//!
//! One mutex per key (a job id or a normalized entity key). Every mutation
//! of a job's scratchpad or queue runs under that job's lock; every entity
//! memory update runs under the entity's lock. When both are needed the job
//! lock is taken first.
//!
//! An entry lives only while some caller holds or waits on it, so the map
//! stays as small as the number of keys currently in use.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        // Clone the Arc out so the shard guard is released before blocking.
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Run `f` while holding `key`'s lock. Poisoning is ignored; the guarded
    /// state lives in the store, not behind the mutex.
    pub fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.lock_for(key);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        // Every holder or waiter owns a clone; two left means the map and us.
        self.locks.remove_if(key, |_, entry| {
            Arc::ptr_eq(entry, &lock) && Arc::strong_count(entry) == 2
        });
        result
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_key_is_serialized() {
        let locks = KeyedLocks::new();
        let inside = AtomicUsize::new(0);
        let max_seen = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    locks.with_lock("job-1", || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                });
            }
        });
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn distinct_keys_do_not_block_each_other() {
        let locks = KeyedLocks::new();
        let value = locks.with_lock("job-1", || {
            locks.with_lock("acme-corp", || {
                assert_eq!(locks.len(), 2);
                42
            })
        });
        assert_eq!(value, 42);
    }

    #[test]
    fn released_keys_are_evicted() {
        let locks = KeyedLocks::new();
        for i in 0..100 {
            locks.with_lock(&format!("job-{i}"), || ());
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let locks = KeyedLocks::new();
        let _ = thread::scope(|scope| {
            scope
                .spawn(|| locks.with_lock::<()>("job-1", || panic!("boom")))
                .join()
        });
        assert_eq!(locks.with_lock("job-1", || 7), 7);
    }
}
