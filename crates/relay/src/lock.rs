// Keyed asynchronous mutual exclusion.
//
// `acquire` suspends until the caller exclusively holds the key, then
// returns a guard; the critical section may await freely while the guard
// lives. Waiters for a held key queue FIFO (tokio's mutex is fair), and the
// guard releases on drop, so early returns and panics in a critical section
// never wedge the queue. Entries are reference counted and leave the map
// once no holder or waiter remains.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

struct LockEntry {
    mutex: Arc<Mutex<()>>,
    /// Holders plus queued waiters for this key.
    refs: usize,
}

type LockTable = Arc<StdMutex<HashMap<String, LockEntry>>>;

/// Per-resource-key mutual exclusion across asynchronous critical sections.
///
/// Used to serialize workspace teardown against concurrent teardown attempts
/// for the same workspace.
#[derive(Default, Clone)]
pub struct LockManager {
    // The table itself is only ever touched in short synchronous sections.
    entries: LockTable,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the critical section for `key` is exclusively held.
    pub async fn acquire(&self, key: &str) -> LockGuard {
        let mutex = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = entries.entry(key.to_owned()).or_insert_with(|| LockEntry {
                mutex: Arc::new(Mutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            Arc::clone(&entry.mutex)
        };

        let held = mutex.lock_owned().await;
        LockGuard { entries: Arc::clone(&self.entries), key: key.to_owned(), _held: held }
    }

    /// Number of keys with a live holder or waiter.
    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn release_entry(entries: &LockTable, key: &str) {
    let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(entry) = entries.get_mut(key) {
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            entries.remove(key);
        }
    }
}

/// Scoped handle to a held critical section. Dropping it releases the key
/// and wakes the next queued waiter.
pub struct LockGuard {
    entries: LockTable,
    key: String,
    _held: OwnedMutexGuard<()>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        release_entry(&self.entries, &self.key);
    }
}
