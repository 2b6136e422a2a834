//! Per-key mutual exclusion for the embedded backend.

use std::hash::Hash;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

/// One mutex per key, created on first use.
///
/// Holders of different keys never wait on each other. Entries live as
/// long as the store: one per user or payment it has touched.
pub(crate) struct KeyedLocks<K> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// The mutex guarding `key`.
    pub(crate) fn get(&self, key: &K) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(key) {
            return Arc::clone(&*lock);
        }
        Arc::clone(&*self.locks.entry(key.clone()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_shares_a_mutex() {
        let locks = KeyedLocks::new();
        assert!(Arc::ptr_eq(&locks.get(&"a"), &locks.get(&"a")));
        assert!(!Arc::ptr_eq(&locks.get(&"a"), &locks.get(&"b")));
    }

    #[test]
    fn held_key_does_not_block_others() {
        let locks = KeyedLocks::new();
        let a = locks.get(&1u32);
        let _held = a.lock().unwrap();
        let b = locks.get(&2u32);
        assert!(b.try_lock().is_ok());
        assert!(a.try_lock().is_err());
    }
}
