//! Sender identities and the per-identity state store.
//!
//! Every per-sender concern (token bucket, history, risk score, movement
//! tracker, challenge session) lives in its own [`IdentityMap`] owned by the
//! component responsible for it. The map hands out one mutex per identity,
//! so messages from different senders never contend on each other's state
//! and concurrent messages from the same sender are serialized.
//!
//! # Thread Safety
//!
//! The outer `RwLock` is held only long enough to look up or insert the
//! entry; all mutation happens under the entry's own `Mutex`.
//!
//! # Invariants
//!
//! - Get-or-create is atomic: two racing callers for the same identity
//!   always observe the same entry.
//! - Lock poisoning never propagates; a panic while one identity's entry is
//!   held does not affect any other identity.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Opaque, session-scoped key for a chat sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    /// Wraps a host-provided identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for IdentityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for IdentityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Concurrent map from identity to independently locked state.
pub struct IdentityMap<T> {
    entries: RwLock<HashMap<IdentityId, Arc<Mutex<T>>>>,
}

impl<T> Default for IdentityMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for IdentityMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityMap")
            .field("tracked", &self.len())
            .finish()
    }
}

impl<T> IdentityMap<T> {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the entry for `id`, creating it with `init` if absent.
    pub fn get_or_insert_with(&self, id: &IdentityId, init: impl FnOnce() -> T) -> Arc<Mutex<T>> {
        {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(id) {
                return Arc::clone(entry);
            }
        }

        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Another caller may have inserted between the read and write locks.
        Arc::clone(
            entries
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(init()))),
        )
    }

    /// Returns the entry for `id` if it exists.
    #[must_use]
    pub fn get(&self, id: &IdentityId) -> Option<Arc<Mutex<T>>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(Arc::clone)
    }

    /// Runs `f` on the entry for `id`, creating it with `init` if absent.
    pub fn with_or_insert<R>(
        &self,
        id: &IdentityId,
        init: impl FnOnce() -> T,
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        let entry = self.get_or_insert_with(id, init);
        let mut guard = lock(&entry);
        f(&mut guard)
    }

    /// Runs `f` on the entry for `id` if it exists.
    pub fn with_existing<R>(&self, id: &IdentityId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let entry = self.get(id)?;
        let mut guard = lock(&entry);
        Some(f(&mut guard))
    }

    /// Replaces the entry for `id` with a fresh value.
    pub fn insert(&self, id: &IdentityId, value: T) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::new(Mutex::new(value)));
    }

    /// Removes and returns the entry for `id`.
    pub fn remove(&self, id: &IdentityId) -> Option<Arc<Mutex<T>>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Returns the number of tracked identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no identity is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `id` has an entry.
    #[must_use]
    pub fn contains(&self, id: &IdentityId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }
}

/// Locks an entry, recovering from poisoning.
pub(crate) fn lock<T>(entry: &Mutex<T>) -> MutexGuard<'_, T> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_get_or_insert_returns_same_entry() {
        let map: IdentityMap<u32> = IdentityMap::new();
        let id = IdentityId::from("alice");

        let first = map.get_or_insert_with(&id, || 1);
        let second = map.get_or_insert_with(&id, || 99);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*lock(&second), 1);
    }

    #[test]
    fn test_with_existing_on_missing_identity() {
        let map: IdentityMap<u32> = IdentityMap::new();
        assert!(map.with_existing(&IdentityId::from("ghost"), |v| *v).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let map: IdentityMap<u32> = IdentityMap::new();
        map.with_or_insert(&"a".into(), || 0, |v| *v += 1);
        map.with_or_insert(&"b".into(), || 0, |v| *v += 1);
        assert_eq!(map.len(), 2);

        assert!(map.remove(&"a".into()).is_some());
        assert!(!map.contains(&"a".into()));

        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn test_concurrent_increments_same_identity() {
        let map = Arc::new(IdentityMap::<u64>::new());
        let id = IdentityId::from("shared");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = Arc::clone(&map);
                let id = id.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        map.with_or_insert(&id, || 0, |v| *v += 1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(map.with_existing(&id, |v| *v), Some(8_000));
    }
}
