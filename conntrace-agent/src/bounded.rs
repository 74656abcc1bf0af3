//! Fixed-capacity concurrent map
//!
//! Wraps a sharded [`DashMap`] so that each operation on one key is atomic
//! without any map-wide lock. Inserting a new key into a full map fails
//! instead of evicting; updating an existing key always succeeds.

use crate::error::{ConnTraceError, Result};
use crate::telemetry::Table;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct BoundedMap<K, V>
where
    K: Eq + Hash,
{
    inner: DashMap<K, V>,
    len: AtomicUsize,
    capacity: usize,
    table: Table,
}

impl<K, V> BoundedMap<K, V>
where
    K: Eq + Hash,
{
    /// Create a map pre-sized for `capacity` entries
    pub fn new(table: Table, capacity: usize) -> Self {
        Self {
            inner: DashMap::with_capacity(capacity),
            len: AtomicUsize::new(0),
            capacity,
            table,
        }
    }

    /// Insert or overwrite, returning the previous value for the key.
    ///
    /// A new key is only admitted while fewer than `capacity` entries exist.
    /// The slot is reserved while the key's shard is held, so concurrent
    /// inserts of distinct keys can never overshoot the capacity.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        match self.inner.entry(key) {
            Entry::Occupied(mut entry) => Ok(Some(entry.insert(value))),
            Entry::Vacant(entry) => {
                self.reserve()?;
                entry.insert(value);
                Ok(None)
            }
        }
    }

    /// Insert only when the key is absent. Returns `Ok(false)` when an entry
    /// already existed and was left untouched.
    pub fn insert_if_absent(&self, key: K, value: V) -> Result<bool> {
        match self.inner.entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                self.reserve()?;
                entry.insert(value);
                Ok(true)
            }
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let (_, value) = self.inner.remove(key)?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn reserve(&self) -> Result<()> {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| ConnTraceError::MapFull {
                table: self.table,
                capacity: self.capacity,
            })
    }
}

impl<K, V> BoundedMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|r| r.value().clone())
    }
}
