//! Pending-operation correlator
//!
//! Bridges state known only at an operation's entry to the matching exit.
//! One entry per key: a second `stage` for the same key overwrites the
//! first. An entry whose exit never fires stays until the key is reused;
//! there is no expiry.

use crate::bounded::BoundedMap;
use crate::error::Result;
use crate::telemetry::Table;
use std::hash::Hash;

pub struct PendingTable<K, V>
where
    K: Eq + Hash,
{
    entries: BoundedMap<K, V>,
}

impl<K, V> PendingTable<K, V>
where
    K: Eq + Hash,
{
    pub fn new(table: Table, capacity: usize) -> Self {
        Self {
            entries: BoundedMap::new(table, capacity),
        }
    }

    /// Store `value` under `key`, replacing anything already staged
    pub fn stage(&self, key: K, value: V) -> Result<()> {
        self.entries.insert(key, value).map(|_| ())
    }

    /// Take the staged value, leaving no entry behind
    pub fn consume(&self, key: &K) -> Option<V> {
        self.entries.remove(key)
    }

    /// Drop a staged value without using it
    pub fn discard(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
