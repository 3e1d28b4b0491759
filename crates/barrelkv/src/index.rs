//! The key index: an in-memory map from key to its current
//! [`RecordLocator`], the source of truth for every `get`.

use bytes::Bytes;
use dashmap::DashMap;

use crate::error::Error;
use crate::locator::RecordLocator;
use crate::record::MAX_KEY_LEN;

/// Concurrent key -> locator map backed by `dashmap`.
///
/// Every mutation is a single sharded-map operation, so `put`/`remove`
/// never need an external lock; the one place that does need
/// read-then-write atomicity is merge's freshness check, which goes
/// through [`KeyIndex::replace`] instead of a plain `get` + `put`.
#[derive(Debug, Default)]
pub struct KeyIndex {
    map: DashMap<Bytes, RecordLocator>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    fn check_key(key: &[u8]) -> Result<(), Error> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidKey {
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        Ok(())
    }

    /// Inserts or overwrites `key`'s locator, returning the prior value
    /// if one existed.
    pub fn put(&self, key: Bytes, locator: RecordLocator) -> Result<Option<RecordLocator>, Error> {
        Self::check_key(&key)?;
        Ok(self.map.insert(key, locator))
    }

    pub fn get(&self, key: &[u8]) -> Option<RecordLocator> {
        self.map.get(key).map(|entry| *entry.value())
    }

    /// Removes `key` entirely, returning its prior locator if present.
    pub fn remove(&self, key: &[u8]) -> Option<RecordLocator> {
        self.map.remove(key).map(|(_, locator)| locator)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    /// Compare-and-set: replaces `key`'s locator with `new` only if its
    /// current locator still equals `expected`.
    ///
    /// Used by the merge scheduler to publish a record's new location
    /// without clobbering a write that landed on the same key while the
    /// merge was in flight (spec.md §4.7 "freshness" check).
    pub fn replace(&self, key: &[u8], expected: RecordLocator, new: RecordLocator) -> bool {
        match self.map.get_mut(key) {
            Some(mut entry) if *entry.value() == expected => {
                *entry.value_mut() = new;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Part of the Key Index contract (spec.md §4.3: `put`, `get`,
    /// `remove`, `replace`, `containsKey`, `close`). `DashMap` has no
    /// handles or background tasks of its own to release, so this is a
    /// no-op — it exists so `Engine::close` has the documented operation
    /// to call rather than relying on `KeyIndex`'s `Drop` implicitly.
    pub fn close(&self) {}

    /// Snapshots every (key, locator) pair currently in the index.
    /// Used by merge to decide which entries in a victim file are still
    /// live without holding any single lock for the whole scan.
    pub fn snapshot(&self) -> Vec<(Bytes, RecordLocator)> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}
