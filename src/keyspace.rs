/*!
 * Worker-Local Keyspace
 *
 * This module provides the keyspace a worker serializes from. The map is
 * seeded with the hash seed transplanted from the parent so that
 * hash-dependent iteration order is reproducible: two keyspaces built with
 * the same seed and the same insertion history walk their entries in the
 * same order, which the snapshot serializer relies on for determinism.
 */

use bytes::Bytes;
use std::collections::HashMap;
use xxhash_rust::xxh3::Xxh3Builder;

use crate::state::HashSeed;

/// Value types held by the keyspace
///
/// Same shapes the parent stores: raw bytes or a decoded 64-bit integer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// String/binary data
    Str(Bytes),
    /// 64-bit signed integer
    Int(i64),
}

/// Seeded in-memory dictionary
///
/// The worker's process-local copy of the dataset. Populated by the
/// launcher from the hand-off mapping; from then on it is independently
/// owned and never synchronized with the parent.
pub struct Keyspace {
    inner: HashMap<Bytes, Value, Xxh3Builder>,
}

impl Keyspace {
    /// Create an empty keyspace hashing with the transplanted seed
    pub fn with_seed(seed: &HashSeed) -> Self {
        Self {
            inner: HashMap::with_hasher(Xxh3Builder::new().with_seed(seed.fold())),
        }
    }

    /// Get a value by key
    #[inline]
    pub fn get(&self, k: &[u8]) -> Option<&Value> {
        self.inner.get(k)
    }

    /// Insert or replace a key-value pair
    #[inline]
    pub fn set(&mut self, k: Bytes, v: Value) {
        self.inner.insert(k, v);
    }

    /// Delete a key, returning whether it existed
    #[inline]
    pub fn del(&mut self, k: &[u8]) -> bool {
        self.inner.remove(k).is_some()
    }

    /// Number of live keys
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when no keys are present
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterate entries in hash order
    ///
    /// Order is a function of the seed and the insertion history only.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Value)> {
        self.inner.iter()
    }
}
