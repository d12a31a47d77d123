use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};

use crate::topology::NodeId;

/// Versioning metadata stored next to every cache value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Version of the write that produced the value.
    pub version: u64,
    /// Wall-clock millis at which the value was written.
    pub timestamp: u64,
}

impl Metadata {
    pub fn new(version: u64, timestamp: u64) -> Self {
        Self { version, timestamp }
    }
}

/// Represents a stored value together with its metadata.
///
/// Values held by different owners of the same key are compared with
/// `PartialEq`, so two replicas only agree when both the payload and the
/// metadata match.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue<V> {
    data: V,
    metadata: Metadata,
}

impl<V> VersionedValue<V> {
    /// Creates a new `VersionedValue`.
    ///
    /// # Arguments
    ///
    /// * `data` - The stored payload.
    /// * `metadata` - The version information written alongside the payload.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use riftmend::prelude::*;
    ///
    /// let value = VersionedValue::new("v1".to_string(), Metadata::new(3, 0));
    /// assert_eq!(value.version(), 3);
    /// ```
    pub fn new(data: V, metadata: Metadata) -> Self {
        Self { data, metadata }
    }

    /// Returns a reference to the payload.
    pub fn data(&self) -> &V {
        &self.data
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Returns the version of the value.
    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    pub fn into_data(self) -> V {
        self.data
    }
}

/// A key together with the value one owner holds for it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<K, V> {
    key: K,
    value: VersionedValue<V>,
}

impl<K, V> CacheEntry<K, V> {
    pub fn new(key: K, value: VersionedValue<V>) -> Self {
        Self { key, value }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &VersionedValue<V> {
        &self.value
    }

    pub fn metadata(&self) -> &Metadata {
        self.value.metadata()
    }

    pub fn into_parts(self) -> (K, VersionedValue<V>) {
        (self.key, self.value)
    }
}

/// Per-owner view of one key as collected by the conflict scanner.
///
/// `None` is the absent sentinel: that owner holds no entry for the key.
pub type ConflictRecord<K, V> = HashMap<NodeId, Option<CacheEntry<K, V>>>;

/// Per-owner values of one key as returned by the version collector.
pub type VersionMap<V> = HashMap<NodeId, Option<VersionedValue<V>>>;

/// Bounds every key handled by the conflict manager satisfies.
pub trait CacheKey: Clone + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Clone + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static {}

/// Bounds every value handled by the conflict manager satisfies.
pub trait CacheValue: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static {}
