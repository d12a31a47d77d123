use std::sync::Arc;

use ahash::AHashMap as HashMap;

use crate::config::MergePolicyKind;
use crate::data_store::versioned_value::CacheEntry;
use crate::errors::{Result, RiftmendError};

/// Decides the surviving entry of a conflicting key.
///
/// `preferred` is the entry of the replica chosen as authoritative, `None`
/// when that replica holds no entry. `others` holds every other present
/// entry. Returning `None` deletes the key; returning an entry writes its
/// value and metadata as the resolved state.
///
/// Any `Fn(Option<CacheEntry>, Vec<CacheEntry>) -> Option<CacheEntry>`
/// closure is a merge policy.
pub trait EntryMergePolicy<K, V>: Send + Sync {
    fn merge(
        &self,
        preferred: Option<CacheEntry<K, V>>,
        others: Vec<CacheEntry<K, V>>,
    ) -> Option<CacheEntry<K, V>>;
}

impl<K, V, F> EntryMergePolicy<K, V> for F
where
    F: Fn(Option<CacheEntry<K, V>>, Vec<CacheEntry<K, V>>) -> Option<CacheEntry<K, V>> + Send + Sync,
{
    fn merge(
        &self,
        preferred: Option<CacheEntry<K, V>>,
        others: Vec<CacheEntry<K, V>>,
    ) -> Option<CacheEntry<K, V>> {
        self(preferred, others)
    }
}

/// Keeps the preferred entry, deleting the key when it is absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferredAlways;

impl<K, V> EntryMergePolicy<K, V> for PreferredAlways {
    fn merge(
        &self,
        preferred: Option<CacheEntry<K, V>>,
        _others: Vec<CacheEntry<K, V>>,
    ) -> Option<CacheEntry<K, V>> {
        preferred
    }
}

/// Keeps the preferred entry, falling back to the first present other entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferredNonNull;

impl<K, V> EntryMergePolicy<K, V> for PreferredNonNull {
    fn merge(
        &self,
        preferred: Option<CacheEntry<K, V>>,
        others: Vec<CacheEntry<K, V>>,
    ) -> Option<CacheEntry<K, V>> {
        preferred.or_else(|| others.into_iter().next())
    }
}

/// Deletes every conflicting key.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveAll;

impl<K, V> EntryMergePolicy<K, V> for RemoveAll {
    fn merge(
        &self,
        _preferred: Option<CacheEntry<K, V>>,
        _others: Vec<CacheEntry<K, V>>,
    ) -> Option<CacheEntry<K, V>> {
        None
    }
}

/// Named merge policies selectable from configuration.
pub struct MergePolicyRegistry<K, V> {
    named: HashMap<String, Arc<dyn EntryMergePolicy<K, V>>>,
}

impl<K, V> Default for MergePolicyRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MergePolicyRegistry<K, V> {
    pub fn new() -> Self {
        Self {
            named: HashMap::new(),
        }
    }

    /// Registers `policy` under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, policy: Arc<dyn EntryMergePolicy<K, V>>) {
        self.named.insert(name.into(), policy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EntryMergePolicy<K, V>>> {
        self.named.get(name).cloned()
    }
}

impl<K: 'static, V: 'static> MergePolicyRegistry<K, V> {
    /// Instantiates the policy selected by `kind`.
    ///
    /// Returns `Ok(None)` for `MergePolicyKind::None`.
    ///
    /// # Errors
    ///
    /// `RiftmendError::MergeConfig` if a custom policy name is not registered.
    pub fn create(&self, kind: &MergePolicyKind) -> Result<Option<Arc<dyn EntryMergePolicy<K, V>>>> {
        let policy: Arc<dyn EntryMergePolicy<K, V>> = match kind {
            MergePolicyKind::None => return Ok(None),
            MergePolicyKind::PreferredAlways => Arc::new(PreferredAlways),
            MergePolicyKind::PreferredNonNull => Arc::new(PreferredNonNull),
            MergePolicyKind::RemoveAll => Arc::new(RemoveAll),
            MergePolicyKind::Custom(name) => self.get(name).ok_or_else(|| {
                RiftmendError::MergeConfig(format!("no merge policy registered as '{}'", name))
            })?,
        };
        Ok(Some(policy))
    }
}
