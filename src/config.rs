use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Selects the merge policy applied by automatic conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergePolicyKind {
    /// No automatic merge. Automatic resolution fails with a configuration error.
    None,
    /// Always keep the preferred entry, deleting the key if it is absent.
    #[default]
    PreferredAlways,
    /// Keep the preferred entry, or the first present entry if it is absent.
    PreferredNonNull,
    /// Delete every conflicting key.
    RemoveAll,
    /// A policy registered under this name in the `MergePolicyRegistry`.
    Custom(String),
}

/// Configuration of a `ConflictManager`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictManagerConfig {
    /// Name of the cache, used in log lines and errors.
    #[serde(default = "default_cache_name")]
    pub cache_name: String,

    /// Deadline for one whole conflict scan (milliseconds).
    #[serde(default = "default_conflict_timeout_ms")]
    pub conflict_timeout_ms: u64,

    /// Policy used by `resolve_conflicts` and automatic resolution.
    #[serde(default)]
    pub merge_policy: MergePolicyKind,

    /// Number of fetched segments buffered ahead of the consumer.
    #[serde(default = "default_segment_buffer")]
    pub segment_buffer: usize,
}

fn default_cache_name() -> String {
    "default".to_string()
}

fn default_conflict_timeout_ms() -> u64 {
    240_000
}

fn default_segment_buffer() -> usize {
    1
}

impl Default for ConflictManagerConfig {
    fn default() -> Self {
        Self {
            cache_name: default_cache_name(),
            conflict_timeout_ms: default_conflict_timeout_ms(),
            merge_policy: MergePolicyKind::default(),
            segment_buffer: default_segment_buffer(),
        }
    }
}

impl ConflictManagerConfig {
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    pub fn with_conflict_timeout(mut self, timeout: Duration) -> Self {
        self.conflict_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_merge_policy(mut self, kind: MergePolicyKind) -> Self {
        self.merge_policy = kind;
        self
    }

    pub fn with_segment_buffer(mut self, segments: usize) -> Self {
        self.segment_buffer = segments;
        self
    }

    pub fn conflict_timeout(&self) -> Duration {
        Duration::from_millis(self.conflict_timeout_ms)
    }
}
