pub mod errors;
pub mod config;
pub mod topology;
pub mod data_store;
pub mod cluster;
pub mod conflict;
pub mod manager;

// Re-export key types and structs for easier access
pub use errors::{Result, RiftmendError};
pub use config::{ConflictManagerConfig, MergePolicyKind};
pub use topology::{HashLayout, NodeId, Phase, TopologyView};
pub use data_store::versioned_value::{CacheEntry, ConflictRecord, Metadata, VersionMap, VersionedValue};
pub use cluster::{ClusterServices, Response};
pub use conflict::merge_policy::{EntryMergePolicy, MergePolicyRegistry};
pub use conflict::resolution::ResolutionSummary;
pub use manager::{prelude, ConflictManager};
