use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap as HashMap;
use futures::future::BoxFuture;

use crate::data_store::versioned_value::{ConflictRecord, VersionedValue};
use crate::errors::Result;
use crate::topology::{NodeId, TopologyView};

/// Answer of a single owner to a remote value fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum Response<V> {
    /// The owner answered with its current value, `None` if it holds no entry.
    Success(Option<VersionedValue<V>>),
    /// The owner cannot currently tell whether it owns the key, typically
    /// because a rebalance is in flight.
    Unsure,
    /// The owner left the cluster or does not run the cache.
    NotFound,
    /// Any other answer. Treated as a protocol error by the version collector.
    Other(String),
}

/// Flags carried by value reads issued by the conflict manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchFlags {
    /// Read even if the receiving node does not consider itself an owner.
    pub skip_ownership_check: bool,
    /// Never leave the local node.
    pub local_only: bool,
    /// Read without acquiring the key lock.
    pub skip_locking: bool,
}

impl FetchFlags {
    /// Flags for the in-process read of the local replica.
    pub const LOCAL: FetchFlags = FetchFlags {
        skip_ownership_check: true,
        local_only: true,
        skip_locking: true,
    };

    /// Flags for the multi-owner remote read.
    pub const REMOTE: FetchFlags = FetchFlags {
        skip_ownership_check: true,
        local_only: false,
        skip_locking: false,
    };
}

/// Flags carried by the writes that apply a merge outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteFlags {
    /// The caller does not need the previous value.
    pub ignore_return_values: bool,
    /// The write originates from automatic conflict resolution, not from a user.
    pub put_for_state_transfer: bool,
}

impl WriteFlags {
    pub const USER_MERGE: WriteFlags = WriteFlags {
        ignore_return_values: true,
        put_for_state_transfer: false,
    };

    pub const AUTO_MERGE: WriteFlags = WriteFlags {
        ignore_return_values: true,
        put_for_state_transfer: true,
    };
}

/// Trait for fetching the current value of a key from a set of owners.
///
/// Implementations wrap the RPC transport. The returned future resolves to
/// one `Response` per owner that answered; dropping the future cancels the
/// local side of the call without necessarily interrupting the remote nodes.
///
/// # Errors
///
/// The future fails with `RiftmendError::Remote` when the call itself could
/// not be executed.
pub trait RemoteValueFetcher<K, V>: Send + Sync {
    fn fetch_value(
        &self,
        key: &K,
        owners: &[NodeId],
        topology_id: u64,
        flags: FetchFlags,
    ) -> BoxFuture<'static, Result<HashMap<NodeId, Response<V>>>>;
}

/// In-process read of the local replica, honoring `FetchFlags::LOCAL`.
pub trait LocalValueReader<K, V>: Send + Sync {
    fn read_local(&self, key: &K, flags: FetchFlags) -> Option<VersionedValue<V>>;
}

/// Trait for the state-transfer component that can pull every replica of a
/// segment from all of its owners.
///
/// Each record of the returned list maps every owner of one key to the entry
/// that owner holds, with `None` standing for a missing entry.
pub trait ReplicaFetcher<K, V>: Send + Sync {
    fn fetch_all_replicas(
        &self,
        segment: usize,
        topology: Arc<TopologyView>,
        deadline: Instant,
    ) -> BoxFuture<'static, Result<Vec<ConflictRecord<K, V>>>>;

    /// Releases whatever the fetcher holds for an abandoned scan.
    fn stop(&self) {}
}

/// Pull side of the membership service.
///
/// Topology changes are pushed to `ConflictManager::on_topology_update`; this
/// trait only supplies the view installed when the manager starts.
pub trait TopologyProvider: Send + Sync {
    fn current_topology(&self) -> Arc<TopologyView>;
}

/// Reports whether a rebalance is currently moving data.
pub trait StateTransferMonitor: Send + Sync {
    fn is_state_transfer_in_progress(&self) -> bool;
}

/// Cache write API used to apply merge outcomes.
pub trait CacheWriter<K, V>: Send + Sync {
    fn put_async(
        &self,
        key: K,
        value: VersionedValue<V>,
        flags: WriteFlags,
    ) -> BoxFuture<'static, Result<()>>;

    fn remove_async(&self, key: K, flags: WriteFlags) -> BoxFuture<'static, Result<()>>;
}

/// The collaborators the conflict manager runs against on one node.
pub struct ClusterServices<K, V> {
    /// Address of the node the manager runs on.
    pub local_node: NodeId,
    pub membership: Arc<dyn TopologyProvider>,
    pub remote: Arc<dyn RemoteValueFetcher<K, V>>,
    pub local: Arc<dyn LocalValueReader<K, V>>,
    pub replicas: Arc<dyn ReplicaFetcher<K, V>>,
    pub state_transfer: Arc<dyn StateTransferMonitor>,
    pub writer: Arc<dyn CacheWriter<K, V>>,
}

impl<K, V> Clone for ClusterServices<K, V> {
    fn clone(&self) -> Self {
        Self {
            local_node: self.local_node,
            membership: Arc::clone(&self.membership),
            remote: Arc::clone(&self.remote),
            local: Arc::clone(&self.local),
            replicas: Arc::clone(&self.replicas),
            state_transfer: Arc::clone(&self.state_transfer),
            writer: Arc::clone(&self.writer),
        }
    }
}
