use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use parking_lot::RwLock;

use serde::{Deserialize, Serialize};

/// Identifier of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Phase of the installed topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Ordinary operation, possibly with a rebalance running.
    Normal,
    /// Partitions have merged and divergent replicas are being reconciled.
    ConflictResolution,
}

/// One consistent-hash layout: its member list plus the ordered owner list of
/// every segment. The first owner of a segment is its primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashLayout {
    members: Vec<NodeId>,
    segment_owners: Vec<Vec<NodeId>>,
}

impl HashLayout {
    pub fn new(members: Vec<NodeId>, segment_owners: Vec<Vec<NodeId>>) -> Self {
        Self {
            members,
            segment_owners,
        }
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn num_segments(&self) -> usize {
        self.segment_owners.len()
    }

    pub fn segment_owners(&self, segment: usize) -> &[NodeId] {
        self.segment_owners
            .get(segment)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

// Fixed seeds so every node maps a key to the same segment.
const SEGMENT_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

/// Immutable snapshot of cluster membership and key ownership.
///
/// A `TopologyView` is never mutated once built. Membership and rebalance
/// events produce a new view that replaces the installed one wholesale.
///
/// While a rebalance is running the view carries a `pending` layout next to
/// the `current` one; write owners are then the union of both.
#[derive(Debug, Clone)]
pub struct TopologyView {
    topology_id: u64,
    phase: Phase,
    members: Vec<NodeId>,
    current: HashLayout,
    pending: Option<HashLayout>,
}

impl TopologyView {
    /// Creates a view without a pending layout.
    pub fn new(topology_id: u64, phase: Phase, members: Vec<NodeId>, current: HashLayout) -> Self {
        Self {
            topology_id,
            phase,
            members,
            current,
            pending: None,
        }
    }

    /// Attaches the layout being rebalanced towards.
    pub fn with_pending(mut self, pending: HashLayout) -> Self {
        self.pending = Some(pending);
        self
    }

    /// Builds a view where every one of `num_segments` segments is owned by
    /// `owners`, in order. Mostly useful for small clusters and tests.
    pub fn uniform(topology_id: u64, phase: Phase, owners: Vec<NodeId>, num_segments: usize) -> Self {
        let layout = HashLayout::new(owners.clone(), vec![owners.clone(); num_segments]);
        Self::new(topology_id, phase, owners, layout)
    }

    pub fn topology_id(&self) -> u64 {
        self.topology_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every node that is part of this topology, whatever partition it came from.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// The layout ownership is currently served from.
    pub fn current_layout(&self) -> &HashLayout {
        &self.current
    }

    pub fn pending_layout(&self) -> Option<&HashLayout> {
        self.pending.as_ref()
    }

    /// Number of segments keys are hashed into.
    ///
    /// The current layout defines the segment space. A pending layout is read
    /// for the same segment indices only.
    pub fn num_segments(&self) -> usize {
        self.current.num_segments()
    }

    /// Maps a key to a segment in `0..num_segments()`.
    pub fn segment_of<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let segments = self.num_segments().max(1);
        let state = ahash::RandomState::with_seeds(
            SEGMENT_SEEDS.0,
            SEGMENT_SEEDS.1,
            SEGMENT_SEEDS.2,
            SEGMENT_SEEDS.3,
        );
        (state.hash_one(key) % segments as u64) as usize
    }

    /// Write owners of a segment: current owners followed by any pending owner
    /// not already present.
    pub fn segment_write_owners(&self, segment: usize) -> Vec<NodeId> {
        let mut owners = self.current.segment_owners(segment).to_vec();
        if let Some(pending) = &self.pending {
            for node in pending.segment_owners(segment) {
                if !owners.contains(node) {
                    owners.push(*node);
                }
            }
        }
        owners
    }

    /// Write owners of a key, in ownership order.
    pub fn write_owners<K: Hash + ?Sized>(&self, key: &K) -> Vec<NodeId> {
        self.segment_write_owners(self.segment_of(key))
    }

    /// Primary owner of a key in the current layout.
    pub fn primary_owner<K: Hash + ?Sized>(&self, key: &K) -> Option<NodeId> {
        self.current
            .segment_owners(self.segment_of(key))
            .first()
            .copied()
    }

    /// Whether `node` is one of the write owners of `key`.
    pub fn is_write_owner<K: Hash + ?Sized>(&self, key: &K, node: NodeId) -> bool {
        self.write_owners(key).contains(&node)
    }
}

/// The "current topology" pointer shared by every component of a manager.
///
/// Readers take an `Arc` snapshot once per logical operation and never hold
/// the lock across a suspension point.
#[derive(Debug)]
pub struct InstalledTopology {
    current: RwLock<Arc<TopologyView>>,
}

impl InstalledTopology {
    pub fn new(initial: Arc<TopologyView>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Returns the installed view.
    pub fn load(&self) -> Arc<TopologyView> {
        Arc::clone(&self.current.read())
    }

    /// Replaces the installed view wholesale.
    pub fn install(&self, topology: Arc<TopologyView>) {
        *self.current.write() = topology;
    }
}
