//! Common utilities for Riftmend integration tests.
//!
//! `MockCluster` keeps one in-memory store per node and implements every
//! collaborator the conflict manager needs on top of it.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use riftmend::prelude::*;
use tokio::sync::watch;

pub const A: NodeId = NodeId(1);
pub const B: NodeId = NodeId(2);
pub const C: NodeId = NodeId(3);
pub const D: NodeId = NodeId(4);

/// Helper function to create a value with the given version.
pub fn value(data: &str, version: u64) -> VersionedValue<String> {
    VersionedValue::new(data.to_string(), Metadata::new(version, version * 10))
}

/// A topology with a single segment owned by `owners`.
pub fn single_segment(topology_id: u64, phase: Phase, owners: &[NodeId]) -> Arc<TopologyView> {
    Arc::new(TopologyView::uniform(topology_id, phase, owners.to_vec(), 1))
}

/// The partition-heal topology: `preferred` own every segment in the current
/// layout, `preferred` plus `rejoined` in the pending one.
pub fn merged_topology(
    topology_id: u64,
    preferred: &[NodeId],
    rejoined: &[NodeId],
    num_segments: usize,
) -> Arc<TopologyView> {
    let all: Vec<NodeId> = preferred.iter().chain(rejoined).copied().collect();
    let current = HashLayout::new(preferred.to_vec(), vec![preferred.to_vec(); num_segments]);
    let pending = HashLayout::new(all.clone(), vec![all.clone(); num_segments]);
    Arc::new(
        TopologyView::new(topology_id, Phase::ConflictResolution, all, current).with_pending(pending),
    )
}

/// A single write observed by `MockCluster`.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put(String, VersionedValue<String>, WriteFlags),
    Remove(String, WriteFlags),
}

/// A remote fetch observed by `MockCluster`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub key: String,
    pub owners: Vec<NodeId>,
    pub topology_id: u64,
    pub flags: FetchFlags,
}

/// In-memory cluster implementing every collaborator of the conflict manager.
pub struct MockCluster {
    pub local: NodeId,
    this: Weak<MockCluster>,
    stores: Mutex<HashMap<NodeId, HashMap<String, VersionedValue<String>>>>,
    departed: Mutex<HashSet<NodeId>>,
    topology: RwLock<Arc<TopologyView>>,
    state_transfer: AtomicBool,

    // Remote fetch behaviour.
    scripted: Mutex<HashMap<NodeId, VecDeque<Response<String>>>>,
    remote_failure: Mutex<Option<String>>,
    fetch_calls: Mutex<Vec<FetchCall>>,
    fetch_gate: watch::Sender<bool>,

    // Replica fetch behaviour.
    segment_calls: Mutex<Vec<usize>>,
    segment_gate: watch::Sender<bool>,
    segment_delay: Mutex<Option<Duration>>,
    injected_records: Mutex<HashMap<usize, Vec<ConflictRecord<String, String>>>>,
    replica_stops: AtomicUsize,

    // Writer behaviour.
    writes: Mutex<Vec<WriteOp>>,
    failing_keys: Mutex<HashSet<String>>,
    write_delay: Mutex<Option<Duration>>,
}

impl MockCluster {
    /// Creates a cluster whose local node is `local`, with every gate open.
    pub fn new(local: NodeId, topology: Arc<TopologyView>) -> Arc<Self> {
        let (fetch_gate, _) = watch::channel(true);
        let (segment_gate, _) = watch::channel(true);
        Arc::new_cyclic(|this| Self {
            local,
            this: this.clone(),
            stores: Mutex::new(HashMap::new()),
            departed: Mutex::new(HashSet::new()),
            topology: RwLock::new(topology),
            state_transfer: AtomicBool::new(false),
            scripted: Mutex::new(HashMap::new()),
            remote_failure: Mutex::new(None),
            fetch_calls: Mutex::new(Vec::new()),
            fetch_gate,
            segment_calls: Mutex::new(Vec::new()),
            segment_gate,
            segment_delay: Mutex::new(None),
            injected_records: Mutex::new(HashMap::new()),
            replica_stops: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            failing_keys: Mutex::new(HashSet::new()),
            write_delay: Mutex::new(None),
        })
    }

    /// Wires the cluster into a `ClusterServices` bundle.
    pub fn services(self: &Arc<Self>) -> ClusterServices<String, String> {
        ClusterServices {
            local_node: self.local,
            membership: self.clone(),
            remote: self.clone(),
            local: self.clone(),
            replicas: self.clone(),
            state_transfer: self.clone(),
            writer: self.clone(),
        }
    }

    /// Stores `value` for `key` on `node`.
    pub fn put(&self, node: NodeId, key: &str, value: VersionedValue<String>) {
        self.stores
            .lock()
            .entry(node)
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn get(&self, node: NodeId, key: &str) -> Option<VersionedValue<String>> {
        self.stores.lock().get(&node).and_then(|store| store.get(key).cloned())
    }

    /// Makes `node` answer `NotFound` from now on.
    pub fn depart(&self, node: NodeId) {
        self.departed.lock().insert(node);
    }

    pub fn set_topology(&self, topology: Arc<TopologyView>) {
        *self.topology.write() = topology;
    }

    pub fn set_state_transfer(&self, in_progress: bool) {
        self.state_transfer.store(in_progress, Ordering::SeqCst);
    }

    /// Queues a response `node` gives to its next fetch instead of its value.
    pub fn script(&self, node: NodeId, response: Response<String>) {
        self.scripted.lock().entry(node).or_default().push_back(response);
    }

    pub fn fail_remote(&self, reason: &str) {
        *self.remote_failure.lock() = Some(reason.to_string());
    }

    /// Holds every remote fetch until `open_fetches` is called.
    pub fn hold_fetches(&self) {
        self.fetch_gate.send_replace(false);
    }

    pub fn open_fetches(&self) {
        self.fetch_gate.send_replace(true);
    }

    pub fn fetch_calls(&self) -> Vec<FetchCall> {
        self.fetch_calls.lock().clone()
    }

    /// Holds every segment fetch until `open_segments` is called.
    pub fn hold_segments(&self) {
        self.segment_gate.send_replace(false);
    }

    pub fn open_segments(&self) {
        self.segment_gate.send_replace(true);
    }

    pub fn delay_segments(&self, delay: Duration) {
        *self.segment_delay.lock() = Some(delay);
    }

    pub fn segment_calls(&self) -> Vec<usize> {
        self.segment_calls.lock().clone()
    }

    /// Adds a raw record to the replicas returned for `segment`.
    pub fn inject_record(&self, segment: usize, record: ConflictRecord<String, String>) {
        self.injected_records.lock().entry(segment).or_default().push(record);
    }

    pub fn replica_stops(&self) -> usize {
        self.replica_stops.load(Ordering::SeqCst)
    }

    pub fn fail_writes_for(&self, key: &str) {
        self.failing_keys.lock().insert(key.to_string());
    }

    pub fn delay_writes(&self, delay: Duration) {
        *self.write_delay.lock() = Some(delay);
    }

    pub fn writes(&self) -> Vec<WriteOp> {
        self.writes.lock().clone()
    }

    fn answer(&self, node: NodeId, key: &str) -> Response<String> {
        if let Some(response) = self.scripted.lock().get_mut(&node).and_then(VecDeque::pop_front) {
            return response;
        }
        if self.departed.lock().contains(&node) {
            return Response::NotFound;
        }
        Response::Success(self.get(node, key))
    }

    fn replicas_of_segment(&self, segment: usize, topology: &TopologyView) -> Vec<ConflictRecord<String, String>> {
        let owners = topology.segment_write_owners(segment);
        let stores = self.stores.lock();

        let mut keys: Vec<String> = owners
            .iter()
            .filter_map(|node| stores.get(node))
            .flat_map(|store| store.keys().cloned())
            .filter(|key| topology.segment_of(key) == segment)
            .collect();
        keys.sort();
        keys.dedup();

        keys.into_iter()
            .map(|key| {
                owners
                    .iter()
                    .map(|node| {
                        let entry = stores
                            .get(node)
                            .and_then(|store| store.get(&key))
                            .map(|value| CacheEntry::new(key.clone(), value.clone()));
                        (*node, entry)
                    })
                    .collect()
            })
            .collect()
    }

    /// Applies a write to every write owner of `key`.
    fn apply_write(&self, key: &str, value: Option<VersionedValue<String>>) {
        let owners = self.topology.read().write_owners(key);
        let mut stores = self.stores.lock();
        for node in owners {
            let store = stores.entry(node).or_default();
            match &value {
                Some(value) => {
                    store.insert(key.to_string(), value.clone());
                }
                None => {
                    store.remove(key);
                }
            }
        }
    }

    fn handle(&self) -> Arc<Self> {
        self.this.upgrade().expect("cluster is alive while in use")
    }

    fn write(&self, op: WriteOp) -> BoxFuture<'static, riftmend::Result<()>> {
        let cluster = self.handle();
        async move {
            let delay = *cluster.write_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let key = match &op {
                WriteOp::Put(key, _, _) | WriteOp::Remove(key, _) => key.clone(),
            };
            cluster.writes.lock().push(op.clone());
            if cluster.failing_keys.lock().contains(&key) {
                return Err(RiftmendError::Remote(format!("write rejected for {}", key)));
            }
            match op {
                WriteOp::Put(key, value, _) => cluster.apply_write(&key, Some(value)),
                WriteOp::Remove(key, _) => cluster.apply_write(&key, None),
            }
            Ok(())
        }
        .boxed()
    }
}

async fn wait_open(mut gate: watch::Receiver<bool>) {
    while !*gate.borrow_and_update() {
        if gate.changed().await.is_err() {
            return;
        }
    }
}

impl TopologyProvider for MockCluster {
    fn current_topology(&self) -> Arc<TopologyView> {
        Arc::clone(&self.topology.read())
    }
}

impl StateTransferMonitor for MockCluster {
    fn is_state_transfer_in_progress(&self) -> bool {
        self.state_transfer.load(Ordering::SeqCst)
    }
}

impl LocalValueReader<String, String> for MockCluster {
    fn read_local(&self, key: &String, _flags: FetchFlags) -> Option<VersionedValue<String>> {
        self.get(self.local, key)
    }
}

impl RemoteValueFetcher<String, String> for MockCluster {
    fn fetch_value(
        &self,
        key: &String,
        owners: &[NodeId],
        topology_id: u64,
        flags: FetchFlags,
    ) -> BoxFuture<'static, riftmend::Result<HashMap<NodeId, Response<String>>>> {
        self.fetch_calls.lock().push(FetchCall {
            key: key.clone(),
            owners: owners.to_vec(),
            topology_id,
            flags,
        });
        let cluster = self.handle();
        let key = key.clone();
        let owners = owners.to_vec();
        let gate = self.fetch_gate.subscribe();
        async move {
            wait_open(gate).await;
            if let Some(reason) = cluster.remote_failure.lock().clone() {
                return Err(RiftmendError::Remote(reason));
            }
            Ok(owners
                .into_iter()
                .map(|node| (node, cluster.answer(node, &key)))
                .collect())
        }
        .boxed()
    }
}

impl ReplicaFetcher<String, String> for MockCluster {
    fn fetch_all_replicas(
        &self,
        segment: usize,
        topology: Arc<TopologyView>,
        _deadline: Instant,
    ) -> BoxFuture<'static, riftmend::Result<Vec<ConflictRecord<String, String>>>> {
        self.segment_calls.lock().push(segment);
        let cluster = self.handle();
        let gate = self.segment_gate.subscribe();
        async move {
            wait_open(gate).await;
            let delay = *cluster.segment_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut records = cluster.replicas_of_segment(segment, &topology);
            if let Some(injected) = cluster.injected_records.lock().get(&segment) {
                records.extend(injected.iter().cloned());
            }
            Ok(records)
        }
        .boxed()
    }

    fn stop(&self) {
        self.replica_stops.fetch_add(1, Ordering::SeqCst);
    }
}

impl CacheWriter<String, String> for MockCluster {
    fn put_async(
        &self,
        key: String,
        value: VersionedValue<String>,
        flags: WriteFlags,
    ) -> BoxFuture<'static, riftmend::Result<()>> {
        self.write(WriteOp::Put(key, value, flags))
    }

    fn remove_async(&self, key: String, flags: WriteFlags) -> BoxFuture<'static, riftmend::Result<()>> {
        self.write(WriteOp::Remove(key, flags))
    }
}

/// Helper function to create a started manager for `cluster`.
pub fn start_manager(
    cluster: &Arc<MockCluster>,
    config: ConflictManagerConfig,
) -> Arc<ConflictManager<String, String>> {
    let manager = ConflictManager::new(config, cluster.services(), tokio::runtime::Handle::current());
    manager.start().expect("manager should start");
    Arc::new(manager)
}

/// Helper function to wait for a condition with timeout.
pub async fn wait_for_condition<F>(condition: F, timeout_ms: u64) -> bool
where
    F: Fn() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    condition()
}
