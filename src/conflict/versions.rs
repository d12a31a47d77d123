use std::fmt;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use log::{debug, trace};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::cluster::{ClusterServices, FetchFlags, Response};
use crate::data_store::versioned_value::{CacheKey, CacheValue, VersionMap};
use crate::errors::{Result, RiftmendError};
use crate::topology::{InstalledTopology, NodeId, TopologyView};

/// Lifecycle stage of a `VersionRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting in the retry queue for the next drain.
    PendingRetry,
    /// A remote fetch is outstanding against the snapshotted owners.
    InFlight,
    /// The outcome has been delivered.
    Done,
    /// The request was torn down by `stop`.
    Cancelled,
}

impl RequestState {
    fn is_terminal(self) -> bool {
        matches!(self, RequestState::Done | RequestState::Cancelled)
    }
}

struct RequestInner<V> {
    state: RequestState,
    // Bumped on every start and cancellation so stale responses are dropped.
    attempt: u64,
    target_owners: Vec<NodeId>,
    task: Option<AbortHandle>,
    completion: Option<oneshot::Sender<Result<VersionMap<V>>>>,
}

impl<V> RequestInner<V> {
    fn finish(&mut self, state: RequestState, outcome: Result<VersionMap<V>>) {
        self.state = state;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(completion) = self.completion.take() {
            // Every waiter may already be gone.
            let _ = completion.send(outcome);
        }
    }
}

type SharedOutcome<V> = Shared<BoxFuture<'static, Result<VersionMap<V>>>>;

/// Collection of every owner's value for one key.
///
/// A request only changes its target owners by being cancelled and started
/// again; all callers asking for the same key while it is live share its
/// outcome.
pub struct VersionRequest<K, V> {
    key: K,
    postponed: bool,
    inner: Mutex<RequestInner<V>>,
    outcome: SharedOutcome<V>,
}

impl<K: CacheKey, V: CacheValue> VersionRequest<K, V> {
    fn new(key: K, postponed: bool) -> Self {
        let (completion, receiver) = oneshot::channel();
        let outcome = receiver
            .map(|delivered| delivered.unwrap_or(Err(RiftmendError::Cancelled)))
            .boxed()
            .shared();
        Self {
            key,
            postponed,
            inner: Mutex::new(RequestInner {
                state: RequestState::PendingRetry,
                attempt: 0,
                target_owners: Vec::new(),
                task: None,
                completion: Some(completion),
            }),
            outcome,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn state(&self) -> RequestState {
        self.inner.lock().state
    }

    /// Owners snapshotted when the current attempt started.
    pub fn target_owners(&self) -> Vec<NodeId> {
        self.inner.lock().target_owners.clone()
    }
}

impl<K: fmt::Debug, V> fmt::Debug for VersionRequest<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionRequest")
            .field("key", &self.key)
            .field("postponed", &self.postponed)
            .finish()
    }
}

enum Next<V> {
    Complete(Result<VersionMap<V>>),
    Restart,
}

struct CollectorInner<K, V> {
    cache_name: String,
    topology: Arc<InstalledTopology>,
    services: ClusterServices<K, V>,
    runtime: Handle,
    registry: Mutex<HashMap<K, Arc<VersionRequest<K, V>>>>,
    retry_tx: Sender<Arc<VersionRequest<K, V>>>,
    retry_rx: Receiver<Arc<VersionRequest<K, V>>>,
}

/// Per-key multi-owner version collector.
pub struct VersionCollector<K, V> {
    inner: Arc<CollectorInner<K, V>>,
}

impl<K, V> Clone for VersionCollector<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V: CacheValue> VersionCollector<K, V> {
    pub fn new(
        cache_name: impl Into<String>,
        topology: Arc<InstalledTopology>,
        services: ClusterServices<K, V>,
        runtime: Handle,
    ) -> Self {
        let (retry_tx, retry_rx) = unbounded();
        Self {
            inner: Arc::new(CollectorInner {
                cache_name: cache_name.into(),
                topology,
                services,
                runtime,
                registry: Mutex::new(HashMap::new()),
                retry_tx,
                retry_rx,
            }),
        }
    }

    /// Collects the value every write owner of `key` holds.
    ///
    /// Joins the live request for `key` if there is one. The request stays
    /// registered until it completes, even if every caller stops waiting. A
    /// request created while state transfer is running is parked in the retry
    /// queue and only starts on the next `restart_requests`.
    ///
    /// # Errors
    ///
    /// * `RiftmendError::Protocol` if an owner gave an unexpected answer.
    /// * `RiftmendError::Remote` if the remote call could not be executed.
    /// * `RiftmendError::Cancelled` if the collector was shut down.
    pub async fn get_all_versions(&self, key: K) -> Result<VersionMap<V>> {
        let (request, created) = {
            let mut registry = self.inner.registry.lock();
            match registry.get(&key) {
                Some(request) => (Arc::clone(request), false),
                None => {
                    let postpone = self.inner.services.state_transfer.is_state_transfer_in_progress();
                    let request = Arc::new(VersionRequest::new(key.clone(), postpone));
                    registry.insert(key.clone(), Arc::clone(&request));
                    (request, true)
                }
            }
        };

        if created {
            trace!("Cache {} Creating {:?}", self.inner.cache_name, request);
            if request.postponed {
                self.inner.enqueue_retry(&request);
            } else {
                self.inner.start(&request);
            }
        }

        request.outcome.clone().await
    }

    /// Cancels every in-flight request whose owners differ from the write
    /// owners of `topology`, queueing it for retry.
    pub fn cancel_outdated(&self, topology: &TopologyView) {
        let requests: Vec<_> = self.inner.registry.lock().values().cloned().collect();
        for request in requests {
            self.inner.cancel_if_outdated(&request, topology);
        }
    }

    /// Drains the retry queue, starting every queued request against the
    /// installed topology.
    pub fn restart_requests(&self) {
        for request in self.inner.retry_rx.try_iter() {
            trace!("Retrying {:?}", request);
            self.inner.start(&request);
        }
    }

    /// Fails every live request with `RiftmendError::Cancelled` and empties the
    /// registry and the retry queue.
    pub fn cancel_all(&self) {
        let requests: Vec<_> = {
            let mut registry = self.inner.registry.lock();
            registry.drain().map(|(_, request)| request).collect()
        };
        for request in requests {
            let mut inner = request.inner.lock();
            if !inner.state.is_terminal() {
                trace!("Cancelling {:?} on stop", request);
                inner.attempt += 1;
                inner.finish(RequestState::Cancelled, Err(RiftmendError::Cancelled));
            }
        }
        for _ in self.inner.retry_rx.try_iter() {}
    }

    /// Number of requests currently registered.
    pub fn live_requests(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Number of requests waiting for the next retry drain.
    pub fn queued_retries(&self) -> usize {
        self.inner.retry_rx.len()
    }

    /// The live request for `key`, if any.
    pub fn request(&self, key: &K) -> Option<Arc<VersionRequest<K, V>>> {
        self.inner.registry.lock().get(key).cloned()
    }
}

impl<K: CacheKey, V: CacheValue> CollectorInner<K, V> {
    // Lock order: request state, then registry.
    fn unregister(&self, request: &Arc<VersionRequest<K, V>>) {
        let mut registry = self.registry.lock();
        if registry
            .get(&request.key)
            .is_some_and(|current| Arc::ptr_eq(current, request))
        {
            registry.remove(&request.key);
        }
    }

    fn enqueue_retry(&self, request: &Arc<VersionRequest<K, V>>) {
        // The receiver lives as long as the collector.
        let _ = self.retry_tx.send(Arc::clone(request));
    }

    fn start(self: &Arc<Self>, request: &Arc<VersionRequest<K, V>>) {
        let topology = self.topology.load();
        let owners = topology.write_owners(&request.key);
        let local_node = self.services.local_node;

        trace!("Attempting {:?} from owners {:?}", request, owners);

        let partial: Arc<Mutex<VersionMap<V>>> = Arc::new(Mutex::new(HashMap::new()));
        if owners.contains(&local_node) {
            let local = self.services.local.read_local(&request.key, FetchFlags::LOCAL);
            partial.lock().insert(local_node, local);
        }

        let remote_owners: Vec<NodeId> = owners.iter().copied().filter(|node| *node != local_node).collect();

        let mut inner = request.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.attempt += 1;
        inner.state = RequestState::InFlight;
        inner.target_owners = owners;
        let attempt = inner.attempt;

        let rpc = if remote_owners.is_empty() {
            future::ready(Ok(HashMap::new())).boxed()
        } else {
            self.services.remote.fetch_value(
                &request.key,
                &remote_owners,
                topology.topology_id(),
                FetchFlags::REMOTE,
            )
        };
        let collector = Arc::clone(self);
        let request_ref = Arc::clone(request);
        let task = self.runtime.spawn(async move {
            let responses = rpc.await;
            collector.on_responses(&request_ref, attempt, partial, responses);
        });
        inner.task = Some(task.abort_handle());
    }

    fn on_responses(
        self: &Arc<Self>,
        request: &Arc<VersionRequest<K, V>>,
        attempt: u64,
        partial: Arc<Mutex<VersionMap<V>>>,
        responses: Result<HashMap<NodeId, Response<V>>>,
    ) {
        let next = {
            let mut inner = request.inner.lock();
            if inner.attempt != attempt || inner.state != RequestState::InFlight {
                trace!("{:?} dropping responses of superseded attempt {}", request, attempt);
                return;
            }
            inner.task = None;

            let next = self.aggregate(request, &partial, responses);
            match &next {
                Next::Complete(outcome) => {
                    self.unregister(request);
                    inner.finish(RequestState::Done, outcome.clone());
                }
                Next::Restart => inner.state = RequestState::PendingRetry,
            }
            next
        };

        if let Next::Restart = next {
            debug!("Received unsure response, restarting request {:?}", request);
            self.start(request);
        }
    }

    fn aggregate(
        &self,
        request: &VersionRequest<K, V>,
        partial: &Mutex<VersionMap<V>>,
        responses: Result<HashMap<NodeId, Response<V>>>,
    ) -> Next<V> {
        let responses = match responses {
            Ok(responses) => responses,
            Err(e) => {
                return Next::Complete(Err(RiftmendError::Remote(format!(
                    "{} encountered when attempting {:?} on cache {}",
                    e, request, self.cache_name
                ))));
            }
        };

        for (node, response) in responses {
            trace!("{:?} received response {:?} from {}", request, response, node);
            match response {
                Response::Success(value) => {
                    partial.lock().insert(node, value);
                }
                Response::Unsure => return Next::Restart,
                Response::NotFound => {
                    trace!("Ignoring not-found response from {}", node);
                }
                Response::Other(other) => {
                    return Next::Complete(Err(RiftmendError::Protocol {
                        key: format!("{:?}", request.key),
                        node,
                        response: other,
                    }));
                }
            }
        }

        Next::Complete(Ok(partial.lock().clone()))
    }

    fn cancel_if_outdated(&self, request: &Arc<VersionRequest<K, V>>, topology: &TopologyView) {
        let latest = topology.write_owners(&request.key);
        let mut inner = request.inner.lock();
        if inner.state != RequestState::InFlight || same_owners(&inner.target_owners, &latest) {
            return;
        }

        trace!(
            "Cancelling {:?} for nodes {:?}. New write owners {:?}",
            request, inner.target_owners, latest
        );
        inner.attempt += 1;
        inner.state = RequestState::PendingRetry;
        inner.target_owners.clear();
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        drop(inner);
        self.enqueue_retry(request);
    }
}

fn same_owners(a: &[NodeId], b: &[NodeId]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

