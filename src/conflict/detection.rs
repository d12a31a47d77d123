use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::cluster::{ReplicaFetcher, StateTransferMonitor};
use crate::data_store::versioned_value::{CacheKey, CacheValue, ConflictRecord};
use crate::errors::{Result, RiftmendError};
use crate::topology::{Phase, TopologyView};

/// Returns `true` when the owners of a record disagree.
///
/// Absent entries count as a distinct value, so one owner missing a key that
/// another owner holds is a conflict. An empty record is also reported.
pub fn is_conflict<K: PartialEq, V: PartialEq>(record: &ConflictRecord<K, V>) -> bool {
    let mut values = record.values();
    match values.next() {
        None => true,
        Some(first) => values.any(|value| value != first),
    }
}

/// Clears the single-flight flag when the scan that set it ends.
///
/// Shared by the scan task and the consumer's `ConflictStream`. The flag is
/// only released once the task has finished and the consumer has read past
/// the last record, seen an error, or dropped the stream.
struct ScanGuard {
    in_progress: Arc<AtomicBool>,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.in_progress.store(false, Ordering::Release);
    }
}

/// Segment-by-segment conflict scanner.
///
/// At most one scan per scanner is active at a time. Each scan runs a
/// background task that walks segments `0..num_segments` in order, fetching
/// every replica of a segment and handing the conflicting records to the
/// consumer through a bounded channel.
pub struct ConflictScanner<K, V> {
    cache_name: String,
    replicas: Arc<dyn ReplicaFetcher<K, V>>,
    state_transfer: Arc<dyn StateTransferMonitor>,
    runtime: Handle,
    conflict_timeout: Duration,
    segment_buffer: usize,
    in_progress: Arc<AtomicBool>,
    active_stop: Mutex<Option<watch::Sender<bool>>>,
}

impl<K: CacheKey, V: CacheValue> ConflictScanner<K, V> {
    pub fn new(
        cache_name: impl Into<String>,
        replicas: Arc<dyn ReplicaFetcher<K, V>>,
        state_transfer: Arc<dyn StateTransferMonitor>,
        runtime: Handle,
        conflict_timeout: Duration,
        segment_buffer: usize,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            replicas,
            state_transfer,
            runtime,
            conflict_timeout,
            segment_buffer: segment_buffer.max(1),
            in_progress: Arc::new(AtomicBool::new(false)),
            active_stop: Mutex::new(None),
        }
    }

    /// Starts a scan of every segment of `topology`.
    ///
    /// The whole pass shares one deadline, `conflict_timeout` from now.
    ///
    /// # Errors
    ///
    /// * `RiftmendError::StateTransferInProgress` if a rebalance is moving
    ///   data and `topology` is not in the conflict-resolution phase.
    /// * `RiftmendError::AlreadyInProgress` if another scan is active.
    pub fn scan(&self, topology: Arc<TopologyView>) -> Result<ConflictStream<K, V>> {
        if topology.phase() != Phase::ConflictResolution
            && self.state_transfer.is_state_transfer_in_progress()
        {
            return Err(RiftmendError::StateTransferInProgress {
                cache: self.cache_name.clone(),
            });
        }

        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RiftmendError::AlreadyInProgress);
        }
        let guard = Arc::new(ScanGuard {
            in_progress: Arc::clone(&self.in_progress),
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.active_stop.lock() = Some(stop_tx);

        let (tx, rx) = mpsc::channel(self.segment_buffer);
        let task = SegmentWalk {
            _guard: Arc::clone(&guard),
            topology,
            replicas: Arc::clone(&self.replicas),
            deadline: deadline_after(self.conflict_timeout),
            tx,
            stop_rx,
        };
        self.runtime.spawn(task.run());

        Ok(ConflictStream {
            rx,
            buffer: Vec::new().into_iter(),
            guard: Some(guard),
        })
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Signals the most recent scan to abandon its in-flight fetch and end
    /// without error. A scan that already ended ignores the signal.
    pub fn stop(&self) {
        if let Some(stop) = self.active_stop.lock().take() {
            debug!("Cache {} stopping active conflict scan", self.cache_name);
            let _ = stop.send(true);
        }
    }
}

// Fields drop in order: the task's share of the guard goes before `tx`
// closes the stream.
struct SegmentWalk<K, V> {
    _guard: Arc<ScanGuard>,
    topology: Arc<TopologyView>,
    replicas: Arc<dyn ReplicaFetcher<K, V>>,
    deadline: Instant,
    tx: mpsc::Sender<Result<Vec<ConflictRecord<K, V>>>>,
    stop_rx: watch::Receiver<bool>,
}

enum Step<T> {
    Stopped,
    ConsumerGone,
    Done(T),
}

impl<K: CacheKey, V: CacheValue> SegmentWalk<K, V> {
    async fn run(mut self) {
        let total_segments = self.topology.num_segments();
        for segment in 0..total_segments {
            trace!(
                "Attempting to receive all replicas for segment {} with topology {}",
                segment,
                self.topology.topology_id()
            );
            let fetch = self.replicas.fetch_all_replicas(
                segment,
                Arc::clone(&self.topology),
                self.deadline.into_std(),
            );
            let fetched = tokio::time::timeout_at(self.deadline, fetch);

            let outcome = match self.guarded(fetched).await {
                Step::Done(outcome) => outcome,
                Step::Stopped => {
                    trace!("Scan stopped while fetching segment {}", segment);
                    self.replicas.stop();
                    return;
                }
                Step::ConsumerGone => return,
            };

            let records = match outcome {
                Ok(Ok(records)) => records,
                Ok(Err(e)) => {
                    trace!("Scan caught {} on segment {}", e, segment);
                    let _ = self.tx.send(Err(e)).await;
                    return;
                }
                Err(_elapsed) => {
                    warn!(
                        "Scan of topology {} timed out waiting for segment {}",
                        self.topology.topology_id(),
                        segment
                    );
                    self.replicas.stop();
                    let _ = self.tx.send(Err(RiftmendError::Timeout { segment })).await;
                    return;
                }
            };

            let conflicts: Vec<_> = records.into_iter().filter(is_conflict).collect();
            if conflicts.is_empty() {
                continue;
            }
            trace!("Segment {} yielded {} conflicts", segment, conflicts.len());

            let tx = self.tx.clone();
            match self.guarded(tx.send(Ok(conflicts))).await {
                Step::Done(Ok(())) => {}
                Step::Done(Err(_)) | Step::ConsumerGone | Step::Stopped => return,
            }
        }
        trace!("Scan exhausted all {} segments", total_segments);
    }

    /// Runs `work` until it completes, the scan is stopped or the consumer
    /// drops its end of the stream.
    async fn guarded<F: std::future::Future>(&mut self, work: F) -> Step<F::Output> {
        let tx = self.tx.clone();
        tokio::select! {
            biased;
            _ = stop_requested(&mut self.stop_rx) => Step::Stopped,
            _ = tx.closed() => Step::ConsumerGone,
            output = work => Step::Done(output),
        }
    }
}

// Deadlines past the far future saturate instead of overflowing `Instant`.
fn deadline_after(timeout: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            // The scanner was dropped without stopping this scan.
            futures::future::pending::<()>().await;
        }
    }
}

/// Lazy, single-pass sequence of conflicting records produced by one scan.
///
/// The scan counts as in progress until the stream is exhausted, has yielded
/// an error, or is dropped. Dropping the stream abandons the scan. Once the
/// stream yields an error it yields nothing further.
pub struct ConflictStream<K, V> {
    rx: mpsc::Receiver<Result<Vec<ConflictRecord<K, V>>>>,
    buffer: std::vec::IntoIter<ConflictRecord<K, V>>,
    guard: Option<Arc<ScanGuard>>,
}

impl<K, V> Stream for ConflictStream<K, V> {
    type Item = Result<ConflictRecord<K, V>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(record) = self.buffer.next() {
                return Poll::Ready(Some(Ok(record)));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(batch))) => self.buffer = batch.into_iter(),
                Poll::Ready(Some(Err(e))) => {
                    self.rx.close();
                    self.guard = None;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.guard = None;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<K, V> Unpin for ConflictStream<K, V> {}
