use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use log::{error, trace};
use tokio::runtime::Handle;

use crate::cluster::{CacheWriter, WriteFlags};
use crate::conflict::detection::ConflictStream;
use crate::conflict::join_counter::JoinCounter;
use crate::conflict::merge_policy::EntryMergePolicy;
use crate::data_store::versioned_value::{CacheEntry, CacheKey, CacheValue, ConflictRecord};
use crate::errors::{Result, RiftmendError};
use crate::topology::{NodeId, TopologyView};

/// Input and outcome of merging one conflicting key.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeDecision<K, V> {
    pub key: K,
    /// Entry of the authoritative replica, `None` if it holds no entry.
    pub preferred: Option<CacheEntry<K, V>>,
    /// Every other present entry, ordered by owner.
    pub others: Vec<CacheEntry<K, V>>,
    /// Entry to write, `None` to delete the key.
    pub outcome: Option<CacheEntry<K, V>>,
}

/// What applying a merge outcome did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Updated,
    Removed,
}

/// Counters of one `resolve_conflicts` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionSummary {
    /// Conflicting keys yielded by the scan.
    pub conflicts: usize,
    /// Keys whose merged entry was written.
    pub updated: usize,
    /// Keys deleted because the policy returned no entry.
    pub removed: usize,
    /// Keys whose resolution failed. Failures are logged, not propagated.
    pub failed: usize,
}

#[derive(Default)]
struct SummaryCounters {
    conflicts: AtomicUsize,
    updated: AtomicUsize,
    removed: AtomicUsize,
    failed: AtomicUsize,
}

impl SummaryCounters {
    fn snapshot(&self) -> ResolutionSummary {
        ResolutionSummary {
            conflicts: self.conflicts.load(Ordering::Acquire),
            updated: self.updated.load(Ordering::Acquire),
            removed: self.removed.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
        }
    }
}

/// Splits a conflict record into the preferred entry and the other present
/// entries.
///
/// The preferred partition is the member list of the topology's current
/// layout. When exactly one owner in the record belongs to it, that owner's
/// entry is preferred; otherwise the primary owner of the key is. The
/// preferred entry is `None` when the chosen owner holds no entry or is not
/// part of the record.
///
/// # Errors
///
/// `RiftmendError::InconsistentRecord` if no owner in the record holds an
/// entry, since the key cannot be identified.
pub fn select_preferred<K: CacheKey, V: CacheValue>(
    mut record: ConflictRecord<K, V>,
    topology: &TopologyView,
) -> Result<(K, Option<CacheEntry<K, V>>, Vec<CacheEntry<K, V>>)> {
    let key = record
        .values()
        .flatten()
        .map(|entry| entry.key().clone())
        .next()
        .ok_or(RiftmendError::InconsistentRecord)?;

    let preferred_partition = topology.current_layout().members();
    let in_preferred: Vec<NodeId> = record
        .keys()
        .copied()
        .filter(|node| preferred_partition.contains(node))
        .collect();

    // Zero or several preferred owners both fall back to the primary.
    let chosen = if in_preferred.len() == 1 {
        Some(in_preferred[0])
    } else {
        topology.primary_owner(&key)
    };
    let preferred = chosen.and_then(|node| record.remove(&node)).flatten();

    let mut others: Vec<(NodeId, CacheEntry<K, V>)> = record
        .into_iter()
        .filter_map(|(node, entry)| entry.map(|entry| (node, entry)))
        .collect();
    others.sort_by_key(|(node, _)| *node);

    Ok((key, preferred, others.into_iter().map(|(_, entry)| entry).collect()))
}

/// Runs the merge policy over one conflict record.
pub fn decide<K: CacheKey, V: CacheValue>(
    record: ConflictRecord<K, V>,
    topology: &TopologyView,
    policy: &dyn EntryMergePolicy<K, V>,
) -> Result<MergeDecision<K, V>> {
    let (key, preferred, others) = select_preferred(record, topology)?;
    let outcome = policy.merge(preferred.clone(), others.clone());
    Ok(MergeDecision {
        key,
        preferred,
        others,
        outcome,
    })
}

/// Writes or deletes the key according to the decision.
pub async fn apply<K: CacheKey, V: CacheValue>(
    decision: MergeDecision<K, V>,
    writer: &dyn CacheWriter<K, V>,
    flags: WriteFlags,
) -> Result<Applied> {
    match decision.outcome {
        None => {
            trace!("Executing remove on conflict: key {:?}", decision.key);
            writer.remove_async(decision.key, flags).await?;
            Ok(Applied::Removed)
        }
        Some(entry) => {
            trace!(
                "Executing update on conflict: key {:?} with value {:?}",
                decision.key,
                entry.value()
            );
            let (_, value) = entry.into_parts();
            writer.put_async(decision.key, value, flags).await?;
            Ok(Applied::Updated)
        }
    }
}

/// Dispatches resolution work for every conflict of one scan.
pub struct ResolutionPipeline<K, V> {
    pub cache_name: String,
    pub topology: Arc<TopologyView>,
    pub policy: Arc<dyn EntryMergePolicy<K, V>>,
    pub writer: Arc<dyn CacheWriter<K, V>>,
    pub flags: WriteFlags,
    pub executor: Handle,
}

/// Arrives on the join counter however the resolution task ends.
struct Arrival(Arc<JoinCounter>);

impl Drop for Arrival {
    fn drop(&mut self) {
        self.0.arrive();
    }
}

impl<K: CacheKey, V: CacheValue> ResolutionPipeline<K, V> {
    /// Consumes `conflicts`, resolving every record on the executor.
    ///
    /// Does not return before every dispatched write completed. Per-key
    /// failures are logged and counted in the summary.
    ///
    /// # Errors
    ///
    /// The first error yielded by the scan, after outstanding writes finished.
    pub async fn run(self, mut conflicts: ConflictStream<K, V>) -> Result<ResolutionSummary> {
        let counter = Arc::new(JoinCounter::new());
        let summary = Arc::new(SummaryCounters::default());
        let mut scan_error = None;

        while let Some(next) = conflicts.next().await {
            let record = match next {
                Ok(record) => record,
                Err(e) => {
                    scan_error = Some(e);
                    break;
                }
            };
            summary.conflicts.fetch_add(1, Ordering::AcqRel);

            counter.register();
            let arrival = Arrival(Arc::clone(&counter));
            let cache_name = self.cache_name.clone();
            let topology = Arc::clone(&self.topology);
            let policy = Arc::clone(&self.policy);
            let writer = Arc::clone(&self.writer);
            let summary = Arc::clone(&summary);
            let flags = self.flags;

            self.executor.spawn(async move {
                let _arrival = arrival;
                trace!("Cache {} Conflict detected {:?}", cache_name, record);

                let applied = match decide(record, &topology, policy.as_ref()) {
                    Ok(decision) => {
                        let key = decision.key.clone();
                        apply(decision, writer.as_ref(), flags)
                            .await
                            .map_err(|e| RiftmendError::WriteFailure {
                                key: format!("{:?}", key),
                                reason: e.to_string(),
                            })
                    }
                    Err(e) => Err(e),
                };

                match applied {
                    Ok(Applied::Updated) => {
                        summary.updated.fetch_add(1, Ordering::AcqRel);
                    }
                    Ok(Applied::Removed) => {
                        summary.removed.fetch_add(1, Ordering::AcqRel);
                    }
                    Err(e) => {
                        error!("Cache {} Exception during conflict resolution: {}", cache_name, e);
                        summary.failed.fetch_add(1, Ordering::AcqRel);
                    }
                }
            });
        }

        counter.arrive_and_wait().await;
        trace!(
            "Cache {} Finished resolving conflicts for topologyId={}",
            self.cache_name,
            self.topology.topology_id()
        );

        match scan_error {
            Some(e) => Err(e),
            None => Ok(summary.snapshot()),
        }
    }
}
