use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::RwLock;
use tokio::runtime::Handle;

use crate::cluster::{ClusterServices, WriteFlags};
use crate::config::ConflictManagerConfig;
use crate::conflict::detection::{ConflictScanner, ConflictStream};
use crate::conflict::merge_policy::{EntryMergePolicy, MergePolicyRegistry};
use crate::conflict::resolution::{ResolutionPipeline, ResolutionSummary};
use crate::conflict::versions::VersionCollector;
use crate::data_store::versioned_value::{CacheKey, CacheValue, VersionMap};
use crate::errors::{Result, RiftmendError};
use crate::topology::{InstalledTopology, TopologyView};

/// Riftmend Prelude
pub mod prelude {
    pub use crate::cluster::*;
    pub use crate::config::*;
    pub use crate::conflict::detection::*;
    pub use crate::conflict::join_counter::*;
    pub use crate::conflict::merge_policy::*;
    pub use crate::conflict::resolution::*;
    pub use crate::conflict::versions::*;
    pub use crate::data_store::versioned_value::*;
    pub use crate::errors::*;
    pub use crate::manager::*;
    pub use crate::topology::*;
}

/// Conflict manager of one cache on one node.
///
/// The manager owns the running flag, the installed topology, the version
/// collector with its retry queue, and the conflict scanner. It is the only
/// component reacting to topology notifications from the membership service.
///
/// A typical host wires the topology callbacks as:
///
/// ```no_run
/// # use riftmend::prelude::*;
/// # use std::sync::Arc;
/// # fn on_change(manager: &ConflictManager<String, String>, view: Arc<TopologyView>) {
/// manager.on_topology_update(view);
/// manager.cancel_version_requests();
/// manager.restart_version_requests();
/// # }
/// ```
pub struct ConflictManager<K, V> {
    config: ConflictManagerConfig,
    services: ClusterServices<K, V>,
    policies: MergePolicyRegistry<K, V>,
    runtime: Handle,
    resolution_executor: Handle,
    running: AtomicBool,
    topology: Arc<InstalledTopology>,
    merge_policy: RwLock<Option<Arc<dyn EntryMergePolicy<K, V>>>>,
    collector: VersionCollector<K, V>,
    scanner: ConflictScanner<K, V>,
}

impl<K: CacheKey, V: CacheValue> ConflictManager<K, V> {
    /// Creates a stopped manager.
    ///
    /// # Arguments
    ///
    /// * `config` - Cache name, scan timeout and merge policy selection.
    /// * `services` - The collaborators of the local node.
    /// * `runtime` - Runtime the remote fetches and scan tasks are spawned on.
    ///   Resolution writes use it too unless `with_resolution_executor` is set.
    pub fn new(config: ConflictManagerConfig, services: ClusterServices<K, V>, runtime: Handle) -> Self {
        let topology = Arc::new(InstalledTopology::new(services.membership.current_topology()));
        let collector = VersionCollector::new(
            config.cache_name.clone(),
            Arc::clone(&topology),
            services.clone(),
            runtime.clone(),
        );
        let scanner = ConflictScanner::new(
            config.cache_name.clone(),
            Arc::clone(&services.replicas),
            Arc::clone(&services.state_transfer),
            runtime.clone(),
            config.conflict_timeout(),
            config.segment_buffer,
        );
        Self {
            config,
            services,
            policies: MergePolicyRegistry::new(),
            resolution_executor: runtime.clone(),
            runtime,
            running: AtomicBool::new(false),
            topology,
            merge_policy: RwLock::new(None),
            collector,
            scanner,
        }
    }

    /// Registry consulted for `MergePolicyKind::Custom` on start.
    pub fn with_merge_policies(mut self, policies: MergePolicyRegistry<K, V>) -> Self {
        self.policies = policies;
        self
    }

    /// Dedicated runtime for the writes issued by conflict resolution.
    pub fn with_resolution_executor(mut self, executor: Handle) -> Self {
        self.resolution_executor = executor;
        self
    }

    /// Moves the manager to running.
    ///
    /// Installs the membership service's current topology and instantiates
    /// the configured merge policy. Starting a running manager is a no-op.
    ///
    /// # Errors
    ///
    /// `RiftmendError::MergeConfig` if the configured custom policy is not
    /// registered. The manager stays stopped.
    pub fn start(&self) -> Result<()> {
        let policy = self.policies.create(&self.config.merge_policy)?;
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        *self.merge_policy.write() = policy;
        self.topology.install(self.services.membership.current_topology());
        debug!(
            "Cache {} starting conflict manager with topology {}",
            self.config.cache_name,
            self.topology.load().topology_id()
        );
        Ok(())
    }

    /// Moves the manager to stopped.
    ///
    /// Every live version request fails with `RiftmendError::Cancelled` and an
    /// active scan is told to stop.
    pub fn stop(&self) {
        debug!("Cache {} stopping conflict manager", self.config.cache_name);
        self.running.store(false, Ordering::Release);
        self.collector.cancel_all();
        self.scanner.stop();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn check_is_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(RiftmendError::NotRunning {
                cache: self.config.cache_name.clone(),
            })
        }
    }

    /// Installs a new topology. Ignored while stopped.
    pub fn on_topology_update(&self, topology: Arc<TopologyView>) {
        if !self.is_running() {
            return;
        }
        trace!(
            "Cache {} installed new topology {}",
            self.config.cache_name,
            topology.topology_id()
        );
        self.topology.install(topology);
    }

    /// The topology every component currently reads.
    pub fn installed_topology(&self) -> Arc<TopologyView> {
        self.topology.load()
    }

    /// Cancels version requests whose owners no longer match the installed
    /// topology and queues them for retry. Ignored while stopped.
    pub fn cancel_version_requests(&self) {
        if !self.is_running() {
            return;
        }
        self.collector.cancel_outdated(&self.topology.load());
    }

    /// Restarts every queued version request against the installed topology.
    /// Ignored while stopped.
    pub fn restart_version_requests(&self) {
        if !self.is_running() {
            return;
        }
        self.collector.restart_requests();
    }

    /// Returns the value every write owner holds for `key`.
    ///
    /// # Errors
    ///
    /// * `RiftmendError::NotRunning` if the manager is stopped.
    /// * `RiftmendError::Protocol` or `RiftmendError::Remote` on collection failure.
    /// * `RiftmendError::Cancelled` if the manager stops while waiting.
    pub async fn get_all_versions(&self, key: K) -> Result<VersionMap<V>> {
        self.check_is_running()?;
        self.collector.get_all_versions(key).await
    }

    /// Blocking form of `get_all_versions` for callers outside the runtime.
    ///
    /// Must not be called from a runtime worker thread.
    ///
    /// # Errors
    ///
    /// Those of `get_all_versions`, plus `RiftmendError::Interrupted` if the
    /// runtime drops the collection before it completes.
    pub fn get_all_versions_blocking(&self, key: K) -> Result<VersionMap<V>> {
        self.check_is_running()?;
        let collector = self.collector.clone();
        let collection = self
            .runtime
            .spawn(async move { collector.get_all_versions(key).await });
        futures::executor::block_on(collection)
            .map_err(|e| RiftmendError::Interrupted(e.to_string()))?
    }

    /// Scans the installed topology for conflicting keys.
    ///
    /// # Errors
    ///
    /// * `RiftmendError::NotRunning` if the manager is stopped.
    /// * `RiftmendError::StateTransferInProgress` during a rebalance outside
    ///   the conflict-resolution phase.
    /// * `RiftmendError::AlreadyInProgress` if a scan is active.
    pub fn get_conflicts(&self) -> Result<ConflictStream<K, V>> {
        self.check_is_running()?;
        self.open_scan(self.topology.load())
    }

    /// Starts a scan, stopping it again if the manager was stopped while the
    /// scan was being set up. A scan stopped that way yields nothing.
    fn open_scan(&self, topology: Arc<TopologyView>) -> Result<ConflictStream<K, V>> {
        let conflicts = self.scanner.scan(topology)?;
        if !self.is_running() {
            debug!(
                "Cache {} stopped while starting a conflict scan",
                self.config.cache_name
            );
            self.scanner.stop();
        }
        Ok(conflicts)
    }

    pub fn is_conflict_resolution_in_progress(&self) -> bool {
        self.scanner.is_in_progress()
    }

    pub fn is_state_transfer_in_progress(&self) -> bool {
        self.services.state_transfer.is_state_transfer_in_progress()
    }

    /// Resolves every conflict of the installed topology with the configured
    /// merge policy.
    ///
    /// # Errors
    ///
    /// `RiftmendError::MergeConfig` if no merge policy is configured, plus the
    /// errors of `get_conflicts` and scan failures.
    pub async fn resolve_conflicts(&self) -> Result<ResolutionSummary> {
        let policy = self.configured_policy()?;
        self.resolve_conflicts_with(policy).await
    }

    /// Resolves every conflict of the installed topology with `policy`.
    pub async fn resolve_conflicts_with(
        &self,
        policy: Arc<dyn EntryMergePolicy<K, V>>,
    ) -> Result<ResolutionSummary> {
        self.check_is_running()?;
        self.do_resolve_conflicts(self.topology.load(), policy, true)
            .await
    }

    /// Automatic resolution for a topology entering the conflict-resolution
    /// phase. Returns an empty summary while stopped.
    ///
    /// # Errors
    ///
    /// `RiftmendError::MergeConfig` if no merge policy is configured.
    pub async fn resolve_conflicts_for_topology(
        &self,
        topology: Arc<TopologyView>,
    ) -> Result<ResolutionSummary> {
        if !self.is_running() {
            return Ok(ResolutionSummary::default());
        }
        let policy = self.configured_policy()?;
        self.do_resolve_conflicts(topology, policy, false).await
    }

    fn configured_policy(&self) -> Result<Arc<dyn EntryMergePolicy<K, V>>> {
        self.merge_policy.read().clone().ok_or_else(|| {
            RiftmendError::MergeConfig(
                "Cannot resolve conflicts as no merge policy has been configured".to_string(),
            )
        })
    }

    async fn do_resolve_conflicts(
        &self,
        topology: Arc<TopologyView>,
        policy: Arc<dyn EntryMergePolicy<K, V>>,
        user_call: bool,
    ) -> Result<ResolutionSummary> {
        trace!(
            "Cache {} Attempting to resolve conflicts. All members {:?}, topology {}, preferred partition {:?}",
            self.config.cache_name,
            topology.members(),
            topology.topology_id(),
            topology.current_layout().members()
        );
        let conflicts = self.open_scan(Arc::clone(&topology))?;
        let pipeline = ResolutionPipeline {
            cache_name: self.config.cache_name.clone(),
            topology,
            policy,
            writer: Arc::clone(&self.services.writer),
            flags: if user_call {
                WriteFlags::USER_MERGE
            } else {
                WriteFlags::AUTO_MERGE
            },
            executor: self.resolution_executor.clone(),
        };
        pipeline.run(conflicts).await
    }

    /// Number of version requests currently registered.
    pub fn live_version_requests(&self) -> usize {
        self.collector.live_requests()
    }

    /// Number of version requests waiting for `restart_version_requests`.
    pub fn queued_version_retries(&self) -> usize {
        self.collector.queued_retries()
    }

    /// The version collector, for inspecting individual requests.
    pub fn version_collector(&self) -> &VersionCollector<K, V> {
        &self.collector
    }

    pub fn config(&self) -> &ConflictManagerConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }
}
