//! The database context.
//!
//! One `Database` owns everything transactions share: the location cache
//! and server-interface table, the failure monitor and queue model, GRV
//! batchers, the watch map, the tag throttle table, the metadata-version
//! ring, the shadow-server registry, counters, and transaction defaults.
//! Long-lived service tasks hold weak backrefs and are aborted when the
//! last handle drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use meridian_rpc::error::{Error, Result};
use meridian_rpc::interface::{
    CommitProxyInterface, KeyAddresses, LocationInfo, ServerId, StorageServerInterface,
};
use meridian_rpc::messages::{
    GetKeyServerLocationsReply, GetKeyServerLocationsRequest, GetReadVersionReply, GrvFlags,
};
use meridian_rpc::transport::{ClusterTransport, StorageTransport};
use meridian_rpc::types::{all_keys, Key, KeyRange, Value, Version};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster_file::ClusterFile;
use crate::failure::FailureMonitor;
use crate::grv;
use crate::knobs::ClientKnobs;
use crate::load_balance::{basic_load_balance, QueueModel};
use crate::location_cache::LocationCache;
use crate::metrics::ClientMetrics;
use crate::options::{DatabaseOption, TransactionOption};
use crate::throttle::TagThrottleTable;
use crate::transaction::Transaction;
use crate::tss::{self, MismatchEvent, TssRegistry};
use crate::watches::WatchMap;

/// Bounded ring of `(version, metadata-version value)` pairs, written by
/// every successful read-version grant and commit, searched by exact
/// version match.
pub(crate) struct MetadataVersionRing {
    entries: Vec<(Version, Option<Value>)>,
    head: usize,
}

impl MetadataVersionRing {
    pub fn new(size: usize) -> Self {
        Self {
            entries: vec![(0, None); size.max(1)],
            head: 0,
        }
    }

    /// Record `(version, value)` if it advances the ring head.
    pub fn update(&mut self, version: Version, value: Option<Value>) {
        if version > self.entries[self.head].0 {
            self.head = (self.head + 1) % self.entries.len();
            self.entries[self.head] = (version, value);
        }
    }

    pub fn head_version(&self) -> Version {
        self.entries[self.head].0
    }

    /// The metadata version recorded at exactly `version`, if cached.
    pub fn lookup(&self, version: Version) -> Option<Option<Value>> {
        if version == self.entries[self.head].0 && version != 0 {
            return Some(self.entries[self.head].1.clone());
        }
        // Binary search in logical order: head+1 is the oldest slot, head
        // the newest, and updates keep versions monotonic across that
        // window.
        let len = self.entries.len();
        let physical = |logical: usize| (self.head + 1 + logical) % len;
        let (mut lo, mut hi) = (0usize, len);
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (v, value) = &self.entries[physical(mid)];
            match v.cmp(&version) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => {
                    return (*v != 0).then(|| value.clone());
                }
            }
        }
        None
    }
}

pub(crate) struct DatabaseInner {
    pub knobs: ClientKnobs,
    pub cluster: Arc<dyn ClusterTransport>,
    pub storage: Arc<dyn StorageTransport>,
    pub cluster_file: Arc<ClusterFile>,

    pub location_cache: LocationCache,
    pub server_table: RwLock<HashMap<ServerId, Arc<StorageServerInterface>>>,
    pub failure_monitor: FailureMonitor,
    pub queue_model: QueueModel,
    pub watch_map: WatchMap,
    pub throttles: TagThrottleTable,
    pub tss: TssRegistry,
    pub tss_mismatch_tx: mpsc::UnboundedSender<MismatchEvent>,
    pub metrics: ClientMetrics,

    metadata_versions: Mutex<MetadataVersionRing>,
    pub grv_batchers: Mutex<HashMap<(meridian_rpc::types::Priority, GrvFlags), grv::BatcherHandle>>,

    transaction_defaults: Mutex<Vec<TransactionOption>>,
    snapshot_ryw: AtomicBool,
    transaction_logging: AtomicBool,
    max_watches: AtomicUsize,
    machine_id: Mutex<Option<String>>,
    datacenter_id: Mutex<Option<String>>,

    min_acceptable_read_version: AtomicI64,
    mid_shard_size: AtomicI64,

    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        for task in self.background.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl DatabaseInner {
    pub fn register_background_task(&self, task: JoinHandle<()>) {
        self.background.lock().unwrap().push(task);
    }

    pub fn max_watches(&self) -> usize {
        self.max_watches.load(Ordering::Relaxed)
    }

    pub fn snapshot_ryw_enabled(&self) -> bool {
        self.snapshot_ryw.load(Ordering::Relaxed)
    }

    pub fn transaction_logging_enabled(&self) -> bool {
        self.transaction_logging.load(Ordering::Relaxed)
    }

    pub fn locality(&self) -> (Option<String>, Option<String>) {
        (
            self.machine_id.lock().unwrap().clone(),
            self.datacenter_id.lock().unwrap().clone(),
        )
    }

    pub fn min_acceptable_read_version(&self) -> Version {
        self.min_acceptable_read_version.load(Ordering::Relaxed)
    }

    pub fn mid_shard_size(&self) -> i64 {
        self.mid_shard_size.load(Ordering::Relaxed)
    }

    /// Side effects common to every handled GRV reply.
    pub fn observe_grv_reply(&self, reply: &GetReadVersionReply) {
        self.update_metadata_version(reply.version, reply.metadata_version.clone());
        if let Some(size) = reply.mid_shard_size {
            if size > 0 {
                self.mid_shard_size.store(size, Ordering::Relaxed);
            }
        }
        self.min_acceptable_read_version
            .fetch_min(reply.version, Ordering::Relaxed);
    }

    pub fn update_metadata_version(&self, version: Version, value: Option<Value>) {
        self.metadata_versions.lock().unwrap().update(version, value);
    }

    pub fn cached_metadata_version(&self, version: Version) -> Option<Option<Value>> {
        self.metadata_versions.lock().unwrap().lookup(version)
    }

    pub fn metadata_version_head(&self) -> Version {
        self.metadata_versions.lock().unwrap().head_version()
    }

    /// Commit proxies usable by a transaction with the given provisional
    /// opt-in.
    pub fn commit_proxies(&self, use_provisional: bool) -> Vec<CommitProxyInterface> {
        let info = self.cluster.client_info().borrow().clone();
        if !info.commit_proxies.is_empty() {
            info.commit_proxies
        } else if use_provisional {
            info.provisional_commit_proxies
        } else {
            Vec::new()
        }
    }

    /// Dedupe incoming interfaces against the server table. A server whose
    /// endpoint tokens changed has migrated: the stale entry is replaced
    /// and its old endpoints are forgotten by the failure monitor.
    fn intern_interfaces(
        &self,
        interfaces: Vec<StorageServerInterface>,
    ) -> Vec<Arc<StorageServerInterface>> {
        let mut table = self.server_table.write().unwrap();
        interfaces
            .into_iter()
            .map(|ssi| match table.get(&ssi.id) {
                Some(existing) if existing.same_endpoints(&ssi) => existing.clone(),
                stale => {
                    if let Some(old) = stale {
                        debug!(server = ssi.id, "storage server migrated; refreshing interface");
                        for endpoint in [
                            old.get_value,
                            old.get_key,
                            old.get_key_values,
                            old.get_key_values_stream,
                            old.watch_value,
                        ] {
                            self.failure_monitor.forget(endpoint);
                        }
                    }
                    let shared = Arc::new(ssi);
                    table.insert(shared.id, shared.clone());
                    shared
                }
            })
            .collect()
    }

    /// Install one location-discovery reply into the cache, the server
    /// table, and the shadow registry.
    fn install_locations(
        &self,
        reply: GetKeyServerLocationsReply,
    ) -> Vec<(KeyRange, Arc<LocationInfo>)> {
        for (primary, shadow) in reply.tss_mapping {
            self.tss.install(primary, Arc::new(shadow));
        }
        let mut installed = Vec::with_capacity(reply.results.len());
        for (range, servers) in reply.results {
            let servers = self.intern_interfaces(servers);
            let info = LocationInfo::new(servers);
            self.location_cache.insert(range.clone(), info.clone());
            installed.push((range, info));
        }
        installed
    }

    async fn discover_locations(
        &self,
        req: GetKeyServerLocationsRequest,
    ) -> Result<GetKeyServerLocationsReply> {
        let mut info_rx = self.cluster.client_info();
        loop {
            let proxies = self.commit_proxies(false);
            if proxies.is_empty() {
                if info_rx.changed().await.is_err() {
                    return Err(Error::OperationCancelled);
                }
                continue;
            }
            let cluster = self.cluster.clone();
            let result = basic_load_balance(&proxies, |proxy| {
                let req = req.clone();
                let cluster = cluster.clone();
                async move { cluster.get_key_server_locations(proxy, req).await }
            })
            .await;
            match result {
                Ok(reply) => return Ok(reply),
                Err(Error::AllAlternativesFailed) => {
                    warn!("no commit proxy reachable for location discovery");
                    if info_rx.changed().await.is_err() {
                        return Err(Error::OperationCancelled);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The shard containing `key` (or the key just before it when
    /// `backward`) and its replica set.
    pub async fn get_key_location(
        self: &Arc<Self>,
        key: &Key,
        backward: bool,
    ) -> Result<(KeyRange, Arc<LocationInfo>)> {
        if let (range, Some(info)) = self.location_cache.get(key, backward) {
            ClientMetrics::bump(&self.metrics.location_cache_hits);
            return Ok((range, info));
        }
        ClientMetrics::bump(&self.metrics.location_cache_misses);
        let reply = self
            .discover_locations(GetKeyServerLocationsRequest {
                span: 0,
                begin: key.clone(),
                end: None,
                limit: 1,
                reverse: backward,
            })
            .await?;
        let mut installed = self.install_locations(reply);
        if installed.is_empty() {
            return Err(Error::WrongShardServer);
        }
        Ok(installed.swap_remove(0))
    }

    /// The shards intersecting `range`, in scan order, up to `limit`.
    pub async fn get_key_range_locations(
        self: &Arc<Self>,
        range: &KeyRange,
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<(KeyRange, Arc<LocationInfo>)>> {
        if let Some(cached) = self.location_cache.get_ranges(range, limit, reverse) {
            if !cached.is_empty() {
                ClientMetrics::bump(&self.metrics.location_cache_hits);
                return Ok(cached);
            }
        }
        ClientMetrics::bump(&self.metrics.location_cache_misses);
        let reply = self
            .discover_locations(GetKeyServerLocationsRequest {
                span: 0,
                begin: range.begin.clone(),
                end: Some(range.end.clone()),
                limit,
                reverse,
            })
            .await?;
        let installed = self.install_locations(reply);
        if installed.is_empty() {
            return Err(Error::WrongShardServer);
        }
        Ok(installed)
    }

    pub fn invalidate_cached_key(&self, key: &Key, backward: bool) {
        self.location_cache.invalidate_key(key, backward);
    }

    pub fn invalidate_cached_range(&self, range: &KeyRange) {
        self.location_cache.invalidate_range(range);
    }

    pub fn invalidate_all_cached_locations(&self) {
        self.location_cache.invalidate_range(&all_keys());
    }
}

/// Handle to one database context. Cheap to clone; the context is shared.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open a context over the given transports and cluster file.
    pub fn new(
        cluster: Arc<dyn ClusterTransport>,
        storage: Arc<dyn StorageTransport>,
        cluster_file: ClusterFile,
        knobs: ClientKnobs,
    ) -> Self {
        let (tss_mismatch_tx, tss_mismatch_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(DatabaseInner {
            location_cache: LocationCache::new(
                knobs.location_cache_size,
                knobs.location_cache_evictions_per_insert,
            ),
            server_table: RwLock::new(HashMap::new()),
            failure_monitor: FailureMonitor::new(),
            queue_model: QueueModel::new(),
            watch_map: WatchMap::new(),
            throttles: TagThrottleTable::new(),
            tss: TssRegistry::new(),
            tss_mismatch_tx,
            metrics: ClientMetrics::default(),
            metadata_versions: Mutex::new(MetadataVersionRing::new(
                knobs.metadata_version_cache_size,
            )),
            grv_batchers: Mutex::new(HashMap::new()),
            transaction_defaults: Mutex::new(Vec::new()),
            snapshot_ryw: AtomicBool::new(true),
            transaction_logging: AtomicBool::new(true),
            max_watches: AtomicUsize::new(knobs.max_watches),
            machine_id: Mutex::new(None),
            datacenter_id: Mutex::new(None),
            min_acceptable_read_version: AtomicI64::new(i64::MAX),
            mid_shard_size: AtomicI64::new(0),
            background: Mutex::new(Vec::new()),
            cluster_file: Arc::new(cluster_file),
            knobs,
            cluster,
            storage,
        });

        let mismatch_task = tokio::spawn(tss::mismatch_handler(
            Arc::downgrade(&inner),
            tss_mismatch_rx,
        ));
        inner.register_background_task(mismatch_task);

        let monitor_task = tokio::spawn(coordinator_monitor(Arc::downgrade(&inner)));
        inner.register_background_task(monitor_task);

        info!(
            cluster = %inner.cluster_file.descriptor().name,
            "database context opened"
        );
        Database { inner }
    }

    pub(crate) fn from_inner(inner: Arc<DatabaseInner>) -> Self {
        Database { inner }
    }

    pub fn create_transaction(&self) -> Transaction {
        let mut tr = Transaction::new(self.clone());
        let defaults = self.inner.transaction_defaults.lock().unwrap().clone();
        for option in defaults {
            // Defaults were validated when installed.
            let _ = tr.set_option(option);
        }
        tr
    }

    pub fn set_option(&self, option: DatabaseOption) -> Result<()> {
        match option {
            DatabaseOption::LocationCacheSize(size) => {
                if size == 0 {
                    return Err(Error::InvalidOptionValue);
                }
                self.inner.location_cache.set_max_cached(size);
            }
            DatabaseOption::MachineId(id) => {
                *self.inner.machine_id.lock().unwrap() = Some(id);
                self.inner.invalidate_all_cached_locations();
            }
            DatabaseOption::DatacenterId(id) => {
                *self.inner.datacenter_id.lock().unwrap() = Some(id);
                self.inner.invalidate_all_cached_locations();
            }
            DatabaseOption::MaxWatches(n) => {
                self.inner.max_watches.store(n, Ordering::Relaxed);
            }
            DatabaseOption::SnapshotRywEnable => {
                self.inner.snapshot_ryw.store(true, Ordering::Relaxed);
            }
            DatabaseOption::SnapshotRywDisable => {
                self.inner.snapshot_ryw.store(false, Ordering::Relaxed);
            }
            DatabaseOption::TransactionLoggingEnable => {
                self.inner.transaction_logging.store(true, Ordering::Relaxed);
            }
            DatabaseOption::TransactionLoggingDisable => {
                self.inner.transaction_logging.store(false, Ordering::Relaxed);
            }
            DatabaseOption::UseConfigDatabase => {}
            DatabaseOption::TestCausalReadRisky => {
                self.inner
                    .transaction_defaults
                    .lock()
                    .unwrap()
                    .push(TransactionOption::CausalReadRisky);
            }
            DatabaseOption::TransactionDefault(option) => {
                option.validate(self.inner.knobs.max_transaction_tag_length)?;
                self.inner.transaction_defaults.lock().unwrap().push(option);
            }
        }
        Ok(())
    }

    /// Storage addresses believed to host `key`, resolving the location if
    /// necessary.
    pub async fn get_addresses_for_key(&self, key: &Key) -> Result<KeyAddresses> {
        let (_, location) = self.inner.get_key_location(key, false).await?;
        Ok(KeyAddresses {
            key: key.clone(),
            addresses: location
                .servers
                .iter()
                .map(|s| s.address.clone())
                .collect(),
        })
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.inner.metrics
    }

    /// Server-side watches currently held by this context.
    pub fn watch_count(&self) -> usize {
        self.inner.watch_map.len()
    }

    pub fn knobs(&self) -> &ClientKnobs {
        &self.inner.knobs
    }

    pub fn cluster_file(&self) -> &ClusterFile {
        &self.inner.cluster_file
    }

    /// `health()` rendered as one JSON object, for status endpoints and
    /// log lines.
    pub fn status_json(&self) -> String {
        serde_json::to_string(&self.health()).unwrap_or_default()
    }

    /// Aggregated health counters, for status endpoints.
    pub fn health(&self) -> DatabaseHealth {
        let m = &self.inner.metrics;
        DatabaseHealth {
            reads: ClientMetrics::get(&m.reads),
            commits_started: ClientMetrics::get(&m.commits_started),
            commits_completed: ClientMetrics::get(&m.commits_completed),
            conflicts: ClientMetrics::get(&m.conflicts),
            watches: self.watch_count(),
            failed_endpoints: self.inner.failure_monitor.failed_count(),
            shadow_mismatches: ClientMetrics::get(&m.shadow_mismatches),
            mean_grv_latency: m.grv_latency.mean(),
            mean_commit_latency: m.commit_latency.mean(),
        }
    }
}

/// Point-in-time health summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseHealth {
    pub reads: u64,
    pub commits_started: u64,
    pub commits_completed: u64,
    pub conflicts: u64,
    pub watches: usize,
    pub failed_endpoints: usize,
    pub shadow_mismatches: u64,
    pub mean_grv_latency: std::time::Duration,
    pub mean_commit_latency: std::time::Duration,
}

/// Mirror coordinator changes from the membership feed into the cluster
/// file. Holds a weak backref; exits when the context drops.
async fn coordinator_monitor(db: std::sync::Weak<DatabaseInner>) {
    let mut info_rx = match db.upgrade() {
        Some(db) => db.cluster.client_info(),
        None => return,
    };
    loop {
        if info_rx.changed().await.is_err() {
            return;
        }
        let Some(db) = db.upgrade() else { return };
        let coordinators = info_rx.borrow_and_update().coordinators.clone();
        if !coordinators.is_empty() {
            if let Err(e) = db.cluster_file.update_coordinators(coordinators) {
                warn!(error = %e, "failed to persist coordinator change");
            }
        }
    }
}
