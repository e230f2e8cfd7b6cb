//! Shared in-process cluster fabric for integration tests.
//!
//! `MockCluster` implements the transport traits over one versioned
//! in-memory store with a configurable shard table, conflict-checking
//! commit proxy, shadow pairings with divergent answers, and fault knobs
//! (stale-shard answers, dropped commit replies, canned watch replies).

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use meridian_client::{ClientKnobs, ClusterDescriptor, ClusterFile, Database};
use meridian_rpc::error::{Error, Result};
use meridian_rpc::interface::{
    ClusterClientInfo, CommitProxyInterface, GrvProxyInterface, StorageServerInterface,
};
use meridian_rpc::messages::{
    CommitReply, CommitRequest, GetKeyReply, GetKeyRequest, GetKeyServerLocationsReply,
    GetKeyServerLocationsRequest, GetKeyValuesReply, GetKeyValuesRequest, GetRangeSplitPointsReply,
    GetRangeSplitPointsRequest, GetReadVersionReply, GetReadVersionRequest, GetValueReply,
    GetValueRequest, ReadHotRangesReply, ReadHotRangesRequest, SplitMetricsReply,
    SplitMetricsRequest, StorageMetrics, TagThrottleLimits, WaitMetricsRequest, WatchValueReply,
    WatchValueRequest,
};
use meridian_rpc::transport::{ClusterTransport, ReplyStream, StorageTransport};
use meridian_rpc::types::{
    all_keys_end, Key, KeyRange, KeySelector, KeyValue, Mutation, MutationType, Tag, Value,
    Version, INVALID_VERSION,
};
use tokio::sync::{mpsc, watch, Notify};

pub fn key(s: &str) -> Key {
    Bytes::copy_from_slice(s.as_bytes())
}

pub fn val(s: &str) -> Value {
    Bytes::copy_from_slice(s.as_bytes())
}

pub fn range(b: &str, e: &str) -> KeyRange {
    KeyRange::new(key(b), key(e))
}

/// Test knobs: production defaults with delays shrunk so retries and
/// batching resolve in test time.
pub fn test_knobs() -> ClientKnobs {
    ClientKnobs {
        wrong_shard_server_delay: Duration::from_millis(1),
        future_version_retry_delay: Duration::from_millis(1),
        default_backoff: Duration::from_millis(1),
        default_max_backoff: Duration::from_millis(50),
        load_balance_tss_timeout: Duration::from_millis(500),
        ..ClientKnobs::default()
    }
}

#[derive(Default)]
pub struct Faults {
    /// Keys whose next point read answers `WrongShardServer`.
    pub wrong_shard_keys: HashSet<Vec<u8>>,
    /// Commits to swallow after applying them (reply never arrives).
    pub drop_reply_after_apply: u32,
    /// Commits to swallow without applying them.
    pub drop_reply_without_apply: u32,
    /// Next watch request answers immediately with this version.
    pub watch_fire_once: Option<Version>,
    /// Cluster is locked: GRV replies carry the locked flag.
    pub locked: bool,
    /// Tag throttle updates piggybacked on the next GRV reply.
    pub tag_throttles: HashMap<Tag, TagThrottleLimits>,
}

struct VersionedValue {
    version: Version,
    value: Option<Value>,
}

struct StoreState {
    /// Committed version history per key, oldest first.
    store: BTreeMap<Key, Vec<VersionedValue>>,
    version: Version,
    batch_counter: u16,
    metadata_version: Option<Value>,
    /// `(commit_version, write_conflict_ranges)` of every commit.
    commit_log: Vec<(Version, Vec<KeyRange>)>,
    shards: Vec<(KeyRange, Vec<u64>)>,
    servers: HashMap<u64, StorageServerInterface>,
    tss_pairs: Vec<(u64, StorageServerInterface)>,
    /// Divergent answers served by a shadow: `shadow_id -> key -> value`.
    shadow_overrides: HashMap<u64, HashMap<Key, Option<Value>>>,
}

#[derive(Default)]
pub struct Counters {
    pub grv_rpcs: AtomicU64,
    pub grv_count_total: AtomicU64,
    pub grv_max_count: AtomicU64,
    pub commit_rpcs: AtomicU64,
    pub location_rpcs: AtomicU64,
    pub get_value_rpcs: AtomicU64,
    pub get_range_rpcs: AtomicU64,
    pub stream_rpcs: AtomicU64,
    pub watch_rpcs: AtomicU64,
}

pub struct MockCluster {
    state: Mutex<StoreState>,
    pub faults: Mutex<Faults>,
    pub counters: Counters,
    commit_notify: Notify,
    info_tx: watch::Sender<ClusterClientInfo>,
}

impl MockCluster {
    /// A cluster whose key space is split at the given keys, one storage
    /// server per shard (ids 1..), plus one GRV and one commit proxy.
    pub fn with_splits(splits: &[&str]) -> Arc<Self> {
        let mut boundaries: Vec<Key> = vec![Bytes::new()];
        boundaries.extend(splits.iter().map(|s| key(s)));
        boundaries.push(all_keys_end());

        let mut shards = Vec::new();
        let mut servers = HashMap::new();
        for (i, pair) in boundaries.windows(2).enumerate() {
            let id = (i + 1) as u64;
            servers.insert(
                id,
                StorageServerInterface::with_base_token(id, format!("ss-{id}:4500"), id * 1000),
            );
            shards.push((KeyRange::new(pair[0].clone(), pair[1].clone()), vec![id]));
        }

        let info = ClusterClientInfo {
            generation: 1,
            grv_proxies: vec![GrvProxyInterface {
                id: 9001,
                address: "grv-1:4500".into(),
                get_read_version: 910_000,
            }],
            commit_proxies: vec![CommitProxyInterface {
                id: 9101,
                address: "commit-1:4500".into(),
                commit: 920_000,
                get_key_server_locations: 920_001,
            }],
            provisional_commit_proxies: Vec::new(),
            coordinators: vec!["coord-1:4500".into()],
        };
        let (info_tx, _) = watch::channel(info);

        Arc::new(Self {
            state: Mutex::new(StoreState {
                store: BTreeMap::new(),
                version: 100,
                batch_counter: 0,
                metadata_version: None,
                commit_log: Vec::new(),
                shards,
                servers,
                tss_pairs: Vec::new(),
                shadow_overrides: HashMap::new(),
            }),
            faults: Mutex::new(Faults::default()),
            counters: Counters::default(),
            commit_notify: Notify::new(),
            info_tx,
        })
    }

    pub fn single_shard() -> Arc<Self> {
        Self::with_splits(&[])
    }

    /// Open a database over this cluster.
    pub fn database(self: &Arc<Self>) -> Database {
        let cluster_file = ClusterFile::in_memory(ClusterDescriptor {
            name: "mock".into(),
            id: "deadbeef".into(),
            coordinators: vec!["coord-1:4500".into()],
        });
        Database::new(self.clone(), self.clone(), cluster_file, test_knobs())
    }

    /// Pair `primary` with a shadow server that serves `overrides` instead
    /// of the real data for those keys.
    pub fn install_shadow(
        self: &Arc<Self>,
        primary: u64,
        overrides: HashMap<Key, Option<Value>>,
    ) -> u64 {
        let shadow_id = primary + 500;
        let mut shadow = StorageServerInterface::with_base_token(
            shadow_id,
            format!("tss-{shadow_id}:4500"),
            shadow_id * 1000,
        );
        shadow.is_shadow = true;
        let mut state = self.state.lock().unwrap();
        state.servers.insert(shadow_id, shadow.clone());
        state.tss_pairs.push((primary, shadow));
        state.shadow_overrides.insert(shadow_id, overrides);
        shadow_id
    }

    /// Directly read the latest committed value, outside any transaction.
    pub fn latest(&self, k: &Key) -> Option<Value> {
        let state = self.state.lock().unwrap();
        read_at(&state.store, k, state.version)
    }

    pub fn current_version(&self) -> Version {
        self.state.lock().unwrap().version
    }

    /// Publish a new membership generation (same proxies).
    pub fn bump_generation(&self) {
        self.info_tx.send_modify(|info| info.generation += 1);
    }

    fn snapshot_keys(&self, version: Version) -> Vec<Key> {
        let state = self.state.lock().unwrap();
        state
            .store
            .iter()
            .filter(|(_, versions)| visible(versions, version).is_some())
            .map(|(k, _)| k.clone())
            .collect()
    }
}

fn visible(versions: &[VersionedValue], at: Version) -> Option<&VersionedValue> {
    versions.iter().rev().find(|v| v.version <= at)
}

fn read_at(store: &BTreeMap<Key, Vec<VersionedValue>>, k: &Key, at: Version) -> Option<Value> {
    store
        .get(k)
        .and_then(|versions| visible(versions, at))
        .and_then(|v| v.value.clone())
}

/// Resolve a selector against the keys visible at `version`.
fn resolve_selector(keys: &[Key], sel: &KeySelector) -> ResolvedKey {
    // Number of keys at or before the anchor.
    let anchor = if sel.or_equal {
        keys.partition_point(|k| k <= &sel.key)
    } else {
        keys.partition_point(|k| k < &sel.key)
    };
    let idx = anchor as i64 + sel.offset - 1;
    if idx < 0 {
        ResolvedKey::SpaceBegin
    } else if idx >= keys.len() as i64 {
        ResolvedKey::SpaceEnd
    } else {
        ResolvedKey::At(keys[idx as usize].clone())
    }
}

enum ResolvedKey {
    SpaceBegin,
    At(Key),
    SpaceEnd,
}

impl ResolvedKey {
    fn into_key(self) -> Key {
        match self {
            ResolvedKey::SpaceBegin => Bytes::new(),
            ResolvedKey::At(k) => k,
            ResolvedKey::SpaceEnd => all_keys_end(),
        }
    }
}

impl MockCluster {
    fn apply_mutations(
        state: &mut StoreState,
        mutations: &[Mutation],
        version: Version,
        batch_id: u16,
    ) {
        for m in mutations {
            match m.mutation_type {
                MutationType::SetValue => {
                    state
                        .store
                        .entry(m.param1.clone())
                        .or_default()
                        .push(VersionedValue {
                            version,
                            value: Some(m.param2.clone()),
                        });
                }
                MutationType::ClearRange => {
                    let clear = KeyRange::new(m.param1.clone(), m.param2.clone());
                    let doomed: Vec<Key> = state
                        .store
                        .keys()
                        .filter(|k| clear.contains(k))
                        .cloned()
                        .collect();
                    for k in doomed {
                        state.store.entry(k).or_default().push(VersionedValue {
                            version,
                            value: None,
                        });
                    }
                }
                MutationType::Add => {
                    let existing = read_at(&state.store, &m.param1, version)
                        .map(|v| le_u64(&v))
                        .unwrap_or(0);
                    let operand = le_u64(&m.param2);
                    let sum = existing.wrapping_add(operand);
                    state
                        .store
                        .entry(m.param1.clone())
                        .or_default()
                        .push(VersionedValue {
                            version,
                            value: Some(Bytes::copy_from_slice(&sum.to_le_bytes())),
                        });
                }
                MutationType::SetVersionstampedKey => {
                    // Strip the 4-byte offset trailer and patch the stamp in.
                    let raw = &m.param1;
                    let trailer = &raw[raw.len() - 4..];
                    let offset = u32::from_le_bytes([
                        trailer[0], trailer[1], trailer[2], trailer[3],
                    ]) as usize;
                    let mut stamped = raw[..raw.len() - 4].to_vec();
                    let vs = meridian_rpc::types::Versionstamp::new(version, batch_id);
                    stamped[offset..offset + 10].copy_from_slice(vs.as_bytes());
                    state
                        .store
                        .entry(Bytes::from(stamped))
                        .or_default()
                        .push(VersionedValue {
                            version,
                            value: Some(m.param2.clone()),
                        });
                }
                other => panic!("mock cluster does not implement mutation {other:?}"),
            }
        }
    }
}

#[async_trait]
impl ClusterTransport for MockCluster {
    fn client_info(&self) -> watch::Receiver<ClusterClientInfo> {
        self.info_tx.subscribe()
    }

    async fn get_read_version(
        &self,
        _proxy: &GrvProxyInterface,
        req: GetReadVersionRequest,
    ) -> Result<GetReadVersionReply> {
        self.counters.grv_rpcs.fetch_add(1, Ordering::SeqCst);
        self.counters
            .grv_count_total
            .fetch_add(req.count as u64, Ordering::SeqCst);
        self.counters
            .grv_max_count
            .fetch_max(req.count as u64, Ordering::SeqCst);

        let faults = self.faults.lock().unwrap();
        let state = self.state.lock().unwrap();
        Ok(GetReadVersionReply {
            version: state.version,
            locked: faults.locked,
            metadata_version: state.metadata_version.clone(),
            tag_throttle_info: faults.tag_throttles.clone(),
            mid_shard_size: Some(1 << 20),
        })
    }

    async fn commit(
        &self,
        _proxy: &CommitProxyInterface,
        req: CommitRequest,
    ) -> Result<CommitReply> {
        self.counters.commit_rpcs.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();

        // Optimistic conflict check against every commit past the snapshot.
        let mut conflicting: Vec<usize> = Vec::new();
        for (i, read_range) in req.transaction.read_conflict_ranges.iter().enumerate() {
            let lost = state.commit_log.iter().any(|(v, writes)| {
                *v > req.transaction.read_snapshot
                    && writes.iter().any(|w| w.intersects(read_range))
            });
            if lost {
                conflicting.push(i);
            }
        }
        if !conflicting.is_empty() {
            return Ok(CommitReply {
                version: INVALID_VERSION,
                batch_id: 0,
                metadata_version: None,
                conflicting_range_indices: req
                    .transaction
                    .report_conflicting_keys
                    .then_some(conflicting),
            });
        }

        {
            let mut faults = self.faults.lock().unwrap();
            if faults.drop_reply_without_apply > 0 {
                faults.drop_reply_without_apply -= 1;
                return Err(Error::RequestMaybeDelivered);
            }
        }

        state.version += 1;
        state.batch_counter = state.batch_counter.wrapping_add(1);
        let version = state.version;
        let batch_id = state.batch_counter;
        Self::apply_mutations(&mut state, &req.transaction.mutations, version, batch_id);
        state
            .commit_log
            .push((version, req.transaction.write_conflict_ranges.clone()));
        let metadata_version = state.metadata_version.clone();
        drop(state);
        self.commit_notify.notify_waiters();

        {
            let mut faults = self.faults.lock().unwrap();
            if faults.drop_reply_after_apply > 0 {
                faults.drop_reply_after_apply -= 1;
                return Err(Error::RequestMaybeDelivered);
            }
        }

        Ok(CommitReply {
            version,
            batch_id,
            metadata_version,
            conflicting_range_indices: None,
        })
    }

    async fn get_key_server_locations(
        &self,
        _proxy: &CommitProxyInterface,
        req: GetKeyServerLocationsRequest,
    ) -> Result<GetKeyServerLocationsReply> {
        self.counters.location_rpcs.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();

        let mut results = Vec::new();
        let span_end = req.end.clone();
        for (shard, server_ids) in &state.shards {
            let hit = match &span_end {
                Some(end) => shard.intersects(&KeyRange::new(req.begin.clone(), end.clone())),
                None if req.reverse => {
                    // The shard holding the key immediately before `begin`.
                    shard.begin < req.begin && req.begin <= shard.end
                }
                None => shard.contains(&req.begin),
            };
            if hit {
                let servers = server_ids
                    .iter()
                    .filter_map(|id| state.servers.get(id).cloned())
                    .collect();
                results.push((shard.clone(), servers));
            }
        }
        if req.reverse {
            results.reverse();
        }
        results.truncate(req.limit.max(1));

        Ok(GetKeyServerLocationsReply {
            results,
            tss_mapping: state.tss_pairs.clone(),
        })
    }
}

impl MockCluster {
    /// Value a given server reports for `k`, honoring shadow overrides.
    fn server_read(&self, server: &StorageServerInterface, k: &Key, at: Version) -> Option<Value> {
        let state = self.state.lock().unwrap();
        if let Some(overrides) = state.shadow_overrides.get(&server.id) {
            if let Some(diverged) = overrides.get(k) {
                return diverged.clone();
            }
        }
        read_at(&state.store, k, at)
    }
}

#[async_trait]
impl StorageTransport for MockCluster {
    async fn get_value(
        &self,
        server: &StorageServerInterface,
        req: GetValueRequest,
    ) -> Result<GetValueReply> {
        self.counters.get_value_rpcs.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.wrong_shard_keys.remove(&req.key[..].to_vec()) {
                return Err(Error::WrongShardServer);
            }
        }
        Ok(GetValueReply {
            value: self.server_read(server, &req.key, req.version),
        })
    }

    async fn get_key(
        &self,
        _server: &StorageServerInterface,
        req: GetKeyRequest,
    ) -> Result<GetKeyReply> {
        let keys = self.snapshot_keys(req.version);
        let resolved = resolve_selector(&keys, &req.selector).into_key();
        Ok(GetKeyReply {
            selector: KeySelector::new(resolved, true, 0),
        })
    }

    async fn get_key_values(
        &self,
        _server: &StorageServerInterface,
        req: GetKeyValuesRequest,
    ) -> Result<GetKeyValuesReply> {
        self.counters.get_range_rpcs.fetch_add(1, Ordering::SeqCst);
        let keys = self.snapshot_keys(req.version);
        let begin = resolve_selector(&keys, &req.begin).into_key();
        let end = resolve_selector(&keys, &req.end).into_key();

        let reverse = req.limit < 0;
        let row_limit = req.limit.unsigned_abs() as usize;
        let mut data: Vec<KeyValue> = Vec::new();
        let mut bytes = 0usize;
        let mut more = false;

        let mut in_range: Vec<Key> = keys
            .into_iter()
            .filter(|k| *k >= begin && *k < end)
            .collect();
        if reverse {
            in_range.reverse();
        }
        let state = self.state.lock().unwrap();
        for k in in_range {
            if data.len() >= row_limit.max(1) || bytes >= req.limit_bytes {
                more = true;
                break;
            }
            let Some(value) = read_at(&state.store, &k, req.version) else {
                continue;
            };
            bytes += k.len() + value.len();
            data.push(KeyValue { key: k, value });
        }
        Ok(GetKeyValuesReply {
            data,
            version: req.version,
            more,
            cached: false,
        })
    }

    async fn get_key_values_stream(
        &self,
        server: &StorageServerInterface,
        req: GetKeyValuesRequest,
    ) -> Result<ReplyStream<GetKeyValuesReply>> {
        self.counters.stream_rpcs.fetch_add(1, Ordering::SeqCst);
        let keys = self.snapshot_keys(req.version);
        let begin = resolve_selector(&keys, &req.begin).into_key();
        let end = resolve_selector(&keys, &req.end).into_key();

        let mut rows: Vec<KeyValue> = Vec::new();
        {
            let state = self.state.lock().unwrap();
            for k in keys.into_iter().filter(|k| *k >= begin && *k < end) {
                let serve = if let Some(overrides) = state.shadow_overrides.get(&server.id) {
                    match overrides.get(&k) {
                        Some(v) => v.clone(),
                        None => read_at(&state.store, &k, req.version),
                    }
                } else {
                    read_at(&state.store, &k, req.version)
                };
                if let Some(value) = serve {
                    rows.push(KeyValue { key: k, value });
                }
            }
        }

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let mut chunks = rows.chunks(3).peekable();
            if chunks.peek().is_none() {
                let _ = tx
                    .send(Ok(GetKeyValuesReply {
                        data: Vec::new(),
                        version: req.version,
                        more: false,
                        cached: false,
                    }))
                    .await;
                return;
            }
            while let Some(chunk) = chunks.next() {
                let reply = GetKeyValuesReply {
                    data: chunk.to_vec(),
                    version: req.version,
                    more: chunks.peek().is_some(),
                    cached: false,
                };
                if tx.send(Ok(reply)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn watch_value(
        &self,
        _server: &StorageServerInterface,
        req: WatchValueRequest,
    ) -> Result<WatchValueReply> {
        self.counters.watch_rpcs.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = self.faults.lock().unwrap();
            if let Some(version) = faults.watch_fire_once.take() {
                return Ok(WatchValueReply { version });
            }
        }
        loop {
            let notified = self.commit_notify.notified();
            {
                let state = self.state.lock().unwrap();
                let current = read_at(&state.store, &req.key, state.version);
                if current != req.value {
                    let changed_at = state
                        .store
                        .get(&req.key)
                        .and_then(|versions| versions.last())
                        .map(|v| v.version)
                        .unwrap_or(state.version);
                    return Ok(WatchValueReply {
                        version: changed_at.max(req.version),
                    });
                }
            }
            notified.await;
        }
    }

    async fn wait_metrics(
        &self,
        _server: &StorageServerInterface,
        req: WaitMetricsRequest,
    ) -> Result<StorageMetrics> {
        let state = self.state.lock().unwrap();
        let bytes: usize = state
            .store
            .iter()
            .filter(|(k, _)| req.keys.contains(k))
            .filter_map(|(k, versions)| {
                visible(versions, state.version)
                    .and_then(|v| v.value.as_ref())
                    .map(|v| k.len() + v.len())
            })
            .sum();
        Ok(StorageMetrics {
            bytes: bytes as i64,
            bytes_per_second: 0.0,
        })
    }

    async fn split_metrics(
        &self,
        _server: &StorageServerInterface,
        req: SplitMetricsRequest,
    ) -> Result<SplitMetricsReply> {
        // One split in the middle when the range carries more than the
        // requested limit.
        let state = self.state.lock().unwrap();
        let in_range: Vec<(&Key, usize)> = state
            .store
            .iter()
            .filter(|(k, _)| req.keys.contains(k))
            .filter_map(|(k, versions)| {
                visible(versions, state.version)
                    .and_then(|v| v.value.as_ref())
                    .map(|v| (k, k.len() + v.len()))
            })
            .collect();
        let total: usize = in_range.iter().map(|(_, b)| b).sum();
        let mut splits = Vec::new();
        if req.limits.bytes > 0 && total as i64 > req.limits.bytes {
            if let Some((mid, _)) = in_range.get(in_range.len() / 2) {
                splits.push((*mid).clone());
            }
        }
        Ok(SplitMetricsReply {
            splits,
            used: StorageMetrics {
                bytes: req.used.bytes + total as i64,
                bytes_per_second: 0.0,
            },
        })
    }

    async fn get_read_hot_ranges(
        &self,
        _server: &StorageServerInterface,
        _req: ReadHotRangesRequest,
    ) -> Result<ReadHotRangesReply> {
        Ok(ReadHotRangesReply::default())
    }

    async fn get_range_split_points(
        &self,
        _server: &StorageServerInterface,
        req: GetRangeSplitPointsRequest,
    ) -> Result<GetRangeSplitPointsReply> {
        let state = self.state.lock().unwrap();
        let mut points = vec![req.keys.begin.clone()];
        let mut acc: i64 = 0;
        for (k, versions) in state.store.iter().filter(|(k, _)| req.keys.contains(k)) {
            if let Some(v) = visible(versions, state.version).and_then(|v| v.value.as_ref()) {
                acc += (k.len() + v.len()) as i64;
                if acc >= req.chunk_size.max(1) {
                    points.push(k.clone());
                    acc = 0;
                }
            }
        }
        points.push(req.keys.end.clone());
        Ok(GetRangeSplitPointsReply { points })
    }
}

fn le_u64(v: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = v.len().min(8);
    buf[..n].copy_from_slice(&v[..n]);
    u64::from_le_bytes(buf)
}

/// Wait until `predicate` holds or the deadline passes.
pub async fn eventually<F: Fn() -> bool>(predicate: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

static COUNTER: AtomicU16 = AtomicU16::new(0);

/// Unique suffix for keys so tests sharing a cluster do not collide.
pub fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}
