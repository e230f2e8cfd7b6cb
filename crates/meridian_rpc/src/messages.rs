//! Request and reply messages for every cluster protocol the client speaks.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::interface::StorageServerInterface;
use crate::types::{
    Key, KeyRange, KeySelector, KeyValue, Mutation, Priority, Tag, Value, Version,
};

/// Opaque tracing span identifier, inherited from the parent operation.
pub type SpanId = u64;

/// Client-supplied identifier attached to requests for debug tracing.
pub type DebugId = u64;

// Small local stand-in for a bitflags dependency: the flag set is tiny and
// fixed by the wire contract.
macro_rules! bitflags_lite {
    ($(#[$meta:meta])* pub struct $name:ident: $ty:ty { $(const $flag:ident = $val:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub $ty);

        impl $name {
            $(pub const $flag: $name = $name($val);)*

            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn union(self, other: $name) -> $name {
                $name(self.0 | other.0)
            }
        }
    };
}

bitflags_lite!(
    /// Flags carried on a read-version request.
    pub struct GrvFlags: u32 {
        const CAUSAL_READ_RISKY = 1;
        const USE_PROVISIONAL_PROXIES = 2;
    }
);

/// Per-tag throttle limit piggybacked on a GRV reply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TagThrottleLimits {
    /// Admitted transactions per second; zero means fully throttled.
    pub rate: f64,
    /// Seconds from reply receipt until the entry expires.
    pub expiration_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetReadVersionRequest {
    pub span: SpanId,
    /// Number of transactions this batched request stands for.
    pub count: usize,
    pub priority: Option<Priority>,
    pub flags: GrvFlags,
    /// Tag -> number of waiting transactions carrying it.
    pub tags: HashMap<Tag, u32>,
    pub debug_id: Option<DebugId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetReadVersionReply {
    pub version: Version,
    pub locked: bool,
    pub metadata_version: Option<Value>,
    /// Tag throttle updates for this priority. Tags carried on the request
    /// but absent here are no longer throttled.
    pub tag_throttle_info: HashMap<Tag, TagThrottleLimits>,
    /// Cluster's current mid-shard size estimate in bytes, when known.
    pub mid_shard_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetKeyServerLocationsRequest {
    pub span: SpanId,
    pub begin: Key,
    /// When absent, resolve the single shard containing (or preceding,
    /// if `reverse`) `begin`.
    pub end: Option<Key>,
    pub limit: usize,
    pub reverse: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetKeyServerLocationsReply {
    pub results: Vec<(KeyRange, Vec<StorageServerInterface>)>,
    /// Primary server id -> its paired shadow server.
    pub tss_mapping: Vec<(u64, StorageServerInterface)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetValueRequest {
    pub span: SpanId,
    pub key: Key,
    pub version: Version,
    pub tags: Vec<Tag>,
    pub debug_id: Option<DebugId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetValueReply {
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetKeyRequest {
    pub span: SpanId,
    pub selector: KeySelector,
    pub version: Version,
    pub tags: Vec<Tag>,
    pub debug_id: Option<DebugId>,
}

/// The reply selector either names the resolved key (`offset == 0`,
/// `or_equal == true`) or re-points the search into a neighboring shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetKeyReply {
    pub selector: KeySelector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetKeyValuesRequest {
    pub span: SpanId,
    pub begin: KeySelector,
    pub end: KeySelector,
    pub version: Version,
    /// Row limit; negative means reverse iteration from `end`.
    pub limit: i64,
    pub limit_bytes: usize,
    pub tags: Vec<Tag>,
    pub debug_id: Option<DebugId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetKeyValuesReply {
    pub data: Vec<KeyValue>,
    pub version: Version,
    pub more: bool,
    /// Data was served from a cache replica.
    pub cached: bool,
}

/// One chunk of a streaming range read. The stream ends after the first
/// chunk with `more == false`.
pub type GetKeyValuesStreamReply = GetKeyValuesReply;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchValueRequest {
    pub span: SpanId,
    pub key: Key,
    /// Value the watcher believes current; the server replies once the
    /// stored value differs at a version at or past `version`.
    pub value: Option<Value>,
    pub version: Version,
    pub tags: Vec<Tag>,
    pub debug_id: Option<DebugId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchValueReply {
    pub version: Version,
}

bitflags_lite!(
    /// Flags carried on a commit request.
    pub struct CommitFlags: u32 {
        const LOCK_AWARE = 1;
        const FIRST_IN_BATCH = 2;
    }
);

/// The transaction body submitted to a commit proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitTransactionBody {
    pub read_conflict_ranges: Vec<KeyRange>,
    pub write_conflict_ranges: Vec<KeyRange>,
    pub mutations: Vec<Mutation>,
    pub read_snapshot: Version,
    pub report_conflicting_keys: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitRequest {
    pub span: SpanId,
    pub transaction: CommitTransactionBody,
    pub flags: CommitFlags,
    pub tags: Vec<Tag>,
    pub debug_id: Option<DebugId>,
}

/// Success carries `version > 0`; a conflict carries `version ==
/// INVALID_VERSION` plus, when requested, the indices of the read conflict
/// ranges that lost.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitReply {
    pub version: Version,
    pub batch_id: u16,
    pub metadata_version: Option<Value>,
    pub conflicting_range_indices: Option<Vec<usize>>,
}

/// Aggregate shard statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageMetrics {
    pub bytes: i64,
    pub bytes_per_second: f64,
}

impl StorageMetrics {
    pub fn add(&self, other: &StorageMetrics) -> StorageMetrics {
        StorageMetrics {
            bytes: self.bytes + other.bytes,
            bytes_per_second: self.bytes_per_second + other.bytes_per_second,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitMetricsRequest {
    pub span: SpanId,
    pub keys: KeyRange,
    pub min: StorageMetrics,
    pub max: StorageMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitMetricsRequest {
    pub span: SpanId,
    pub keys: KeyRange,
    /// Target size of each produced chunk.
    pub limits: StorageMetrics,
    /// Metrics already consumed by earlier shards of the same split call.
    pub used: StorageMetrics,
    pub is_last_shard: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SplitMetricsReply {
    pub splits: Vec<Key>,
    pub used: StorageMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadHotRangesRequest {
    pub span: SpanId,
    pub keys: KeyRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadHotRange {
    pub keys: KeyRange,
    pub density: f64,
    pub read_bandwidth: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadHotRangesReply {
    pub ranges: Vec<ReadHotRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRangeSplitPointsRequest {
    pub span: SpanId,
    pub keys: KeyRange,
    pub chunk_size: i64,
}

/// Split points always bracket the requested range: the first point is the
/// range begin and the last is the range end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetRangeSplitPointsReply {
    pub points: Vec<Key>,
}
