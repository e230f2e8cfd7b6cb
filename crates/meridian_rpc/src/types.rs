//! Core key/value data model.
//!
//! Keys and values are byte strings carried as [`bytes::Bytes`] so that
//! request buffers, cached replies, and shadow-comparison copies share one
//! backing allocation. Key ranges are end-exclusive everywhere.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub type Key = Bytes;
pub type Value = Bytes;
pub type Tag = String;

/// Database version. Monotonic, assigned by the cluster.
pub type Version = i64;

/// Sentinel for "no version" (e.g. the commit version of a read-only commit).
pub const INVALID_VERSION: Version = 0;
/// Sentinel meaning "resolve to the newest version at send time".
pub const LATEST_VERSION: Version = -1;

/// First key of the user key space.
pub fn all_keys_begin() -> Key {
    Bytes::new()
}

/// End of the entire key space, system keys included.
pub fn all_keys_end() -> Key {
    Bytes::from_static(b"\xff\xff")
}

/// Start of the reserved system prefix.
pub fn system_keys_begin() -> Key {
    Bytes::from_static(b"\xff")
}

/// The whole key space as a range.
pub fn all_keys() -> KeyRange {
    KeyRange::new(all_keys_begin(), all_keys_end())
}

/// Key whose value is the cluster's metadata version.
pub fn metadata_version_key() -> Key {
    Bytes::from_static(b"\xff/metadataVersion")
}

/// System prefix under which shadow-server quarantine markers are written.
pub const TSS_QUARANTINE_PREFIX: &[u8] = b"\xff/tssQuarantine/";
/// System prefix holding per-server tag registrations.
pub const SERVER_TAG_PREFIX: &[u8] = b"\xff/serverTag/";
/// System prefix under which shadow mismatch records are persisted.
pub const TSS_MISMATCH_PREFIX: &[u8] = b"\xff/tssMismatch/";

/// Smallest key strictly greater than `key`.
pub fn key_after(key: &[u8]) -> Key {
    let mut out = BytesMut::with_capacity(key.len() + 1);
    out.put_slice(key);
    out.put_u8(0);
    out.freeze()
}

/// Concatenate a system prefix with a suffix.
pub fn prefixed_key(prefix: &[u8], suffix: &[u8]) -> Key {
    let mut out = BytesMut::with_capacity(prefix.len() + suffix.len());
    out.put_slice(prefix);
    out.put_slice(suffix);
    out.freeze()
}

/// Half-open key interval `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    pub fn new(begin: Key, end: Key) -> Self {
        Self { begin, end }
    }

    /// Range containing exactly `key`.
    pub fn single_key(key: &[u8]) -> Self {
        Self {
            begin: Bytes::copy_from_slice(key),
            end: key_after(key),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.begin[..] <= *key && *key < self.end[..]
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    pub fn intersection(&self, other: &KeyRange) -> Option<KeyRange> {
        let begin = self.begin.clone().max(other.begin.clone());
        let end = self.end.clone().min(other.end.clone());
        (begin < end).then_some(KeyRange { begin, end })
    }
}

/// A key described by relative position: the `offset`-th key from the
/// resolution point of `(key, or_equal)`.
///
/// `first_greater_or_equal(k)` is `(k, false, 1)`; adding or subtracting
/// from a selector adjusts only the offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySelector {
    pub key: Key,
    pub or_equal: bool,
    pub offset: i64,
}

impl KeySelector {
    pub fn new(key: Key, or_equal: bool, offset: i64) -> Self {
        Self { key, or_equal, offset }
    }

    pub fn first_greater_or_equal(key: Key) -> Self {
        Self::new(key, false, 1)
    }

    pub fn first_greater_than(key: Key) -> Self {
        Self::new(key, true, 1)
    }

    pub fn last_less_or_equal(key: Key) -> Self {
        Self::new(key, true, 0)
    }

    pub fn last_less_than(key: Key) -> Self {
        Self::new(key, false, 0)
    }

    /// True when resolution must look at the shard *before* `key`.
    pub fn is_backward(&self) -> bool {
        !self.or_equal && self.offset <= 0
    }

    pub fn is_first_greater_or_equal(&self) -> bool {
        !self.or_equal && self.offset == 1
    }

    pub fn is_first_greater_than(&self) -> bool {
        self.or_equal && self.offset == 1
    }

    pub fn is_last_less_or_equal(&self) -> bool {
        self.or_equal && self.offset == 0
    }

    /// The selector resolves at or past `bound` no matter what keys exist.
    pub fn is_definitely_greater(&self, bound: &[u8]) -> bool {
        self.offset >= 1 && self.key[..] >= *bound
    }

    /// The selector resolves strictly before `bound` no matter what keys exist.
    pub fn is_definitely_less(&self, bound: &[u8]) -> bool {
        self.offset <= 0 && self.key[..] <= *bound
    }

    pub fn add(&self, n: i64) -> Self {
        Self::new(self.key.clone(), self.or_equal, self.offset + n)
    }
}

/// One key-value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Key,
    pub value: Value,
}

/// Result of a range read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    /// More data matches the request beyond what was returned.
    pub more: bool,
    /// The scan observed the beginning of the key space.
    pub read_to_begin: bool,
    /// The scan observed the end of the key space.
    pub read_through_end: bool,
    /// When set, all keys up to (exclusive) this bound were observed even
    /// though no data past the last returned pair existed in the shard.
    pub read_through: Option<Key>,
}

impl RangeResult {
    pub fn len(&self) -> usize {
        self.kvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kvs.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.kvs.iter().map(|kv| kv.key.len() + kv.value.len()).sum()
    }
}

/// Row/byte limits for a range read.
///
/// `rows == ROW_LIMIT_UNLIMITED` and `bytes == BYTE_LIMIT_UNLIMITED` disable
/// the respective bound. `min_rows` lets a caller keep iterating shards until
/// a minimum number of rows has been accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeLimits {
    pub rows: usize,
    pub bytes: usize,
    pub min_rows: usize,
}

pub const ROW_LIMIT_UNLIMITED: usize = usize::MAX;
pub const BYTE_LIMIT_UNLIMITED: usize = usize::MAX;

impl Default for RangeLimits {
    fn default() -> Self {
        Self {
            rows: ROW_LIMIT_UNLIMITED,
            bytes: BYTE_LIMIT_UNLIMITED,
            min_rows: 0,
        }
    }
}

impl RangeLimits {
    pub fn rows(rows: usize) -> Self {
        Self { rows, ..Self::default() }
    }

    pub fn is_valid(&self) -> bool {
        self.min_rows <= self.rows
    }

    pub fn has_row_limit(&self) -> bool {
        self.rows != ROW_LIMIT_UNLIMITED
    }

    pub fn has_byte_limit(&self) -> bool {
        self.bytes != BYTE_LIMIT_UNLIMITED
    }

    pub fn is_reached(&self) -> bool {
        self.rows == 0 || self.bytes == 0
    }

    pub fn has_satisfied_min_rows(&self) -> bool {
        self.min_rows == 0
    }

    /// Consume limits for one reply's worth of data.
    pub fn decrement(&mut self, data: &[KeyValue]) {
        if self.has_row_limit() {
            self.rows = self.rows.saturating_sub(data.len());
        }
        self.min_rows = self.min_rows.saturating_sub(data.len());
        if self.has_byte_limit() {
            let bytes: usize = data.iter().map(|kv| kv.key.len() + kv.value.len()).sum();
            self.bytes = self.bytes.saturating_sub(bytes);
        }
    }
}

/// Server-evaluated mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationType {
    SetValue,
    ClearRange,
    Add,
    And,
    Or,
    Xor,
    Min,
    Max,
    ByteMin,
    ByteMax,
    AppendIfFits,
    CompareAndClear,
    SetVersionstampedKey,
    SetVersionstampedValue,
    /// `Min` with correct semantics on absent keys.
    MinV2,
    /// `And` with correct semantics on absent keys.
    AndV2,
}

impl MutationType {
    pub fn is_atomic(self) -> bool {
        !matches!(self, MutationType::SetValue | MutationType::ClearRange)
    }

    pub fn is_versionstamped(self) -> bool {
        matches!(
            self,
            MutationType::SetVersionstampedKey | MutationType::SetVersionstampedValue
        )
    }
}

/// One mutation. For `ClearRange`, `param1`/`param2` are the range bounds;
/// otherwise they are key and value/operand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub mutation_type: MutationType,
    pub param1: Key,
    pub param2: Value,
}

impl Mutation {
    pub fn byte_size(&self) -> usize {
        self.param1.len() + self.param2.len()
    }
}

/// Priority class of a transaction's read version and commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Batch,
    Default,
    Immediate,
}

/// 10-byte token identifying a commit's position in the version order:
/// 8-byte big-endian commit version followed by the 2-byte big-endian index
/// of the transaction within its commit batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Versionstamp(pub [u8; 10]);

impl Versionstamp {
    pub fn new(version: Version, batch_id: u16) -> Self {
        let mut out = [0u8; 10];
        out[..8].copy_from_slice(&version.to_be_bytes());
        out[8..].copy_from_slice(&batch_id.to_be_bytes());
        Self(out)
    }

    pub fn version(&self) -> Version {
        let mut v = [0u8; 8];
        v.copy_from_slice(&self.0[..8]);
        Version::from_be_bytes(v)
    }

    pub fn batch_id(&self) -> u16 {
        u16::from_be_bytes([self.0[8], self.0[9]])
    }

    pub fn as_bytes(&self) -> &[u8; 10] {
        &self.0
    }
}
