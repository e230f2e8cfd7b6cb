//! Client tunables.
//!
//! One struct with documented defaults rather than scattered constants, so
//! tests and embedders can tighten timeouts without recompiling. Values
//! follow the production client's defaults.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientKnobs {
    /// Read-version requests coalesced into one proxy RPC before the batch
    /// is closed regardless of the timer.
    pub max_batch_size: usize,
    /// Upper clamp for the dynamic GRV batch timeout.
    pub grv_batch_timeout: Duration,
    /// Waiters woken per scheduling slice when a GRV reply fans out.
    pub broadcast_batch_size: usize,

    /// Delay before retrying an operation that hit a stale shard mapping.
    pub wrong_shard_server_delay: Duration,
    /// Delay before retrying a read that raced the cluster version window.
    pub future_version_retry_delay: Duration,

    /// Cached location entries before random eviction kicks in.
    pub location_cache_size: usize,
    /// Entries evicted per admission once the cache is over budget.
    pub location_cache_evictions_per_insert: usize,
    /// Shard mappings requested per location query during a range read.
    pub get_range_shard_limit: usize,
    /// Row cap used for "all of it" internal range reads.
    pub too_many: usize,
    /// Byte budget a single storage reply is allowed to carry.
    pub reply_byte_limit: usize,

    pub key_size_limit: usize,
    pub system_key_size_limit: usize,
    pub value_size_limit: usize,
    /// Default transaction byte budget; adjustable per transaction up to
    /// `transaction_size_limit_max`.
    pub transaction_size_limit: usize,
    pub transaction_size_limit_max: usize,

    pub default_backoff: Duration,
    pub backoff_growth_rate: f64,
    pub default_max_backoff: Duration,
    /// Backoff cap while the cluster reports memory pressure.
    pub resource_constrained_max_backoff: Duration,
    /// Per-transaction retry budget; zero means unlimited.
    pub default_retry_limit: Option<u32>,

    /// Hard deadline for a shadow server's duplicated reply. Expiry is
    /// counted in the shadow metrics, never surfaced to the caller.
    pub load_balance_tss_timeout: Duration,
    /// Attempts the mismatch handler makes to persist one quarantine
    /// decision before giving up on it.
    pub tss_mismatch_retry_limit: u32,
    /// Quarantine a mismatching shadow instead of removing its server tag.
    pub quarantine_tss_on_mismatch: bool,

    /// Entries in the (version, metadata-version) ring.
    pub metadata_version_cache_size: usize,

    /// Server-side watches one database context may hold.
    pub max_watches: usize,
    /// Versions a fired watch may lag the cluster before the client
    /// re-reads instead of trusting the watch's version.
    pub watch_version_gap_limit: i64,

    /// Target byte size of one range-stream fragment.
    pub range_stream_fragment_size: i64,
    /// Fragments allowed to buffer ahead of the consumer.
    pub range_stream_buffered_fragments_limit: usize,
    /// Key-value chunks one fragment may hold before its reader blocks.
    pub range_stream_fragment_buffer_chunks: usize,

    pub max_tags_per_transaction: usize,
    pub max_transaction_tag_length: usize,

    /// Negotiated API version; gates atomic-op semantics upgrades and the
    /// versionstamp offset trailer.
    pub api_version: u32,
}

impl Default for ClientKnobs {
    fn default() -> Self {
        Self {
            max_batch_size: 20,
            grv_batch_timeout: Duration::from_millis(5),
            broadcast_batch_size: 20,

            wrong_shard_server_delay: Duration::from_millis(10),
            future_version_retry_delay: Duration::from_millis(10),

            location_cache_size: 300_000,
            location_cache_evictions_per_insert: 100,
            get_range_shard_limit: 2,
            too_many: 1_000_000,
            reply_byte_limit: 80_000,

            key_size_limit: 10_000,
            system_key_size_limit: 30_000,
            value_size_limit: 100_000,
            transaction_size_limit: 10_000_000,
            transaction_size_limit_max: 10_000_000,

            default_backoff: Duration::from_millis(10),
            backoff_growth_rate: 2.0,
            default_max_backoff: Duration::from_secs(1),
            resource_constrained_max_backoff: Duration::from_secs(30),
            default_retry_limit: None,

            load_balance_tss_timeout: Duration::from_secs(5),
            tss_mismatch_retry_limit: 10,
            quarantine_tss_on_mismatch: true,

            metadata_version_cache_size: 1000,

            max_watches: 10_000,
            watch_version_gap_limit: 50_000_000,

            range_stream_fragment_size: 1 << 20,
            range_stream_buffered_fragments_limit: 20,
            range_stream_fragment_buffer_chunks: 4,

            max_tags_per_transaction: 5,
            max_transaction_tag_length: 16,

            api_version: 710,
        }
    }
}

impl ClientKnobs {
    /// Size limit applied to `key`, which depends on whether it lives in
    /// the system key space.
    pub fn key_size_limit_for(&self, key: &[u8]) -> usize {
        if key.first() == Some(&0xff) {
            self.system_key_size_limit
        } else {
            self.key_size_limit
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_keys_get_the_larger_limit() {
        let knobs = ClientKnobs::default();
        assert_eq!(knobs.key_size_limit_for(b"user/key"), knobs.key_size_limit);
        assert_eq!(
            knobs.key_size_limit_for(b"\xff/metadataVersion"),
            knobs.system_key_size_limit
        );
    }
}
