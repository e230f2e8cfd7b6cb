//! Client-side operation counters and latency accounting.
//!
//! All counters are lock-free atomics so read/commit hot paths never take a
//! lock to record a sample. Latency histograms use fixed microsecond
//! buckets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries for latency metrics (microseconds).
const LATENCY_BUCKETS_US: [u64; 12] = [
    100,     // 0.1ms
    250,     // 0.25ms
    500,     // 0.5ms
    1_000,   // 1ms
    2_000,   // 2ms
    5_000,   // 5ms
    10_000,  // 10ms
    20_000,  // 20ms
    50_000,  // 50ms
    100_000, // 100ms
    200_000, // 200ms
    500_000, // 500ms
];

/// Fixed-bucket latency histogram.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; 13],
    count: AtomicU64,
    total_us: AtomicU64,
}

impl LatencyHistogram {
    pub fn record(&self, latency: Duration) {
        let us = latency.as_micros() as u64;
        let idx = LATENCY_BUCKETS_US
            .iter()
            .position(|&b| us <= b)
            .unwrap_or(LATENCY_BUCKETS_US.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> Duration {
        let count = self.count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_us.load(Ordering::Relaxed) / count)
    }
}

/// Counters surfaced through the database context's health readers.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub reads: AtomicU64,
    pub physical_reads: AtomicU64,
    pub keys_read: AtomicU64,
    pub bytes_read: AtomicU64,

    pub grv_batches: AtomicU64,
    pub grv_full_batches: AtomicU64,
    pub grv_timed_out_batches: AtomicU64,
    pub read_versions_obtained: AtomicU64,

    pub commits_started: AtomicU64,
    pub commits_completed: AtomicU64,
    pub committed_mutations: AtomicU64,
    pub committed_mutation_bytes: AtomicU64,
    pub commits_maybe_delivered: AtomicU64,

    pub conflicts: AtomicU64,
    pub errors_too_old: AtomicU64,
    pub errors_future_version: AtomicU64,
    pub errors_resource_constrained: AtomicU64,
    pub errors_process_behind: AtomicU64,
    pub errors_throttled: AtomicU64,

    pub watches_started: AtomicU64,
    pub watches_fired: AtomicU64,

    pub shadow_reads: AtomicU64,
    pub shadow_mismatches: AtomicU64,
    pub shadow_timeouts: AtomicU64,
    pub shadow_errors: AtomicU64,

    pub location_cache_hits: AtomicU64,
    pub location_cache_misses: AtomicU64,

    pub grv_latency: LatencyHistogram,
    pub read_latency: LatencyHistogram,
    pub commit_latency: LatencyHistogram,
}

impl ClientMetrics {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
