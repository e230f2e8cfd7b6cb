//! Shard-statistics reads: size estimates, metric waits, split points, and
//! read-hot ranges.
//!
//! These iterate the shards covering a range, query each replica set, and
//! combine the answers. Stale shard mappings are retried after cache
//! invalidation; no finer multi-shard heuristic is applied.

use std::sync::Arc;

use meridian_rpc::error::{Error, Result};
use meridian_rpc::messages::{
    GetRangeSplitPointsRequest, ReadHotRange, ReadHotRangesRequest, SplitMetricsRequest,
    StorageMetrics, WaitMetricsRequest,
};
use meridian_rpc::types::{Key, KeyRange};

use crate::database::{Database, DatabaseInner};
use crate::load_balance::load_balance;

impl Database {
    /// Aggregate storage metrics over `keys`.
    pub async fn wait_storage_metrics(&self, keys: KeyRange) -> Result<StorageMetrics> {
        wait_metrics_internal(&self.inner, keys).await
    }

    /// Estimated byte size of `keys`.
    pub async fn get_estimated_range_size_bytes(&self, keys: KeyRange) -> Result<i64> {
        let metrics = wait_metrics_internal(&self.inner, keys).await?;
        Ok(metrics.bytes)
    }

    /// Split `keys` into chunks of roughly `chunk_size` bytes. The result
    /// brackets the range: it begins with `keys.begin` and ends with
    /// `keys.end`.
    pub async fn get_range_split_points(
        &self,
        keys: KeyRange,
        chunk_size: i64,
    ) -> Result<Vec<Key>> {
        range_split_points(&self.inner, &keys, chunk_size, 0).await
    }

    /// Split `keys` so each piece carries at most `limit` worth of metrics.
    pub async fn split_storage_metrics(
        &self,
        keys: KeyRange,
        limit: StorageMetrics,
        estimated: StorageMetrics,
    ) -> Result<Vec<Key>> {
        let db = &self.inner;
        loop {
            let locations = db
                .get_key_range_locations(&keys, db.knobs.too_many, false)
                .await?;
            let mut used = StorageMetrics::default();
            let mut results: Vec<Key> = vec![keys.begin.clone()];

            let attempt = async {
                for (i, (shard_range, location)) in locations.iter().enumerate() {
                    let req = SplitMetricsRequest {
                        span: 0,
                        keys: shard_range
                            .intersection(&keys)
                            .unwrap_or_else(|| shard_range.clone()),
                        limits: limit,
                        used,
                        is_last_shard: i == locations.len() - 1,
                    };
                    let reply = load_balance(db, location, req).await?;
                    for split in reply.splits {
                        if results.last().map(|l| &split > l).unwrap_or(true) {
                            results.push(split);
                        }
                    }
                    used = reply.used;
                }
                Ok::<(), Error>(())
            }
            .await;

            match attempt {
                Ok(()) => {
                    if results.last() != Some(&keys.end) {
                        results.push(keys.end.clone());
                    }
                    let _ = estimated;
                    return Ok(results);
                }
                Err(e) if matches!(e, Error::WrongShardServer | Error::AllAlternativesFailed) => {
                    db.invalidate_cached_range(&keys);
                    tokio::time::sleep(db.knobs.wrong_shard_server_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ranges with disproportionate read traffic inside `keys`.
    pub async fn get_read_hot_ranges(&self, keys: KeyRange) -> Result<Vec<ReadHotRange>> {
        let db = &self.inner;
        loop {
            let locations = db
                .get_key_range_locations(&keys, db.knobs.too_many, false)
                .await?;
            let attempt = async {
                let mut out = Vec::new();
                for (shard_range, location) in &locations {
                    let req = ReadHotRangesRequest {
                        span: 0,
                        keys: shard_range
                            .intersection(&keys)
                            .unwrap_or_else(|| shard_range.clone()),
                    };
                    let reply = load_balance(db, location, req).await?;
                    out.extend(reply.ranges);
                }
                Ok::<_, Error>(out)
            }
            .await;
            match attempt {
                Ok(out) => return Ok(out),
                Err(e) if matches!(e, Error::WrongShardServer | Error::AllAlternativesFailed) => {
                    db.invalidate_cached_range(&keys);
                    tokio::time::sleep(db.knobs.wrong_shard_server_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn wait_metrics_internal(db: &Arc<DatabaseInner>, keys: KeyRange) -> Result<StorageMetrics> {
    loop {
        let locations = db
            .get_key_range_locations(&keys, db.knobs.too_many, false)
            .await?;
        let attempt = async {
            let mut total = StorageMetrics::default();
            for (shard_range, location) in &locations {
                let req = WaitMetricsRequest {
                    span: 0,
                    keys: shard_range
                        .intersection(&keys)
                        .unwrap_or_else(|| shard_range.clone()),
                    min: StorageMetrics::default(),
                    max: StorageMetrics {
                        bytes: i64::MAX,
                        bytes_per_second: f64::MAX,
                    },
                };
                let m = load_balance(db, location, req).await?;
                total = total.add(&m);
            }
            Ok::<_, Error>(total)
        }
        .await;
        match attempt {
            Ok(total) => return Ok(total),
            Err(e) if matches!(e, Error::WrongShardServer | Error::AllAlternativesFailed) => {
                db.invalidate_cached_range(&keys);
                tokio::time::sleep(db.knobs.wrong_shard_server_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Shard-by-shard split-point collection, shared with the range stream.
pub(crate) async fn range_split_points(
    db: &Arc<DatabaseInner>,
    keys: &KeyRange,
    chunk_size: i64,
    span: meridian_rpc::messages::SpanId,
) -> Result<Vec<Key>> {
    loop {
        let locations = db
            .get_key_range_locations(keys, db.knobs.too_many, false)
            .await?;
        let attempt = async {
            let mut points: Vec<Key> = vec![keys.begin.clone()];
            for (shard_range, location) in &locations {
                let clipped = shard_range
                    .intersection(keys)
                    .unwrap_or_else(|| shard_range.clone());
                let req = GetRangeSplitPointsRequest {
                    span,
                    keys: clipped,
                    chunk_size,
                };
                let reply = load_balance(db, location, req).await?;
                for point in reply.points {
                    if points.last().map(|l| &point > l).unwrap_or(true) && point < keys.end {
                        points.push(point);
                    }
                }
            }
            points.push(keys.end.clone());
            Ok::<_, Error>(points)
        }
        .await;
        match attempt {
            Ok(points) => return Ok(points),
            Err(e) if matches!(e, Error::WrongShardServer | Error::AllAlternativesFailed) => {
                db.invalidate_cached_range(keys);
                tokio::time::sleep(db.knobs.wrong_shard_server_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
