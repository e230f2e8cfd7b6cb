//! Parallel streaming range scanner.
//!
//! The range is fragmented along cluster-provided split points (~1 MB
//! each); one streaming read runs per fragment, several fragments ahead of
//! the consumer, bounded by a fragment window and per-fragment chunk
//! buffers. The orchestrator forwards fragments strictly in order, so the
//! consumer sees globally ordered key-value pairs while later fragments
//! prefetch. Backpressure is end-to-end: a full consumer stalls fragment
//! readers through their bounded buffers.

use std::collections::VecDeque;
use std::sync::Arc;

use meridian_rpc::error::{Error, Result};
use meridian_rpc::messages::{GetKeyValuesRequest, SpanId};
use meridian_rpc::types::{key_after, KeyRange, KeySelector, KeyValue, Tag, Version};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::database::DatabaseInner;
use crate::metrics::ClientMetrics;
use crate::transaction::SharedVersion;
use crate::tss;

/// Consumer handle for a streaming scan. Batches arrive in global key
/// order; the stream ends with `None` or a terminal error item.
pub struct RangeStream {
    rx: mpsc::Receiver<Result<Vec<KeyValue>>>,
    orchestrator: JoinHandle<()>,
}

impl RangeStream {
    /// Next batch of ordered key-value pairs.
    pub async fn next_batch(&mut self) -> Option<Result<Vec<KeyValue>>> {
        self.rx.recv().await
    }

    /// Drain the stream into one vector.
    pub async fn collect_all(mut self) -> Result<Vec<KeyValue>> {
        let mut out = Vec::new();
        while let Some(batch) = self.next_batch().await {
            out.extend(batch?);
        }
        Ok(out)
    }
}

impl Drop for RangeStream {
    fn drop(&mut self) {
        self.orchestrator.abort();
    }
}

pub(crate) fn spawn_range_stream(
    db: Arc<DatabaseInner>,
    version: SharedVersion,
    range: KeyRange,
    span: SpanId,
    tags: Vec<Tag>,
) -> RangeStream {
    let (out_tx, out_rx) = mpsc::channel(db.knobs.range_stream_fragment_buffer_chunks.max(1));
    let orchestrator = tokio::spawn(orchestrate(db, version, range, span, tags, out_tx));
    RangeStream {
        rx: out_rx,
        orchestrator,
    }
}

struct Fragment {
    rx: mpsc::Receiver<Result<Vec<KeyValue>>>,
    task: JoinHandle<()>,
}

async fn orchestrate(
    db: Arc<DatabaseInner>,
    version: SharedVersion,
    range: KeyRange,
    span: SpanId,
    tags: Vec<Tag>,
    out_tx: mpsc::Sender<Result<Vec<KeyValue>>>,
) {
    let version = match version.await {
        Ok(v) => v,
        Err(e) => {
            let _ = out_tx.send(Err(e)).await;
            return;
        }
    };
    if range.is_empty() {
        return;
    }

    let points = match crate::shard_metrics::range_split_points(
        &db,
        &range,
        db.knobs.range_stream_fragment_size,
        span,
    )
    .await
    {
        Ok(points) => points,
        Err(e) => {
            let _ = out_tx.send(Err(e)).await;
            return;
        }
    };

    let mut pending: VecDeque<KeyRange> = points
        .windows(2)
        .map(|w| KeyRange::new(w[0].clone(), w[1].clone()))
        .filter(|r| !r.is_empty())
        .collect();
    let window = db.knobs.range_stream_buffered_fragments_limit.max(1);
    let mut running: VecDeque<Fragment> = VecDeque::new();

    loop {
        while running.len() < window {
            let Some(subrange) = pending.pop_front() else { break };
            let (tx, rx) = mpsc::channel(db.knobs.range_stream_fragment_buffer_chunks.max(1));
            let task = tokio::spawn(read_fragment(
                db.clone(),
                version,
                subrange,
                span,
                tags.clone(),
                tx,
            ));
            running.push_back(Fragment { rx, task });
        }

        let Some(mut fragment) = running.pop_front() else { return };
        while let Some(batch) = fragment.rx.recv().await {
            let failed = batch.is_err();
            if out_tx.send(batch).await.is_err() || failed {
                // Consumer went away or the scan hit a terminal error:
                // stop everything.
                fragment.task.abort();
                for f in running.drain(..) {
                    f.task.abort();
                }
                return;
            }
        }
    }
}

/// Stream one fragment. Restartable: a stale shard mapping re-resolves
/// locations and resumes after the last delivered key.
async fn read_fragment(
    db: Arc<DatabaseInner>,
    version: Version,
    subrange: KeyRange,
    span: SpanId,
    tags: Vec<Tag>,
    tx: mpsc::Sender<Result<Vec<KeyValue>>>,
) {
    let mut begin = subrange.begin.clone();

    'fragment: while begin < subrange.end {
        let (shard, location) = match db.get_key_location(&begin, false).await {
            Ok(found) => found,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        let segment_end = shard.end.clone().min(subrange.end.clone());
        let req = GetKeyValuesRequest {
            span,
            begin: KeySelector::first_greater_or_equal(begin.clone()),
            end: KeySelector::first_greater_or_equal(segment_end.clone()),
            version,
            limit: i64::MAX,
            limit_bytes: db.knobs.reply_byte_limit,
            tags: tags.clone(),
            debug_id: None,
        };

        // Streaming reads pick a replica the same way unary reads do, but
        // hold the stream open for the whole segment.
        let mut candidates: Vec<usize> = (0..location.servers.len()).collect();
        candidates.sort_by_key(|&i| {
            let endpoint = location.servers[i].get_key_values_stream;
            (
                db.failure_monitor.is_failed(endpoint),
                db.queue_model.depth(endpoint),
            )
        });

        let mut opened = None;
        for i in candidates {
            let server = &location.servers[i];
            match db.storage.get_key_values_stream(server, req.clone()).await {
                Ok(stream) => {
                    opened = Some((stream, server.clone()));
                    break;
                }
                Err(e) if e.rotates_replica() => {
                    db.failure_monitor
                        .set_failed(server.get_key_values_stream);
                }
                Err(e) if shard_retryable(e) => {
                    db.invalidate_cached_range(&KeyRange::new(
                        begin.clone(),
                        subrange.end.clone(),
                    ));
                    tokio::time::sleep(db.knobs.wrong_shard_server_delay).await;
                    continue 'fragment;
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
        let Some((mut stream, server)) = opened else {
            db.invalidate_cached_range(&KeyRange::new(begin.clone(), subrange.end.clone()));
            tokio::time::sleep(db.knobs.wrong_shard_server_delay).await;
            continue 'fragment;
        };

        // Shadow verification needs the segment's data; only collect it
        // when a pairing exists.
        let shadow = db.tss.pair_for(server.id);
        let mut segment_data: Vec<KeyValue> = Vec::new();

        let mut segment_failed = false;
        while let Some(chunk) = stream.recv().await {
            match chunk {
                Ok(chunk) => {
                    if let Some(last) = chunk.data.last() {
                        begin = key_after(&last.key);
                    }
                    if shadow.is_some() {
                        segment_data.extend(chunk.data.iter().cloned());
                    }
                    ClientMetrics::add(&db.metrics.keys_read, chunk.data.len() as u64);
                    if !chunk.data.is_empty() && tx.send(Ok(chunk.data)).await.is_err() {
                        return;
                    }
                    if !chunk.more {
                        begin = segment_end.clone();
                        break;
                    }
                }
                Err(e) if shard_retryable(e) || e.rotates_replica() => {
                    debug!(error = %e, "fragment stream interrupted; re-resolving");
                    db.invalidate_cached_range(&KeyRange::new(
                        begin.clone(),
                        subrange.end.clone(),
                    ));
                    tokio::time::sleep(db.knobs.wrong_shard_server_delay).await;
                    segment_failed = true;
                    break;
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }

        if !segment_failed {
            if let Some(shadow) = shadow {
                verify_segment_against_shadow(
                    &db,
                    shadow,
                    req,
                    segment_data,
                );
            }
        }
    }
}

fn shard_retryable(e: Error) -> bool {
    matches!(
        e,
        Error::WrongShardServer | Error::AllAlternativesFailed | Error::ConnectionFailed
    )
}

/// Replay a completed segment against the paired shadow and compare the
/// flattened results. Runs detached under the shadow deadline; expiry is
/// counted, never surfaced.
fn verify_segment_against_shadow(
    db: &Arc<DatabaseInner>,
    shadow: Arc<meridian_rpc::interface::StorageServerInterface>,
    req: GetKeyValuesRequest,
    primary_data: Vec<KeyValue>,
) {
    ClientMetrics::bump(&db.metrics.shadow_reads);
    let weak = Arc::downgrade(db);
    tokio::spawn(async move {
        let Some(db) = weak.upgrade() else { return };
        let deadline = db.knobs.load_balance_tss_timeout;
        let outcome = tokio::time::timeout(deadline, async {
            let mut stream = db.storage.get_key_values_stream(&shadow, req.clone()).await?;
            let mut data = Vec::new();
            while let Some(chunk) = stream.recv().await {
                let chunk = chunk?;
                data.extend(chunk.data);
                if !chunk.more {
                    break;
                }
            }
            Ok::<_, Error>(data)
        })
        .await;
        match outcome {
            Err(_) => ClientMetrics::bump(&db.metrics.shadow_timeouts),
            Ok(Err(_)) => ClientMetrics::bump(&db.metrics.shadow_errors),
            Ok(Ok(shadow_data)) => {
                if shadow_data != primary_data {
                    ClientMetrics::bump(&db.metrics.shadow_mismatches);
                    let record = tss::MismatchRecord {
                        uid: rand::random(),
                        timestamp_ms: std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .map(|d| d.as_millis() as u64)
                            .unwrap_or(0),
                        detail: format!(
                            "get_key_values_stream begin={:?} end={:?} version={} primary_rows={} shadow_rows={}",
                            req.begin,
                            req.end,
                            req.version,
                            primary_data.len(),
                            shadow_data.len()
                        ),
                    };
                    let _ = db.tss_mismatch_tx.send(tss::MismatchEvent {
                        shadow_id: shadow.id,
                        records: vec![record],
                    });
                }
            }
        }
    });
}
