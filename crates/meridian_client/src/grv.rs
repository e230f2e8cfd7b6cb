//! Read-version batching.
//!
//! One batcher task runs per `(priority, flags)` class. It collects
//! waiting transactions until the batch fills or a dynamic timeout fires,
//! then issues a single `GetReadVersion` RPC whose reply is fanned out to
//! every waiter in bounded slices. The timeout tracks half the observed
//! reply latency through a low-pass filter, which keeps end-to-end GRV
//! latency within a small factor of server latency at any load.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use meridian_rpc::error::{Error, Result};
use meridian_rpc::messages::{DebugId, GetReadVersionReply, GetReadVersionRequest, GrvFlags, SpanId};
use meridian_rpc::types::{Priority, Tag};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::database::DatabaseInner;
use crate::load_balance::basic_load_balance;
use crate::metrics::ClientMetrics;

/// Submission side of one batcher task.
pub(crate) type BatcherHandle = mpsc::UnboundedSender<VersionRequest>;

/// One transaction waiting for a read version.
pub(crate) struct VersionRequest {
    pub span: SpanId,
    pub tags: Vec<Tag>,
    pub debug_id: Option<DebugId>,
    pub reply: oneshot::Sender<Result<GetReadVersionReply>>,
}

/// Queue a version request onto the batcher for its class, starting the
/// batcher task on first use.
pub(crate) fn submit(
    db: &Arc<DatabaseInner>,
    priority: Priority,
    flags: GrvFlags,
    request: VersionRequest,
) {
    let tx = {
        let mut batchers = db.grv_batchers.lock().unwrap();
        batchers
            .entry((priority, flags))
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let weak = Arc::downgrade(db);
                let handle = tokio::spawn(read_version_batcher(weak, rx, priority, flags));
                db.register_background_task(handle);
                tx
            })
            .clone()
    };
    if let Err(mpsc::error::SendError(request)) = tx.send(request) {
        let _ = request.reply.send(Err(Error::OperationCancelled));
    }
}

/// Collect requests into batches and dispatch them.
///
/// The task holds only a weak context reference; it upgrades per batch and
/// releases across suspension so the context can be dropped while idle.
async fn read_version_batcher(
    db: Weak<DatabaseInner>,
    mut rx: mpsc::UnboundedReceiver<VersionRequest>,
    priority: Priority,
    flags: GrvFlags,
) {
    let (latency_tx, mut latency_rx) = mpsc::unbounded_channel::<Duration>();
    let mut requests: Vec<VersionRequest> = Vec::new();
    let mut tags: HashMap<Tag, u32> = HashMap::new();
    let mut batch_time = Duration::ZERO;
    let mut deadline: Option<Instant> = None;

    loop {
        let (max_batch, batch_timeout) = match db.upgrade() {
            Some(db) => (db.knobs.max_batch_size, db.knobs.grv_batch_timeout),
            None => return,
        };

        let mut send_batch = false;
        tokio::select! {
            // Drain every request already queued before letting the batch
            // window close.
            biased;
            request = rx.recv() => {
                let Some(request) = request else { return };
                for tag in &request.tags {
                    *tags.entry(tag.clone()).or_insert(0) += 1;
                }
                requests.push(request);
                if requests.len() >= max_batch {
                    send_batch = true;
                    if let Some(db) = db.upgrade() {
                        ClientMetrics::bump(&db.metrics.grv_full_batches);
                    }
                } else if deadline.is_none() {
                    deadline = Some(Instant::now() + batch_time);
                }
            }
            _ = async { tokio::time::sleep_until(deadline.unwrap()).await }, if deadline.is_some() => {
                send_batch = true;
                if let Some(db) = db.upgrade() {
                    ClientMetrics::bump(&db.metrics.grv_timed_out_batches);
                }
            }
            reply_latency = latency_rx.recv() => {
                if let Some(reply_latency) = reply_latency {
                    let target = reply_latency.mul_f64(0.5);
                    batch_time = (target.mul_f64(0.1) + batch_time.mul_f64(0.9)).min(batch_timeout);
                }
            }
        }

        if send_batch && !requests.is_empty() {
            let Some(db) = db.upgrade() else { return };
            ClientMetrics::bump(&db.metrics.grv_batches);
            let batch = std::mem::take(&mut requests);
            let batch_tags = std::mem::take(&mut tags);
            deadline = None;
            tokio::spawn(dispatch_batch(
                db,
                batch,
                batch_tags,
                priority,
                flags,
                latency_tx.clone(),
            ));
        }
    }
}

/// Send one `GetReadVersion` RPC for a closed batch and broadcast the
/// reply, waking waiters in slices to avoid a thundering herd.
async fn dispatch_batch(
    db: Arc<DatabaseInner>,
    requests: Vec<VersionRequest>,
    tags: HashMap<Tag, u32>,
    priority: Priority,
    flags: GrvFlags,
    latency_tx: mpsc::UnboundedSender<Duration>,
) {
    let started = Instant::now();
    let result = get_consistent_read_version(&db, requests.len(), priority, flags, &tags).await;
    let elapsed = started.elapsed();
    let _ = latency_tx.send(elapsed);
    db.metrics.grv_latency.record(elapsed);

    if let Ok(reply) = &result {
        db.throttles
            .ingest(priority, tags.keys().cloned(), &reply.tag_throttle_info);
        db.observe_grv_reply(reply);
        ClientMetrics::add(&db.metrics.read_versions_obtained, requests.len() as u64);
    }

    let broadcast_batch_size = db.knobs.broadcast_batch_size.max(1);
    for (i, request) in requests.into_iter().enumerate() {
        if i > 0 && i % broadcast_batch_size == 0 {
            tokio::task::yield_now().await;
        }
        let _ = request.reply.send(result.clone());
    }
}

/// One round against the current GRV proxy set. Waits out proxy-set churn:
/// if the membership feed changes mid-flight the RPC is abandoned and
/// retried against the new set.
async fn get_consistent_read_version(
    db: &Arc<DatabaseInner>,
    count: usize,
    priority: Priority,
    flags: GrvFlags,
    tags: &HashMap<Tag, u32>,
) -> Result<GetReadVersionReply> {
    let mut info_rx = db.cluster.client_info();
    loop {
        let proxies = info_rx.borrow_and_update().grv_proxies.clone();
        if proxies.is_empty() {
            debug!("no grv proxies known; waiting for membership");
            if info_rx.changed().await.is_err() {
                return Err(Error::OperationCancelled);
            }
            continue;
        }

        let req = GetReadVersionRequest {
            span: 0,
            count,
            priority: Some(priority),
            flags,
            tags: tags.clone(),
            debug_id: None,
        };
        let cluster = db.cluster.clone();
        let attempt = basic_load_balance(&proxies, |proxy| {
            let req = req.clone();
            let cluster = cluster.clone();
            async move { cluster.get_read_version(proxy, req).await }
        });

        tokio::select! {
            changed = info_rx.changed() => {
                if changed.is_err() {
                    return Err(Error::OperationCancelled);
                }
                // Proxy set changed under us; retry against the new set.
                continue;
            }
            result = attempt => {
                match result {
                    Ok(reply) => return Ok(reply),
                    Err(Error::AllAlternativesFailed) => {
                        warn!("all grv proxies unreachable; waiting for membership change");
                        if info_rx.changed().await.is_err() {
                            return Err(Error::OperationCancelled);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
