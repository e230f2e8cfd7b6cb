//! Shadow-server ("TSS") verification.
//!
//! A storage server may be paired with a separately provisioned shadow.
//! The load balancer duplicates successful data reads to the shadow and
//! compares replies under a hard deadline; divergences are queued for the
//! mismatch handler, which persists a quarantine (or tag-removal) decision
//! through a system-keys transaction and drops the pairing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use meridian_rpc::error::RetryClass;
use meridian_rpc::interface::{ServerId, StorageServerInterface};
use meridian_rpc::transport::StorageRequest;
use meridian_rpc::types::{prefixed_key, SERVER_TAG_PREFIX, TSS_MISMATCH_PREFIX, TSS_QUARANTINE_PREFIX};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::database::{Database, DatabaseInner};
use crate::metrics::ClientMetrics;

/// One detected divergence between a primary and its shadow.
#[derive(Debug, Clone)]
pub struct MismatchRecord {
    pub uid: u64,
    pub timestamp_ms: u64,
    pub detail: String,
}

/// Event delivered to the mismatch handler.
#[derive(Debug, Clone)]
pub struct MismatchEvent {
    pub shadow_id: ServerId,
    pub records: Vec<MismatchRecord>,
}

/// Pairing table: primary server id -> shadow interface.
#[derive(Default)]
pub(crate) struct TssRegistry {
    pairings: RwLock<HashMap<ServerId, Arc<StorageServerInterface>>>,
}

impl TssRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pair_for(&self, primary: ServerId) -> Option<Arc<StorageServerInterface>> {
        self.pairings.read().unwrap().get(&primary).cloned()
    }

    pub fn install(&self, primary: ServerId, shadow: Arc<StorageServerInterface>) {
        self.pairings.write().unwrap().insert(primary, shadow);
    }

    /// Drop the pairing for the primary paired with `shadow_id`, returning
    /// the primary's id if one was found.
    pub fn remove_by_shadow(&self, shadow_id: ServerId) -> Option<ServerId> {
        let mut pairings = self.pairings.write().unwrap();
        let primary = pairings
            .iter()
            .find(|(_, shadow)| shadow.id == shadow_id)
            .map(|(primary, _)| *primary)?;
        pairings.remove(&primary);
        Some(primary)
    }

    pub fn len(&self) -> usize {
        self.pairings.read().unwrap().len()
    }
}

/// Duplicate a successful read to the paired shadow, if any, and queue a
/// mismatch when the replies diverge. Never blocks or fails the caller.
pub(crate) fn maybe_duplicate<R: StorageRequest>(
    db: &Arc<DatabaseInner>,
    server: &StorageServerInterface,
    req: &R,
    reply: &R::Reply,
) {
    let Some(shadow) = db.tss.pair_for(server.id) else {
        return;
    };
    ClientMetrics::bump(&db.metrics.shadow_reads);

    let weak = Arc::downgrade(db);
    let req = req.clone();
    let reply = reply.clone();
    tokio::spawn(async move {
        let Some(db) = weak.upgrade() else { return };
        let deadline = db.knobs.load_balance_tss_timeout;
        let shadow_reply =
            tokio::time::timeout(deadline, R::send(db.storage.as_ref(), &shadow, req.clone()))
                .await;
        match shadow_reply {
            // Expiry is counted, not an error to anyone.
            Err(_) => ClientMetrics::bump(&db.metrics.shadow_timeouts),
            Ok(Err(e)) => {
                debug!(shadow = shadow.id, error = %e, "shadow read failed");
                ClientMetrics::bump(&db.metrics.shadow_errors);
            }
            Ok(Ok(shadow_reply)) => {
                if let Some(detail) = R::shadow_mismatch(&req, &reply, &shadow_reply) {
                    ClientMetrics::bump(&db.metrics.shadow_mismatches);
                    let record = MismatchRecord {
                        uid: rand::thread_rng().gen(),
                        timestamp_ms: unix_millis(),
                        detail,
                    };
                    let _ = db.tss_mismatch_tx.send(MismatchEvent {
                        shadow_id: shadow.id,
                        records: vec![record],
                    });
                }
            }
        }
    });
}

/// Drain the mismatch channel and act on each event.
///
/// Holds only a weak context reference; upgrades per event and releases
/// across the channel wait so the context can be dropped while idle.
pub(crate) async fn mismatch_handler(
    db: Weak<DatabaseInner>,
    mut rx: mpsc::UnboundedReceiver<MismatchEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(db) = db.upgrade() else { return };
        warn!(
            shadow = event.shadow_id,
            mismatches = event.records.len(),
            "shadow server mismatch detected"
        );
        if let Err(e) = handle_mismatch(&db, &event).await {
            warn!(shadow = event.shadow_id, error = %e, "giving up on mismatch persistence");
        }
        // The pairing is dead either way; stop duplicating to this shadow.
        db.tss.remove_by_shadow(event.shadow_id);
    }
}

/// Persist one mismatch decision: quarantine marker (or server-tag
/// removal) plus one record per divergence, retried a bounded number of
/// times on retriable errors.
async fn handle_mismatch(db: &Arc<DatabaseInner>, event: &MismatchEvent) -> anyhow::Result<()> {
    let database = Database::from_inner(db.clone());
    let mut tr = database.create_transaction();
    tr.set_option(crate::options::TransactionOption::AccessSystemKeys)?;
    tr.set_option(crate::options::TransactionOption::LockAware)?;

    let shadow_suffix = event.shadow_id.to_string();
    let mut attempts = 0u32;
    loop {
        let outcome = async {
            if db.knobs.quarantine_tss_on_mismatch {
                tr.set(
                    prefixed_key(TSS_QUARANTINE_PREFIX, shadow_suffix.as_bytes()),
                    Bytes::from_static(b"1"),
                )?;
            } else {
                tr.clear(prefixed_key(SERVER_TAG_PREFIX, shadow_suffix.as_bytes()))?;
            }
            for record in &event.records {
                let suffix = format!(
                    "{}/{}/{:016x}",
                    event.shadow_id, record.timestamp_ms, record.uid
                );
                tr.set(
                    prefixed_key(TSS_MISMATCH_PREFIX, suffix.as_bytes()),
                    Bytes::copy_from_slice(record.detail.as_bytes()),
                )?;
            }
            tr.commit().await
        }
        .await;

        match outcome {
            Ok(_) => return Ok(()),
            Err(e) if e.retry_class() != RetryClass::Fatal => {
                attempts += 1;
                if attempts >= db.knobs.tss_mismatch_retry_limit {
                    anyhow::bail!("persisting mismatch failed after {attempts} attempts: {e}");
                }
                tr.on_error(e).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
