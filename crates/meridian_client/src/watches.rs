//! Server-side watch management.
//!
//! One database context holds at most one live server-side watch per key;
//! additional watchers share it. Registration coalesces against the
//! existing entry by (value, version), the single-flight server loop
//! guards against ABA (a reply older than the entry), and every entry is
//! re-armed after a cluster-descriptor change.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use meridian_rpc::error::{Error, Result};
use meridian_rpc::messages::WatchValueRequest;
use meridian_rpc::types::{Key, Tag, Value, Version};
use tokio::sync::watch as watch_channel;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::database::{Database, DatabaseInner};
use crate::load_balance::load_balance;
use crate::metrics::ClientMetrics;

/// Terminal state of a watch entry.
type Outcome = Option<Result<Version>>;

pub(crate) struct WatchEntry {
    pub key: Key,
    state: Mutex<EntryState>,
    outcome_tx: watch_channel::Sender<Outcome>,
}

struct EntryState {
    value: Option<Value>,
    version: Version,
    holders: usize,
    tags: Vec<Tag>,
    server_task: Option<JoinHandle<()>>,
}

impl WatchEntry {
    fn snapshot(&self) -> (Option<Value>, Version, Vec<Tag>) {
        let state = self.state.lock().unwrap();
        (state.value.clone(), state.version, state.tags.clone())
    }

    fn fire(&self, version: Version) {
        let _ = self.outcome_tx.send(Some(Ok(version)));
    }

    fn fail(&self, error: Error) {
        let _ = self.outcome_tx.send(Some(Err(error)));
    }
}

#[derive(Default)]
pub(crate) struct WatchMap {
    entries: Mutex<HashMap<Key, Arc<WatchEntry>>>,
}

impl WatchMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn get(&self, key: &[u8]) -> Option<Arc<WatchEntry>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn remove(&self, key: &[u8]) {
        if let Some(entry) = self.entries.lock().unwrap().remove(key) {
            let state = entry.state.lock().unwrap();
            if let Some(task) = &state.server_task {
                task.abort();
            }
        }
    }
}

/// A caller's handle on a shared watch. Resolves when the watched key's
/// value changes past the watch version. Dropping the last holder of an
/// entry cancels the server-side watch.
pub struct Watch {
    db: Weak<DatabaseInner>,
    key: Key,
    outcome_rx: watch_channel::Receiver<Outcome>,
    /// Whether this handle counts toward the entry's holders.
    holds_entry: bool,
}

impl Watch {
    /// Wait for the watch to fire. Returns the version at which the value
    /// was observed changed.
    pub async fn changed(mut self) -> Result<Version> {
        loop {
            if let Some(outcome) = self.outcome_rx.borrow_and_update().clone() {
                return outcome;
            }
            if self.outcome_rx.changed().await.is_err() {
                return Err(Error::WatchCancelled);
            }
        }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        if !self.holds_entry {
            return;
        }
        let Some(db) = self.db.upgrade() else { return };
        let Some(entry) = db.watch_map.get(&self.key) else { return };
        let last = {
            let mut state = entry.state.lock().unwrap();
            state.holders = state.holders.saturating_sub(1);
            state.holders == 0
        };
        if last {
            db.watch_map.remove(&self.key);
        }
    }
}

/// Register interest in `key` changing away from `value` at or past
/// `version`. Coalesces with any existing entry for the key.
pub(crate) fn register(
    db: &Arc<DatabaseInner>,
    key: Key,
    value: Option<Value>,
    version: Version,
    tags: Vec<Tag>,
) -> Result<Watch> {
    let mut entries = db.watch_map.entries.lock().unwrap();

    if let Some(entry) = entries.get(&key).cloned() {
        let decision = {
            let mut state = entry.state.lock().unwrap();
            if state.value == value {
                // Same value: share the entry, keeping the newest version.
                if version > state.version {
                    state.version = version;
                    state.tags = tags.clone();
                }
                state.holders += 1;
                Coalesce::Share
            } else if version > state.version {
                Coalesce::Replace
            } else if version == state.version {
                Coalesce::Consult
            } else {
                // The caller's history is older than the entry's; their
                // value has already been superseded.
                Coalesce::FireImmediately
            }
        };
        match decision {
            Coalesce::Share => {
                return Ok(Watch {
                    db: Arc::downgrade(db),
                    key,
                    outcome_rx: entry.outcome_tx.subscribe(),
                    holds_entry: true,
                });
            }
            Coalesce::Replace => {
                // Newer observation with a different value: the old entry's
                // watchers have their answer already.
                entries.remove(&key);
                {
                    let state = entry.state.lock().unwrap();
                    if let Some(task) = &state.server_task {
                        task.abort();
                    }
                }
                entry.fire(version);
                let watch = install(db, &mut entries, key, value, version, tags)?;
                return Ok(watch);
            }
            Coalesce::Consult => {
                drop(entries);
                return consult_current_value(db, entry, key, value, version, tags);
            }
            Coalesce::FireImmediately => {
                let (outcome_tx, outcome_rx) = watch_channel::channel(Some(Ok(version)));
                drop(outcome_tx);
                return Ok(Watch {
                    db: Arc::downgrade(db),
                    key,
                    outcome_rx,
                    holds_entry: false,
                });
            }
        }
    }

    let watch = install(db, &mut entries, key, value, version, tags)?;
    Ok(watch)
}

enum Coalesce {
    Share,
    Replace,
    Consult,
    FireImmediately,
}

/// Install a fresh entry and start its server-side watch loop.
fn install(
    db: &Arc<DatabaseInner>,
    entries: &mut HashMap<Key, Arc<WatchEntry>>,
    key: Key,
    value: Option<Value>,
    version: Version,
    tags: Vec<Tag>,
) -> Result<Watch> {
    if entries.len() >= db.max_watches() {
        return Err(Error::TooManyWatches);
    }
    let (outcome_tx, outcome_rx) = watch_channel::channel(None);
    let entry = Arc::new(WatchEntry {
        key: key.clone(),
        state: Mutex::new(EntryState {
            value,
            version,
            holders: 1,
            tags,
            server_task: None,
        }),
        outcome_tx,
    });
    entries.insert(key.clone(), entry.clone());

    let task = tokio::spawn(watch_storage_server(Arc::downgrade(db), key.clone()));
    entry.state.lock().unwrap().server_task = Some(task);
    ClientMetrics::bump(&db.metrics.watches_started);

    Ok(Watch {
        db: Arc::downgrade(db),
        key,
        outcome_rx,
        holds_entry: true,
    })
}

/// Same version, different value: only the storage servers can arbitrate.
/// Read the current committed value and decide.
fn consult_current_value(
    db: &Arc<DatabaseInner>,
    entry: Arc<WatchEntry>,
    key: Key,
    value: Option<Value>,
    version: Version,
    tags: Vec<Tag>,
) -> Result<Watch> {
    // The read happens on the watcher's future, not at registration, so
    // registering stays synchronous for the caller.
    let (outcome_tx, outcome_rx) = watch_channel::channel(None);
    let weak = Arc::downgrade(db);
    let consult_key = key.clone();
    tokio::spawn(async move {
        let Some(db) = weak.upgrade() else {
            let _ = outcome_tx.send(Some(Err(Error::WatchCancelled)));
            return;
        };
        let current = read_current_value(&db, &consult_key).await;
        match current {
            Err(e) => {
                let _ = outcome_tx.send(Some(Err(e)));
            }
            Ok(current) => {
                let entry_value = entry.state.lock().unwrap().value.clone();
                if current != entry_value {
                    // The map entry lost the race: its watchers have fired.
                    db.watch_map.remove(&consult_key);
                    entry.fire(version);
                }
                if current == value {
                    // Our value is still current: install a fresh watch and
                    // forward its outcome.
                    let installed = {
                        let mut entries = db.watch_map.entries.lock().unwrap();
                        register_into(&db, &mut entries, consult_key.clone(), value, version, tags)
                    };
                    match installed {
                        Ok(mut rx) => {
                            loop {
                                if let Some(outcome) = rx.borrow_and_update().clone() {
                                    let _ = outcome_tx.send(Some(outcome));
                                    return;
                                }
                                if rx.changed().await.is_err() {
                                    let _ = outcome_tx.send(Some(Err(Error::WatchCancelled)));
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = outcome_tx.send(Some(Err(e)));
                        }
                    }
                } else {
                    // The value already differs from what the caller saw.
                    let _ = outcome_tx.send(Some(Ok(version)));
                }
            }
        }
    });
    Ok(Watch {
        db: Arc::downgrade(db),
        key,
        outcome_rx,
        holds_entry: false,
    })
}

/// Shared-entry subscription used by the consult path; the entry may or
/// may not exist already.
fn register_into(
    db: &Arc<DatabaseInner>,
    entries: &mut HashMap<Key, Arc<WatchEntry>>,
    key: Key,
    value: Option<Value>,
    version: Version,
    tags: Vec<Tag>,
) -> Result<watch_channel::Receiver<Outcome>> {
    if let Some(entry) = entries.get(&key) {
        let mut state = entry.state.lock().unwrap();
        state.holders += 1;
        if version > state.version {
            state.version = version;
        }
        return Ok(entry.outcome_tx.subscribe());
    }
    let mut watch = install(db, entries, key, value, version, tags)?;
    watch.holds_entry = false;
    Ok(watch.outcome_rx.clone())
}

/// Read the latest committed value of `key` outside any user transaction.
async fn read_current_value(db: &Arc<DatabaseInner>, key: &Key) -> Result<Option<Value>> {
    let database = Database::from_inner(db.clone());
    let mut tr = database.create_transaction();
    tr.set_option(crate::options::TransactionOption::ReadSystemKeys)?;
    tr.set_option(crate::options::TransactionOption::LockAware)?;
    loop {
        match tr.get(key.clone(), true).await {
            Ok(value) => return Ok(value),
            Err(e) => tr.on_error(e).await?,
        }
    }
}

/// Single-flight server-side watch loop for one entry.
///
/// Fires holders when the server reports a change at or past the entry's
/// version; ignores older replies (ABA) unless the entry has no other
/// holders, in which case the entry is dropped.
async fn watch_storage_server(db: Weak<DatabaseInner>, key: Key) {
    loop {
        let Some(db) = db.upgrade() else { return };
        let Some(entry) = db.watch_map.get(&key) else { return };
        let (value, version, tags) = entry.snapshot();

        let mut descriptor_changes = db.cluster_file.subscribe();
        let result = tokio::select! {
            r = watch_value_once(&db, &key, value, version, tags) => r,
            _ = descriptor_changes.recv() => {
                // Reconnected: re-arm from the lowest version the new
                // connection is known to serve.
                let floor = db.min_acceptable_read_version();
                let mut state = entry.state.lock().unwrap();
                if floor < state.version {
                    state.version = floor;
                }
                debug!(key = ?key, "re-arming watch after cluster descriptor change");
                drop(state);
                drop(db);
                continue;
            }
        };

        match result {
            Ok(fired_version) => {
                let Some(current) = db.watch_map.get(&key) else { return };
                let map_version = current.state.lock().unwrap().version;
                if fired_version >= map_version {
                    db.watch_map.remove(&key);
                    ClientMetrics::bump(&db.metrics.watches_fired);
                    current.fire(fired_version);
                    return;
                }
                // ABA: the server answered an older watch. Keep watching
                // unless nobody holds the entry anymore.
                let holders = current.state.lock().unwrap().holders;
                if holders == 0 {
                    db.watch_map.remove(&key);
                    return;
                }
            }
            Err(Error::FutureVersion) => {
                tokio::time::sleep(db.knobs.future_version_retry_delay).await;
            }
            Err(e) => {
                warn!(key = ?key, error = %e, "server watch failed");
                db.watch_map.remove(&key);
                entry.fail(e);
                return;
            }
        }
        drop(db);
    }
}

/// One `WatchValue` round trip, retrying shard-cache staleness in place.
///
/// A fired watch is only trusted after the cluster's committed version is
/// confirmed to be within `watch_version_gap_limit` of the reply; a larger
/// gap means the reply may predate a control-plane failover, so the watch
/// re-arms at the confirmed version instead.
async fn watch_value_once(
    db: &Arc<DatabaseInner>,
    key: &Key,
    value: Option<Value>,
    mut version: Version,
    tags: Vec<Tag>,
) -> Result<Version> {
    loop {
        let (_, location) = db.get_key_location(key, false).await?;
        let req = WatchValueRequest {
            span: 0,
            key: key.clone(),
            value: value.clone(),
            version,
            tags: tags.clone(),
            debug_id: None,
        };
        match load_balance(db, &location, req).await {
            Ok(reply) => {
                let confirmed = confirm_committed_version(db, reply.version).await?;
                if confirmed - reply.version < db.knobs.watch_version_gap_limit {
                    return Ok(reply.version);
                }
                version = confirmed;
            }
            Err(Error::WrongShardServer) | Err(Error::AllAlternativesFailed) => {
                db.invalidate_cached_key(key, false);
                tokio::time::sleep(db.knobs.wrong_shard_server_delay).await;
            }
            Err(Error::TimedOut) => {
                // Storage servers time watches out periodically; re-issue.
                tokio::time::sleep(db.knobs.future_version_retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wait until the cluster's committed version reaches `at_least`, via
/// immediate-priority read-version requests.
async fn confirm_committed_version(
    db: &Arc<DatabaseInner>,
    at_least: Version,
) -> Result<Version> {
    loop {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        crate::grv::submit(
            db,
            meridian_rpc::types::Priority::Immediate,
            meridian_rpc::messages::GrvFlags::CAUSAL_READ_RISKY,
            crate::grv::VersionRequest {
                span: 0,
                tags: Vec::new(),
                debug_id: None,
                reply: reply_tx,
            },
        );
        let reply = match reply_rx.await {
            Ok(reply) => reply?,
            Err(_) => return Err(Error::OperationCancelled),
        };
        if reply.version >= at_least {
            return Ok(reply.version);
        }
        tokio::time::sleep(db.knobs.future_version_retry_delay).await;
    }
}
