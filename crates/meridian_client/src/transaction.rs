//! The per-transaction state machine.
//!
//! A transaction buffers mutations and conflict ranges, reads at a single
//! read version obtained lazily from the GRV batcher, and commits through
//! a commit proxy. Retriable failures flow through [`Transaction::on_error`],
//! which decides reset-and-backoff versus propagate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use meridian_rpc::error::{Error, Result, RetryClass};
use meridian_rpc::messages::{
    CommitFlags, CommitRequest, CommitTransactionBody, GetKeyRequest, GetKeyValuesRequest,
    GetValueRequest, GrvFlags, SpanId,
};
use meridian_rpc::types::{
    all_keys_begin, all_keys_end, key_after, metadata_version_key, system_keys_begin, Key,
    KeyRange, KeySelector, Mutation, MutationType, RangeLimits, RangeResult, Value, Version,
    Versionstamp, INVALID_VERSION, LATEST_VERSION,
};
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::database::{Database, DatabaseInner};
use crate::grv::{self, VersionRequest};
use crate::load_balance::load_balance;
use crate::metrics::ClientMetrics;
use crate::options::{TransactionOption, TransactionOptions};
use crate::range_stream::RangeStream;
use crate::watches;

pub(crate) type SharedVersion = Shared<BoxFuture<'static, Result<Version>>>;

/// A watch registered on this transaction; its fate is decided at commit.
struct PendingWatch {
    key: Key,
    value: Option<Value>,
    arm_tx: oneshot::Sender<Result<watches::Watch>>,
}

/// Future returned by [`Transaction::watch`]. Pends until the transaction
/// commits (arming the watch) and then until the watched value changes.
pub struct TransactionWatch {
    arm_rx: oneshot::Receiver<Result<watches::Watch>>,
}

impl TransactionWatch {
    /// Wait for the watched key's value to change. Returns the version at
    /// which the change was observed.
    pub async fn changed(self) -> Result<Version> {
        let watch = match self.arm_rx.await {
            Ok(armed) => armed?,
            Err(_) => return Err(Error::WatchCancelled),
        };
        watch.changed().await
    }
}

/// Future returned by [`Transaction::get_versionstamp`].
pub struct VersionstampFuture {
    rx: oneshot::Receiver<Result<Versionstamp>>,
}

impl VersionstampFuture {
    pub async fn get(self) -> Result<Versionstamp> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::TransactionInvalidVersion),
        }
    }
}

pub struct Transaction {
    db: Database,
    pub(crate) options: TransactionOptions,
    span: SpanId,
    start_time: Instant,
    deadline: Option<Instant>,

    backoff: Duration,
    num_errors: u32,

    read_version: Option<SharedVersion>,
    committed_version: Version,
    cancelled: bool,

    body: CommitTransactionBody,
    extra_conflict_ranges: Vec<oneshot::Receiver<Option<(Key, Key)>>>,
    conflicting_ranges: Option<Vec<KeyRange>>,

    versionstamp_tx: Option<oneshot::Sender<Result<Versionstamp>>>,
    versionstamp_rx: Option<oneshot::Receiver<Result<Versionstamp>>>,
    pending_watches: Vec<PendingWatch>,
}

impl Transaction {
    pub(crate) fn new(db: Database) -> Self {
        let (versionstamp_tx, versionstamp_rx) = oneshot::channel();
        let backoff = db.inner.knobs.default_backoff;
        Self {
            db,
            options: TransactionOptions::default(),
            span: rand::thread_rng().gen(),
            start_time: Instant::now(),
            deadline: None,
            backoff,
            num_errors: 0,
            read_version: None,
            committed_version: INVALID_VERSION,
            cancelled: false,
            body: CommitTransactionBody::default(),
            extra_conflict_ranges: Vec::new(),
            conflicting_ranges: None,
            versionstamp_tx: Some(versionstamp_tx),
            versionstamp_rx: Some(versionstamp_rx),
            pending_watches: Vec::new(),
        }
    }

    fn inner(&self) -> &Arc<DatabaseInner> {
        &self.db.inner
    }

    pub fn set_option(&mut self, option: TransactionOption) -> Result<()> {
        if let TransactionOption::Timeout(timeout) = &option {
            self.deadline = Some(self.start_time + *timeout);
        }
        if matches!(option, TransactionOption::InitializeNewDatabase)
            && self.read_version.is_some()
        {
            return Err(Error::ReadVersionAlreadySet);
        }
        let knobs = &self.inner().knobs;
        self.options.apply(
            option,
            knobs.max_tags_per_transaction,
            knobs.max_transaction_tag_length,
        )
    }

    fn check_alive(&self) -> Result<()> {
        if self.cancelled {
            return Err(Error::TransactionCancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::TimedOut);
            }
        }
        Ok(())
    }

    /// Keys a read may legally name under the current options.
    fn check_read_key(&self, key: &[u8]) -> Result<()> {
        if key > &all_keys_end()[..] {
            return Err(Error::KeyOutsideLegalRange);
        }
        // The end-of-space sentinel is a legal selector anchor, not data.
        let system = key >= &system_keys_begin()[..] && key < &all_keys_end()[..];
        if system
            && !self.options.read_system_keys
            && !self.options.access_system_keys
            && key != &metadata_version_key()[..]
        {
            return Err(Error::SystemKeyAccessDenied);
        }
        Ok(())
    }

    fn check_write_key(&self, key: &[u8]) -> Result<()> {
        if key >= &system_keys_begin()[..] && !self.options.access_system_keys {
            return Err(Error::SystemKeyAccessDenied);
        }
        if key > &all_keys_end()[..] {
            return Err(Error::KeyOutsideLegalRange);
        }
        Ok(())
    }

    // ---- read version ----------------------------------------------------

    /// Explicitly bind the transaction's read version.
    pub fn set_read_version(&mut self, version: Version) -> Result<()> {
        if self.read_version.is_some() {
            return Err(Error::ReadVersionAlreadySet);
        }
        if version <= 0 && version != LATEST_VERSION {
            return Err(Error::VersionInvalid);
        }
        self.read_version = Some(async move { Ok(version) }.boxed().shared());
        Ok(())
    }

    /// The transaction's read version, acquiring one from the batcher on
    /// first use. The future is shared: every read sees the same version.
    pub fn get_read_version(&mut self) -> impl std::future::Future<Output = Result<Version>> {
        let shared = self.read_version_future(GrvFlags::default());
        async move { shared.await }
    }

    fn read_version_future(&mut self, extra_flags: GrvFlags) -> SharedVersion {
        if let Some(existing) = &self.read_version {
            return existing.clone();
        }

        let db = self.inner().clone();
        let priority = self.options.priority;
        let mut flags = extra_flags;
        if self.options.causal_read_risky {
            flags = flags.union(GrvFlags::CAUSAL_READ_RISKY);
        }
        if self.options.use_provisional_proxies {
            flags = flags.union(GrvFlags::USE_PROVISIONAL_PROXIES);
        }
        let tags = self.options.tags.clone();
        let lock_aware = self.options.read_lock_aware || self.options.lock_aware;
        let span = self.span;

        let future = async move {
            // Client-side throttling happens before the request ever
            // reaches the batcher.
            if let Some(delay) = db.throttles.required_delay(priority, &tags) {
                trace!(?delay, "delaying read version for throttled tags");
                tokio::time::sleep(delay).await;
                if db.throttles.is_throttled(priority, &tags) {
                    return Err(Error::TagThrottled);
                }
            }

            let (reply_tx, reply_rx) = oneshot::channel();
            grv::submit(
                &db,
                priority,
                flags,
                VersionRequest {
                    span,
                    tags,
                    debug_id: None,
                    reply: reply_tx,
                },
            );
            let reply = match reply_rx.await {
                Ok(reply) => reply?,
                Err(_) => return Err(Error::OperationCancelled),
            };
            if reply.locked && !lock_aware {
                return Err(Error::DatabaseLocked);
            }
            Ok(reply.version)
        }
        .boxed()
        .shared();

        self.read_version = Some(future.clone());
        future
    }

    // ---- point reads -----------------------------------------------------

    /// Read `key` at the transaction's read version. A non-snapshot read
    /// claims the key as a read conflict.
    pub async fn get(&mut self, key: Key, snapshot: bool) -> Result<Option<Value>> {
        self.check_alive()?;
        self.check_read_key(&key)?;
        ClientMetrics::bump(&self.inner().metrics.reads);

        if !snapshot {
            self.add_read_conflict_range_internal(KeyRange::single_key(&key));
        }

        let version_future = self.read_version_future(GrvFlags::default());
        let db = self.inner().clone();
        let tags = self.options.tags.clone();
        let span = self.span;

        let version = version_future.await?;

        // The metadata version is answered from the ring when the read
        // version is cached there.
        if key == metadata_version_key() {
            if let Some(cached) = db.cached_metadata_version(version) {
                return Ok(cached);
            }
        }

        let started = Instant::now();
        loop {
            let (_, location) = db.get_key_location(&key, false).await?;
            let req = GetValueRequest {
                span,
                key: key.clone(),
                version,
                tags: tags.clone(),
                debug_id: None,
            };
            ClientMetrics::bump(&db.metrics.physical_reads);
            match load_balance(&db, &location, req).await {
                Ok(reply) => {
                    db.metrics.read_latency.record(started.elapsed());
                    ClientMetrics::bump(&db.metrics.keys_read);
                    if let Some(value) = &reply.value {
                        ClientMetrics::add(
                            &db.metrics.bytes_read,
                            (key.len() + value.len()) as u64,
                        );
                    }
                    return Ok(reply.value);
                }
                Err(e) if shard_retry(e, version) => {
                    db.invalidate_cached_key(&key, false);
                    tokio::time::sleep(db.knobs.wrong_shard_server_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve a key selector. A non-snapshot resolution contributes a
    /// conflict range covering the keys the answer depends on.
    pub async fn get_key(&mut self, selector: KeySelector, snapshot: bool) -> Result<Key> {
        self.check_alive()?;
        self.check_read_key(&selector.key)?;

        let version_future = self.read_version_future(GrvFlags::default());
        let version = version_future.await?;
        let db = self.inner().clone();

        let original = selector.clone();
        let resolved =
            resolve_key(&db, selector, version, self.span, self.options.tags.clone()).await?;

        if !snapshot {
            let range = if original.offset <= 0 {
                let end = if original.or_equal {
                    key_after(&original.key)
                } else {
                    original.key.clone()
                };
                KeyRange::new(resolved.clone(), end)
            } else {
                let begin = if original.or_equal {
                    key_after(&original.key)
                } else {
                    original.key.clone()
                };
                KeyRange::new(begin, key_after(&resolved))
            };
            if !range.is_empty() {
                self.add_read_conflict_range_internal(range);
            }
        }
        Ok(resolved)
    }

    /// Range read with selector endpoints.
    pub async fn get_range(
        &mut self,
        begin: KeySelector,
        end: KeySelector,
        limits: RangeLimits,
        snapshot: bool,
        reverse: bool,
    ) -> Result<RangeResult> {
        self.check_alive()?;
        if !limits.is_valid() {
            return Err(Error::RangeLimitsInvalid);
        }
        self.check_read_key(&begin.key)?;
        self.check_read_key(&end.key)?;
        ClientMetrics::bump(&self.inner().metrics.reads);

        // A range that can be seen empty from the selectors alone makes no
        // request at all.
        if begin.is_first_greater_or_equal() && end.is_first_greater_or_equal() && begin.key >= end.key
        {
            return Ok(RangeResult::default());
        }

        let version_future = self.read_version_future(GrvFlags::default());
        let version = version_future.await?;
        let db = self.inner().clone();

        let (conflict_tx, conflict_rx) = oneshot::channel();
        if !snapshot {
            self.extra_conflict_ranges.push(conflict_rx);
        } else {
            drop(conflict_rx);
        }

        let result = get_range_internal(
            &db,
            version,
            begin,
            end,
            limits,
            reverse,
            self.span,
            self.options.tags.clone(),
            if snapshot { None } else { Some(conflict_tx) },
        )
        .await?;
        Ok(result)
    }

    /// Streaming scan of `[begin, end)` that parallelises across shards
    /// while preserving global key order.
    pub fn get_range_stream(&mut self, begin: Key, end: Key) -> Result<RangeStream> {
        self.check_alive()?;
        self.check_read_key(&begin)?;
        self.check_read_key(&end)?;
        let version_future = self.read_version_future(GrvFlags::default());
        Ok(crate::range_stream::spawn_range_stream(
            self.inner().clone(),
            version_future,
            KeyRange::new(begin, end),
            self.span,
            self.options.tags.clone(),
        ))
    }

    // ---- writes ----------------------------------------------------------

    fn check_value_size(&self, value: &[u8]) -> Result<()> {
        if value.len() > self.inner().knobs.value_size_limit {
            return Err(Error::ValueTooLarge);
        }
        Ok(())
    }

    fn check_key_size(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.inner().knobs.key_size_limit_for(key) {
            return Err(Error::KeyTooLarge);
        }
        Ok(())
    }

    pub fn set(&mut self, key: Key, value: Value) -> Result<()> {
        self.check_write_key(&key)?;
        self.check_key_size(&key)?;
        self.check_value_size(&value)?;
        self.add_write_conflict_range_internal(KeyRange::single_key(&key));
        self.body.mutations.push(Mutation {
            mutation_type: MutationType::SetValue,
            param1: key,
            param2: value,
        });
        Ok(())
    }

    pub fn clear(&mut self, key: Key) -> Result<()> {
        self.check_write_key(&key)?;
        self.check_key_size(&key)?;
        let end = key_after(&key);
        self.add_write_conflict_range_internal(KeyRange::single_key(&key));
        self.body.mutations.push(Mutation {
            mutation_type: MutationType::ClearRange,
            param1: key,
            param2: end,
        });
        Ok(())
    }

    pub fn clear_range(&mut self, range: KeyRange) -> Result<()> {
        self.check_write_key(&range.begin)?;
        self.check_write_key(&range.end)?;
        if range.begin > range.end {
            return Err(Error::ClientInvalidOperation);
        }
        if range.is_empty() {
            return Ok(());
        }
        self.add_write_conflict_range_internal(range.clone());
        self.body.mutations.push(Mutation {
            mutation_type: MutationType::ClearRange,
            param1: range.begin,
            param2: range.end,
        });
        Ok(())
    }

    /// Server-evaluated atomic operation.
    pub fn atomic_op(&mut self, key: Key, operand: Value, op: MutationType) -> Result<()> {
        if !op.is_atomic() {
            return Err(Error::ClientInvalidOperation);
        }
        self.check_write_key(&key)?;
        self.check_key_size(&key)?;
        self.check_value_size(&operand)?;

        let op = upgrade_atomic_op(op, self.inner().knobs.api_version);
        match op {
            MutationType::SetVersionstampedKey => {
                validate_versionstamp_position(&key, self.inner().knobs.api_version)?;
            }
            MutationType::SetVersionstampedValue => {
                validate_versionstamp_position(&operand, self.inner().knobs.api_version)?;
            }
            _ => {}
        }

        // Versionstamped operations cannot claim a conflict on a key whose
        // final bytes are unknown until commit.
        if !op.is_versionstamped() {
            self.add_write_conflict_range_internal(KeyRange::single_key(&key));
        }
        self.body.mutations.push(Mutation {
            mutation_type: op,
            param1: key,
            param2: operand,
        });
        Ok(())
    }

    /// Truncate conflict-range keys to the size limit plus one byte, which
    /// preserves coverage of every key the original range covered.
    fn truncate_conflict_key(&self, key: &Key) -> Key {
        let limit = self.inner().knobs.key_size_limit_for(key);
        if key.len() > limit + 1 {
            key.slice(..limit + 1)
        } else {
            key.clone()
        }
    }

    fn add_read_conflict_range_internal(&mut self, range: KeyRange) {
        let range = KeyRange::new(
            self.truncate_conflict_key(&range.begin),
            self.truncate_conflict_key(&range.end),
        );
        if !range.is_empty() {
            self.body.read_conflict_ranges.push(range);
        }
    }

    fn add_write_conflict_range_internal(&mut self, range: KeyRange) {
        let range = KeyRange::new(
            self.truncate_conflict_key(&range.begin),
            self.truncate_conflict_key(&range.end),
        );
        if !range.is_empty() {
            self.body.write_conflict_ranges.push(range);
        }
    }

    pub fn add_read_conflict_range(&mut self, range: KeyRange) -> Result<()> {
        if range.begin > range.end {
            return Err(Error::ClientInvalidOperation);
        }
        self.add_read_conflict_range_internal(range);
        Ok(())
    }

    pub fn add_write_conflict_range(&mut self, range: KeyRange) -> Result<()> {
        if range.begin > range.end {
            return Err(Error::ClientInvalidOperation);
        }
        self.add_write_conflict_range_internal(range);
        Ok(())
    }

    // ---- watches ---------------------------------------------------------

    /// Register a watch on `key`. `value` is the value the caller believes
    /// current. The watch is armed when the transaction commits.
    pub fn watch(&mut self, key: Key, value: Option<Value>) -> Result<TransactionWatch> {
        self.check_alive()?;
        self.check_read_key(&key)?;
        if self.db.watch_count() >= self.inner().max_watches() {
            return Err(Error::TooManyWatches);
        }
        let (arm_tx, arm_rx) = oneshot::channel();
        self.pending_watches.push(PendingWatch { key, value, arm_tx });
        Ok(TransactionWatch { arm_rx })
    }

    fn arm_watches(&mut self, watch_version: Version) {
        for pending in self.pending_watches.drain(..) {
            let armed = watches::register(
                &self.db.inner,
                pending.key,
                pending.value,
                watch_version,
                self.options.tags.clone(),
            );
            let _ = pending.arm_tx.send(armed);
        }
    }

    fn cancel_watches(&mut self, error: Error) {
        for pending in self.pending_watches.drain(..) {
            let _ = pending.arm_tx.send(Err(error));
        }
    }

    // ---- commit ----------------------------------------------------------

    /// Ensure read and write conflict sets intersect so a later dummy
    /// transaction over the same key can prove whether this one committed.
    fn make_self_conflicting(&mut self) {
        let mut key = BytesMut::with_capacity(38);
        key.put_slice(b"\xff/SC/");
        let uid: [u8; 16] = rand::thread_rng().gen();
        for b in uid {
            key.put_slice(format!("{b:02x}").as_bytes());
        }
        let range = KeyRange::single_key(&key.freeze());
        self.body.read_conflict_ranges.push(range.clone());
        self.body.write_conflict_ranges.push(range);
    }

    fn transaction_size(&self) -> usize {
        let mutation_bytes: usize = self.body.mutations.iter().map(|m| m.byte_size()).sum();
        let conflict_bytes: usize = self
            .body
            .read_conflict_ranges
            .iter()
            .chain(self.body.write_conflict_ranges.iter())
            .map(|r| r.begin.len() + r.end.len())
            .sum();
        mutation_bytes + conflict_bytes
    }

    /// The version this transaction committed at, or `INVALID_VERSION`.
    pub fn committed_version(&self) -> Version {
        self.committed_version
    }

    /// Read conflict ranges reported as conflicting by the last failed
    /// commit, when `report_conflicting_keys` was set.
    pub fn conflicting_ranges(&self) -> Option<&[KeyRange]> {
        self.conflicting_ranges.as_deref()
    }

    /// The transaction's versionstamp: resolves iff the commit succeeds.
    pub fn get_versionstamp(&mut self) -> Result<VersionstampFuture> {
        match self.versionstamp_rx.take() {
            Some(rx) => Ok(VersionstampFuture { rx }),
            None => Err(Error::ClientInvalidOperation),
        }
    }

    /// Commit the buffered mutations. On success returns the commit
    /// version and arms this transaction's watches.
    pub async fn commit(&mut self) -> Result<Version> {
        match self.commit_inner().await {
            Ok(version) => Ok(version),
            Err(e) => {
                self.cancel_watches(e);
                if let Some(tx) = self.versionstamp_tx.take() {
                    let _ = tx.send(Err(Error::TransactionInvalidVersion));
                }
                Err(e)
            }
        }
    }

    async fn commit_inner(&mut self) -> Result<Version> {
        self.check_alive()?;
        let db = self.inner().clone();

        // Read-only transactions commit trivially at no version.
        if self.body.mutations.is_empty() && self.body.write_conflict_ranges.is_empty() {
            self.committed_version = INVALID_VERSION;
            if let Some(tx) = self.versionstamp_tx.take() {
                let _ = tx.send(Err(Error::NoCommitVersion));
            }
            if !self.pending_watches.is_empty() {
                // Watches on a read-only transaction arm at the read
                // version; acquire one if no read ever did.
                let watch_version = self
                    .read_version_future(GrvFlags::CAUSAL_READ_RISKY)
                    .await?;
                self.arm_watches(watch_version);
            }
            return Ok(INVALID_VERSION);
        }

        ClientMetrics::bump(&db.metrics.commits_started);

        let size_limit = self
            .options
            .size_limit
            .unwrap_or(db.knobs.transaction_size_limit)
            .min(db.knobs.transaction_size_limit_max);
        if self.transaction_size() > size_limit {
            return Err(Error::TransactionTooLarge);
        }

        // Fold in conflict ranges from selector reads that have resolved.
        for rx in self.extra_conflict_ranges.iter_mut() {
            if let Ok(Some((begin, end))) = rx.try_recv() {
                if begin < end {
                    self.body
                        .read_conflict_ranges
                        .push(KeyRange::new(begin, end));
                }
            }
        }
        self.extra_conflict_ranges.clear();

        if !self.options.causal_write_risky && !conflict_sets_intersect(&self.body) {
            self.make_self_conflicting();
        }

        // A commit with no reads gets a cheap causally-risky version: there
        // is nothing for full causal consistency to protect.
        let read_version_future = self.read_version_future(GrvFlags::CAUSAL_READ_RISKY);
        let read_snapshot = read_version_future.await?;
        self.body.read_snapshot = read_snapshot;
        self.body.report_conflicting_keys = self.options.report_conflicting_keys;

        let mut flags = CommitFlags::default();
        if self.options.lock_aware {
            flags = flags.union(CommitFlags::LOCK_AWARE);
        }
        if self.options.first_in_batch {
            flags = flags.union(CommitFlags::FIRST_IN_BATCH);
        }

        let req = CommitRequest {
            span: self.span,
            transaction: self.body.clone(),
            flags,
            tags: self.options.tags.clone(),
            debug_id: None,
        };

        let commit_started = Instant::now();
        let result = try_commit(&db, req, self.options.use_provisional_proxies).await;

        match result {
            Ok(reply) if reply.version != INVALID_VERSION => {
                let version = reply.version;
                self.committed_version = version;
                db.update_metadata_version(version, reply.metadata_version.clone());

                if let Some(tx) = self.versionstamp_tx.take() {
                    let _ = tx.send(Ok(Versionstamp::new(version, reply.batch_id)));
                }

                self.num_errors = 0;
                ClientMetrics::bump(&db.metrics.commits_completed);
                ClientMetrics::add(
                    &db.metrics.committed_mutations,
                    self.body.mutations.len() as u64,
                );
                ClientMetrics::add(
                    &db.metrics.committed_mutation_bytes,
                    self.body.mutations.iter().map(|m| m.byte_size()).sum::<usize>() as u64,
                );
                db.metrics.commit_latency.record(commit_started.elapsed());

                self.arm_watches(version);
                Ok(version)
            }
            Ok(reply) => {
                // Conflict. Remember which read ranges lost, if reported.
                self.conflicting_ranges = reply.conflicting_range_indices.map(|indices| {
                    let mut seen = std::collections::HashSet::new();
                    indices
                        .into_iter()
                        .filter(|i| seen.insert(*i))
                        .filter_map(|i| self.body.read_conflict_ranges.get(i).cloned())
                        .collect()
                });
                ClientMetrics::bump(&db.metrics.conflicts);
                Err(Error::NotCommitted)
            }
            Err(e @ (Error::RequestMaybeDelivered | Error::CommitUnknownResult)) => {
                ClientMetrics::bump(&db.metrics.commits_maybe_delivered);
                if !self.options.causal_write_risky {
                    // The outcome is unknown. A conflicting dummy commit over
                    // the self-conflict key guarantees the original is no
                    // longer in flight; its success proves the original did
                    // not commit.
                    if let Some(probe) = self_conflicting_key(&self.body) {
                        commit_dummy_transaction(
                            &self.db,
                            KeyRange::single_key(&probe),
                            &self.options,
                        )
                        .await?;
                    }
                }
                let _ = e;
                Err(Error::CommitUnknownResult)
            }
            Err(e) => Err(e),
        }
    }

    // ---- retry loop ------------------------------------------------------

    /// Decide reset-versus-propagate for `e` and wait out the chosen
    /// backoff. `Ok(())` means the caller should retry its body.
    pub async fn on_error(&mut self, e: Error) -> Result<()> {
        let db = self.inner().clone();

        if matches!(
            e,
            Error::NotCommitted | Error::CommitUnknownResult | Error::RequestMaybeDelivered
        ) || e.retry_class() != RetryClass::Fatal
        {
            self.num_errors += 1;
            let retry_limit = self
                .options
                .retry_limit
                .unwrap_or(db.knobs.default_retry_limit);
            if let Some(limit) = retry_limit {
                if self.num_errors > limit {
                    return Err(e);
                }
            }
        }

        match e.retry_class() {
            RetryClass::TransientRetry => {
                match e {
                    Error::CommitUnknownResult => {
                        ClientMetrics::bump(&db.metrics.commits_maybe_delivered)
                    }
                    Error::ProxyMemoryLimitExceeded => {
                        ClientMetrics::bump(&db.metrics.errors_resource_constrained)
                    }
                    Error::ProcessBehind => ClientMetrics::bump(&db.metrics.errors_process_behind),
                    Error::BatchTransactionThrottled | Error::TagThrottled => {
                        ClientMetrics::bump(&db.metrics.errors_throttled)
                    }
                    _ => {}
                }

                let cap = if e == Error::ProxyMemoryLimitExceeded {
                    db.knobs.resource_constrained_max_backoff
                } else {
                    self.max_backoff()
                };
                let mut delay = self.backoff.mul_f64(rand::thread_rng().gen::<f64>());
                if e == Error::TagThrottled {
                    if let Some(required) =
                        db.throttles
                            .required_delay(self.options.priority, &self.options.tags)
                    {
                        delay = delay.max(required);
                    }
                }
                self.backoff = self
                    .backoff
                    .mul_f64(db.knobs.backoff_growth_rate)
                    .min(cap);
                self.reset_for_retry();
                tokio::time::sleep(delay).await;
                Ok(())
            }
            RetryClass::VersionDrift => {
                match e {
                    Error::TransactionTooOld => ClientMetrics::bump(&db.metrics.errors_too_old),
                    Error::FutureVersion => {
                        ClientMetrics::bump(&db.metrics.errors_future_version)
                    }
                    _ => {}
                }
                let delay = db.knobs.future_version_retry_delay.min(self.max_backoff());
                self.reset_for_retry();
                tokio::time::sleep(delay).await;
                Ok(())
            }
            RetryClass::ShardCacheInvalidation => {
                // The read path already invalidated the cache; do not reset
                // the transaction, just pace the retry.
                tokio::time::sleep(db.knobs.wrong_shard_server_delay).await;
                Ok(())
            }
            RetryClass::Fatal => {
                if e == Error::RequestMaybeDelivered {
                    // Treated like commit_unknown_result by the loop above.
                    self.reset_for_retry();
                    let delay = self.backoff.mul_f64(rand::thread_rng().gen::<f64>());
                    self.backoff = self
                        .backoff
                        .mul_f64(db.knobs.backoff_growth_rate)
                        .min(self.max_backoff());
                    tokio::time::sleep(delay).await;
                    return Ok(());
                }
                Err(e)
            }
        }
    }

    fn max_backoff(&self) -> Duration {
        self.options
            .max_backoff
            .unwrap_or(self.inner().knobs.default_max_backoff)
    }

    /// Clear per-attempt state, preserving options, backoff, and the error
    /// counter.
    fn reset_for_retry(&mut self) {
        self.body = CommitTransactionBody::default();
        self.read_version = None;
        self.extra_conflict_ranges.clear();
        self.conflicting_ranges = None;
        self.committed_version = INVALID_VERSION;
        self.cancel_watches(Error::TransactionCancelled);
        let (tx, rx) = oneshot::channel();
        self.versionstamp_tx = Some(tx);
        self.versionstamp_rx = Some(rx);
    }

    /// Discard all transaction state, keeping options. The next use starts
    /// a fresh attempt.
    pub fn reset(&mut self) {
        self.reset_for_retry();
        self.num_errors = 0;
        self.backoff = self.inner().knobs.default_backoff;
        self.cancelled = false;
        self.span = rand::thread_rng().gen();
        self.start_time = Instant::now();
        self.deadline = self.options.timeout.map(|t| self.start_time + t);
    }

    /// Cancel the transaction: pending watches and the versionstamp error
    /// out, and further operations fail until `reset`.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.cancel_watches(Error::TransactionCancelled);
        if let Some(tx) = self.versionstamp_tx.take() {
            let _ = tx.send(Err(Error::TransactionCancelled));
        }
    }
}

/// Shard errors that are really cache staleness, including a too-old
/// report against a latest-version read.
fn shard_retry(e: Error, version: Version) -> bool {
    matches!(e, Error::WrongShardServer | Error::AllAlternativesFailed)
        || (e == Error::TransactionTooOld && version == LATEST_VERSION)
}

fn conflict_sets_intersect(body: &CommitTransactionBody) -> bool {
    body.write_conflict_ranges
        .iter()
        .any(|w| body.read_conflict_ranges.iter().any(|r| w.intersects(r)))
}

/// A key inside the intersection of the read and write conflict sets.
fn self_conflicting_key(body: &CommitTransactionBody) -> Option<Key> {
    for w in &body.write_conflict_ranges {
        for r in &body.read_conflict_ranges {
            if let Some(overlap) = w.intersection(r) {
                return Some(overlap.begin);
            }
        }
    }
    None
}

fn upgrade_atomic_op(op: MutationType, api_version: u32) -> MutationType {
    if api_version >= 510 {
        match op {
            MutationType::Min => MutationType::MinV2,
            MutationType::And => MutationType::AndV2,
            other => other,
        }
    } else {
        op
    }
}

/// At API 520+ a versionstamped parameter carries a 4-byte little-endian
/// offset trailer naming where the 10-byte stamp lands.
fn validate_versionstamp_position(param: &[u8], api_version: u32) -> Result<()> {
    if api_version < 520 {
        return Ok(());
    }
    if param.len() < 4 {
        return Err(Error::ClientInvalidOperation);
    }
    let trailer = &param[param.len() - 4..];
    let offset = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]) as usize;
    if offset + 10 > param.len() - 4 {
        return Err(Error::ClientInvalidOperation);
    }
    Ok(())
}

/// One commit attempt against the current proxy set. Proxy-set churn while
/// the request is in flight means the outcome is unknown.
async fn try_commit(
    db: &Arc<DatabaseInner>,
    req: CommitRequest,
    use_provisional: bool,
) -> Result<meridian_rpc::messages::CommitReply> {
    let mut info_rx = db.cluster.client_info();
    let proxies = db.commit_proxies(use_provisional);
    if proxies.is_empty() {
        return Err(Error::RequestMaybeDelivered);
    }
    let cluster = db.cluster.clone();
    let attempt = crate::load_balance::basic_load_balance(&proxies, |proxy| {
        let req = req.clone();
        let cluster = cluster.clone();
        async move { cluster.commit(proxy, req).await }
    });
    tokio::select! {
        changed = info_rx.changed() => {
            let _ = changed;
            Err(Error::RequestMaybeDelivered)
        }
        result = attempt => match result {
            Ok(reply) => Ok(reply),
            Err(Error::AllAlternativesFailed | Error::ConnectionFailed | Error::BrokenPromise) => {
                Err(Error::RequestMaybeDelivered)
            }
            Err(e) => Err(e),
        },
    }
}

/// Commit a read+write claim over `range` with its own retry loop. Used to
/// resolve unknown commit outcomes: once this commits, the original
/// transaction cannot still be in flight.
async fn commit_dummy_transaction(
    db: &Database,
    range: KeyRange,
    options: &TransactionOptions,
) -> Result<()> {
    let mut tr = db.create_transaction();
    tr.options = options.clone();
    let mut retries = 0u32;
    loop {
        let attempt = async {
            tr.set_option(TransactionOption::AccessSystemKeys)?;
            tr.set_option(TransactionOption::CausalWriteRisky)?;
            tr.set_option(TransactionOption::LockAware)?;
            tr.add_read_conflict_range(range.clone())?;
            tr.add_write_conflict_range(range.clone())?;
            Box::pin(tr.commit()).await?;
            Ok(())
        }
        .await;
        match attempt {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(error = %e, retries, "dummy transaction attempt failed");
                tr.on_error(e).await?;
            }
        }
        retries += 1;
    }
}

/// Loop one selector to resolution, hopping shards as the servers re-point
/// the search.
async fn resolve_key(
    db: &Arc<DatabaseInner>,
    mut selector: KeySelector,
    version: Version,
    span: SpanId,
    tags: Vec<meridian_rpc::types::Tag>,
) -> Result<Key> {
    loop {
        // Selector arithmetic pinned to the edges of the key space resolves
        // without any server involved.
        if selector.offset > 0 && selector.key >= all_keys_end() {
            return Ok(all_keys_end());
        }
        if selector.offset <= 0 && selector.key == all_keys_begin() {
            return Ok(all_keys_begin());
        }

        let backward = selector.is_backward();
        let (_, location) = db.get_key_location(&selector.key, backward).await?;
        let req = GetKeyRequest {
            span,
            selector: selector.clone(),
            version,
            tags: tags.clone(),
            debug_id: None,
        };
        ClientMetrics::bump(&db.metrics.physical_reads);
        match load_balance(db, &location, req).await {
            Ok(reply) => {
                selector = reply.selector;
                if selector.offset == 0 && selector.or_equal {
                    return Ok(selector.key);
                }
                // Otherwise the answer lies in a neighboring shard; loop.
            }
            Err(e) if shard_retry(e, version) => {
                db.invalidate_cached_key(&selector.key, selector.is_backward());
                tokio::time::sleep(db.knobs.wrong_shard_server_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Turn row/byte limits into one reply's request fields. A negative row
/// limit asks the server to iterate in reverse.
fn transform_range_limits(
    limits: &RangeLimits,
    reverse: bool,
    reply_byte_limit: usize,
) -> (i64, usize) {
    let rows = if limits.has_row_limit() {
        limits.rows.min(reply_byte_limit) as i64
    } else {
        reply_byte_limit as i64
    };
    let rows = if reverse { -rows.max(1) } else { rows.max(1) };
    let bytes = if limits.has_byte_limit() {
        limits.bytes.min(reply_byte_limit)
    } else {
        reply_byte_limit
    };
    (rows, bytes.max(1))
}

/// Conflict range covered by a finished range read, per the selectors, the
/// data returned, and whether the scan saw the ends of the key space.
fn range_read_conflict(
    begin: &KeySelector,
    end: &KeySelector,
    reverse: bool,
    result: &RangeResult,
) -> (Key, Key) {
    let mut range_begin = if result.read_to_begin {
        all_keys_begin()
    } else if ((!reverse || !result.more || begin.offset > 1) && begin.offset > 0)
        || result.is_empty()
    {
        begin.key.clone()
    } else if reverse {
        result.kvs.last().expect("nonempty").key.clone()
    } else {
        result.kvs.first().expect("nonempty").key.clone()
    };

    if end.offset > begin.offset && end.key < range_begin {
        range_begin = end.key.clone();
    }

    let mut range_end = if result.read_through_end {
        all_keys_end()
    } else if ((reverse || !result.more || end.offset <= 0) && end.offset <= 1) || result.is_empty()
    {
        end.key.clone()
    } else if reverse {
        key_after(&result.kvs.first().expect("nonempty").key)
    } else {
        key_after(&result.kvs.last().expect("nonempty").key)
    };

    if begin.offset < end.offset && begin.key > range_end {
        range_end = begin.key.clone();
    }

    (range_begin, range_end)
}

/// The shard-iterating range read.
#[allow(clippy::too_many_arguments)]
async fn get_range_internal(
    db: &Arc<DatabaseInner>,
    version: Version,
    begin: KeySelector,
    end: KeySelector,
    limits: RangeLimits,
    reverse: bool,
    span: SpanId,
    tags: Vec<meridian_rpc::types::Tag>,
    conflict_tx: Option<oneshot::Sender<Option<(Key, Key)>>>,
) -> Result<RangeResult> {
    let original_begin = begin.clone();
    let original_end = end.clone();

    let result = get_range_loop(
        db, version, begin, end, limits, reverse, span, tags,
    )
    .await;

    match &result {
        Ok(output) => {
            if let Some(tx) = conflict_tx {
                let pair = range_read_conflict(&original_begin, &original_end, reverse, output);
                let _ = tx.send(Some(pair));
            }
        }
        Err(_) => {
            if let Some(tx) = conflict_tx {
                let _ = tx.send(None);
            }
        }
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn get_range_loop(
    db: &Arc<DatabaseInner>,
    version: Version,
    mut begin: KeySelector,
    mut end: KeySelector,
    mut limits: RangeLimits,
    reverse: bool,
    span: SpanId,
    tags: Vec<meridian_rpc::types::Tag>,
) -> Result<RangeResult> {
    let original_begin = begin.clone();
    let original_end = end.clone();
    let original_limits = limits;
    let mut output = RangeResult::default();
    let mut read_version = version;

    if begin.key == all_keys_begin() && begin.offset < 1 {
        output.read_to_begin = true;
        begin = KeySelector::first_greater_or_equal(begin.key.clone());
    }

    loop {
        // The end selector has collapsed to before the beginning of the
        // key space: nothing left to read.
        if end.key == all_keys_begin() && (end.offset < 1 || end.is_first_greater_or_equal()) {
            output.more = false;
            return Ok(output);
        }

        let (location_key, location_backward) = if reverse {
            (end.key.clone(), end.add(-1).is_backward())
        } else {
            (begin.key.clone(), begin.is_backward())
        };
        let (shard, location) = db.get_key_location(&location_key, location_backward).await?;

        let mut modified_selectors = false;
        let req_begin = if reverse
            && begin.add(-1).is_definitely_less(&shard.begin)
            && (!begin.is_first_greater_or_equal() || begin.key != shard.begin)
        {
            modified_selectors = true;
            KeySelector::first_greater_or_equal(shard.begin.clone())
        } else {
            begin.clone()
        };
        let req_end = if !reverse && end.is_definitely_greater(&shard.end) {
            modified_selectors = true;
            KeySelector::first_greater_or_equal(shard.end.clone())
        } else {
            end.clone()
        };

        let (limit, limit_bytes) =
            transform_range_limits(&limits, reverse, db.knobs.reply_byte_limit);
        let req = GetKeyValuesRequest {
            span,
            begin: req_begin,
            end: req_end,
            version: read_version,
            limit,
            limit_bytes,
            tags: tags.clone(),
            debug_id: None,
        };

        ClientMetrics::bump(&db.metrics.physical_reads);
        let rep = match load_balance(db, &location, req).await {
            Ok(rep) => rep,
            Err(e) if shard_retry(e, read_version) => {
                db.invalidate_cached_key(&location_key, location_backward);
                if e == Error::WrongShardServer {
                    return get_range_fallback(
                        db,
                        version,
                        original_begin,
                        original_end,
                        original_limits,
                        reverse,
                        span,
                        tags,
                    )
                    .await;
                }
                tokio::time::sleep(db.knobs.wrong_shard_server_delay).await;
                continue;
            }
            Err(e) => return Err(e),
        };

        limits.decrement(&rep.data);

        if reverse
            && begin.is_last_less_or_equal()
            && rep
                .data
                .last()
                .is_some_and(|kv| kv.key == begin.key)
        {
            modified_selectors = false;
        }

        let finished = limits.is_reached()
            || (!modified_selectors && !rep.more)
            || limits.has_satisfied_min_rows();
        let read_through = modified_selectors && !rep.more;

        output.kvs.extend(rep.data.iter().cloned());

        if finished {
            if read_through {
                output.read_through = Some(if reverse {
                    shard.begin.clone()
                } else {
                    shard.end.clone()
                });
            }
            output.more = modified_selectors || limits.is_reached() || rep.more;
            annotate_space_edges(&mut output, &original_begin, &original_end, reverse);
            ClientMetrics::add(&db.metrics.keys_read, output.kvs.len() as u64);
            ClientMetrics::add(&db.metrics.bytes_read, output.total_bytes() as u64);
            return Ok(output);
        }

        // Later shards are read at the version the first reply pinned.
        read_version = rep.version;

        if !rep.more {
            // The shard is exhausted under clamped selectors.
            if rep.data.is_empty() {
                // The true selector escaped the shard and the clamp found
                // nothing: only absolute resolution can make progress.
                return get_range_fallback(
                    db,
                    version,
                    original_begin,
                    original_end,
                    original_limits,
                    reverse,
                    span,
                    tags,
                )
                .await;
            }
            if reverse {
                end = KeySelector::first_greater_or_equal(shard.begin.clone());
            } else {
                begin = KeySelector::first_greater_or_equal(shard.end.clone());
            }
        } else if reverse {
            end = KeySelector::first_greater_or_equal(
                output.kvs.last().expect("nonempty output").key.clone(),
            );
        } else {
            begin = KeySelector::first_greater_than(
                output.kvs.last().expect("nonempty output").key.clone(),
            );
        }
    }
}

fn annotate_space_edges(
    output: &mut RangeResult,
    begin: &KeySelector,
    end: &KeySelector,
    reverse: bool,
) {
    if begin.key == all_keys_begin()
        && begin.offset <= 1
        && ((reverse && !output.more) || !reverse)
    {
        output.read_to_begin = true;
    }
    if end.key >= all_keys_end() && ((!reverse && !output.more) || reverse) {
        output.read_through_end = true;
    }
}

/// Resolve both selectors to absolute keys, then read the exact range.
/// Used when clamped selectors cannot make progress.
#[allow(clippy::too_many_arguments)]
async fn get_range_fallback(
    db: &Arc<DatabaseInner>,
    version: Version,
    begin: KeySelector,
    end: KeySelector,
    limits: RangeLimits,
    reverse: bool,
    span: SpanId,
    tags: Vec<meridian_rpc::types::Tag>,
) -> Result<RangeResult> {
    let fb = resolve_key(db, begin.clone(), version, span, tags.clone());
    let fe = resolve_key(db, end.clone(), version, span, tags.clone());
    let (b, e) = tokio::join!(fb, fe);
    let (b, e) = (b?, e?);
    if b >= e {
        return Ok(RangeResult::default());
    }

    let mut result = get_exact_range(
        db,
        version,
        KeyRange::new(b.clone(), e.clone()),
        limits,
        reverse,
        span,
        tags,
    )
    .await?;

    if b == all_keys_begin() && ((reverse && !result.more) || !reverse) {
        result.read_to_begin = true;
    }
    if e >= all_keys_end() && ((!reverse && !result.more) || reverse) {
        result.read_through_end = true;
    }
    Ok(result)
}

/// Read `[keys.begin, keys.end)` shard by shard with plain
/// first-greater-or-equal bounds.
#[allow(clippy::too_many_arguments)]
async fn get_exact_range(
    db: &Arc<DatabaseInner>,
    version: Version,
    keys: KeyRange,
    mut limits: RangeLimits,
    reverse: bool,
    span: SpanId,
    tags: Vec<meridian_rpc::types::Tag>,
) -> Result<RangeResult> {
    let mut output = RangeResult::default();
    let mut remaining = keys;

    'locations: loop {
        let locations = db
            .get_key_range_locations(&remaining, db.knobs.get_range_shard_limit, reverse)
            .await?;

        for (shard_range, location) in locations {
            let clipped = shard_range
                .intersection(&remaining)
                .unwrap_or_else(|| KeyRange::new(remaining.begin.clone(), remaining.begin.clone()));
            if clipped.is_empty() {
                continue;
            }
            loop {
                let (limit, limit_bytes) =
                    transform_range_limits(&limits, reverse, db.knobs.reply_byte_limit);
                let req = GetKeyValuesRequest {
                    span,
                    begin: KeySelector::first_greater_or_equal(clipped.begin.clone()),
                    end: KeySelector::first_greater_or_equal(clipped.end.clone()),
                    version,
                    limit,
                    limit_bytes,
                    tags: tags.clone(),
                    debug_id: None,
                };
                ClientMetrics::bump(&db.metrics.physical_reads);
                match load_balance(db, &location, req).await {
                    Ok(rep) => {
                        limits.decrement(&rep.data);
                        output.kvs.extend(rep.data.iter().cloned());
                        if limits.is_reached() {
                            output.more = true;
                            return Ok(output);
                        }
                        if rep.more {
                            // Continue within the same shard past the last
                            // returned key.
                            let last = rep.data.last().expect("more implies data");
                            let resume = if reverse {
                                KeyRange::new(clipped.begin.clone(), last.key.clone())
                            } else {
                                KeyRange::new(key_after(&last.key), clipped.end.clone())
                            };
                            if resume.is_empty() {
                                break;
                            }
                            remaining = if reverse {
                                KeyRange::new(remaining.begin.clone(), resume.end.clone())
                            } else {
                                KeyRange::new(resume.begin.clone(), remaining.end.clone())
                            };
                            continue 'locations;
                        }
                        break;
                    }
                    Err(e) if shard_retry(e, version) => {
                        db.invalidate_cached_range(&remaining);
                        tokio::time::sleep(db.knobs.wrong_shard_server_delay).await;
                        continue 'locations;
                    }
                    Err(e) => return Err(e),
                }
            }
            // Advance past the shard just consumed.
            remaining = if reverse {
                KeyRange::new(remaining.begin.clone(), shard_range.begin.clone())
            } else {
                KeyRange::new(shard_range.end.clone(), remaining.end.clone())
            };
            if remaining.is_empty() {
                return Ok(output);
            }
        }

        if remaining.is_empty() {
            return Ok(output);
        }
    }
}
