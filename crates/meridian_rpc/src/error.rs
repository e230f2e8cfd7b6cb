//! Error taxonomy shared by the client runtime and the cluster roles.
//!
//! Every failure that crosses the transport seam or surfaces from the
//! transaction API is one of these kinds. The retry loop never matches on
//! message strings; it dispatches on [`RetryClass`].

use serde::{Deserialize, Serialize};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All error kinds known to the client.
///
/// Kinds are `Copy` so they can be broadcast to every waiter of a batched
/// request without cloning allocations.
#[derive(
    thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum Error {
    // Retriable: the framework resets the transaction and retries.
    #[error("transaction not committed due to conflict with another transaction")]
    NotCommitted,
    #[error("transaction may or may not have committed")]
    CommitUnknownResult,
    #[error("transaction is too old to perform reads or be committed")]
    TransactionTooOld,
    #[error("request for a future version")]
    FutureVersion,
    #[error("database is locked")]
    DatabaseLocked,
    #[error("commit proxy commit memory limit exceeded")]
    ProxyMemoryLimitExceeded,
    #[error("batch-priority transaction throttled by the cluster")]
    BatchTransactionThrottled,
    #[error("storage process lagging behind the cluster version")]
    ProcessBehind,
    #[error("transaction tag throttled by the cluster")]
    TagThrottled,

    // Retriable with cache invalidation instead of a transaction reset.
    #[error("shard is not hosted by the queried server")]
    WrongShardServer,
    #[error("all replica alternatives failed")]
    AllAlternativesFailed,

    #[error("request may or may not have been delivered")]
    RequestMaybeDelivered,

    // Transport-level failures. These rotate the load balancer to the next
    // replica and only surface once every alternative is exhausted.
    #[error("connection to the endpoint failed")]
    ConnectionFailed,
    #[error("the remote end dropped the request")]
    BrokenPromise,
    #[error("operation timed out")]
    TimedOut,

    // User-fatal: propagate immediately, never retried by the framework.
    #[error("key exceeds the maximum allowed length")]
    KeyTooLarge,
    #[error("value exceeds the maximum allowed length")]
    ValueTooLarge,
    #[error("transaction exceeds the configured byte limit")]
    TransactionTooLarge,
    #[error("range limits are invalid")]
    RangeLimitsInvalid,
    #[error("operation issued by the client is invalid")]
    ClientInvalidOperation,
    #[error("attempted to commit a read-only transaction")]
    TransactionReadOnly,
    #[error("option value is invalid for this option")]
    InvalidOptionValue,
    #[error("read version has already been set")]
    ReadVersionAlreadySet,
    #[error("version is not valid")]
    VersionInvalid,
    #[error("a watch was set on this key but the transaction cannot hold more watches")]
    TooManyWatches,
    #[error("the watch was cancelled")]
    WatchCancelled,
    #[error("transaction committed no mutations, so it has no commit version")]
    NoCommitVersion,
    #[error("the transaction's read version is invalid")]
    TransactionInvalidVersion,
    #[error("operation was cancelled")]
    OperationCancelled,
    #[error("the transaction was cancelled")]
    TransactionCancelled,
    #[error("key is outside the range this transaction may access")]
    KeyOutsideLegalRange,
    #[error("external key-space write attempted without access to system keys")]
    SystemKeyAccessDenied,
}

/// What the retry shell does with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Reset the transaction and retry after a growing, jittered backoff.
    TransientRetry,
    /// Reset and retry after a short fixed delay; the read version raced
    /// the cluster's version window.
    VersionDrift,
    /// Invalidate the location cache for the affected keys and retry the
    /// operation in place without resetting the transaction.
    ShardCacheInvalidation,
    /// Propagate to the caller.
    Fatal,
}

impl Error {
    pub fn retry_class(self) -> RetryClass {
        match self {
            Error::NotCommitted
            | Error::CommitUnknownResult
            | Error::DatabaseLocked
            | Error::ProxyMemoryLimitExceeded
            | Error::ProcessBehind
            | Error::BatchTransactionThrottled
            | Error::TagThrottled => RetryClass::TransientRetry,
            Error::TransactionTooOld | Error::FutureVersion => RetryClass::VersionDrift,
            Error::WrongShardServer | Error::AllAlternativesFailed => {
                RetryClass::ShardCacheInvalidation
            }
            _ => RetryClass::Fatal,
        }
    }

    /// True for every kind the framework-level retry loop will handle.
    pub fn is_retriable(self) -> bool {
        !matches!(self.retry_class(), RetryClass::Fatal)
            || matches!(self, Error::RequestMaybeDelivered)
    }

    /// Transport failures that rotate the load balancer to another replica.
    pub fn rotates_replica(self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed | Error::BrokenPromise | Error::TimedOut
        )
    }
}
