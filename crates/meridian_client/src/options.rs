//! Public option space.
//!
//! Options are enum tags optionally carrying a value; validation happens at
//! `set_option` time so a bad value surfaces as `InvalidOptionValue` before
//! it can affect a request.

use std::time::Duration;

use meridian_rpc::error::{Error, Result};
use meridian_rpc::messages::SpanId;
use meridian_rpc::types::{Priority, Tag};

/// Process-global options applied before any database is opened.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkOption {
    TraceEnable { directory: Option<String> },
    TraceRollSize(u64),
    TraceMaxLogsSize(u64),
    TraceFormat(String),
    TraceFileIdentifier(String),
    TraceLogGroup(String),
    TraceClockSource(String),
    Knob { name: String, value: String },
    TlsCertPath(String),
    TlsCertBytes(Vec<u8>),
    TlsCaPath(String),
    TlsCaBytes(Vec<u8>),
    TlsKeyPath(String),
    TlsKeyBytes(Vec<u8>),
    TlsPassword(String),
    TlsVerifyPeers(String),
    DisableClientStatisticsLogging,
    EnableRunLoopProfiling,
    SupportedClientVersions(String),
    DistributedClientTracer(ClientTracer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTracer {
    None,
    LogFile,
    NetworkLossy,
}

impl ClientTracer {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(ClientTracer::None),
            "log_file" => Ok(ClientTracer::LogFile),
            "network_lossy" => Ok(ClientTracer::NetworkLossy),
            _ => Err(Error::InvalidOptionValue),
        }
    }
}

/// Options applied to one database context.
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseOption {
    LocationCacheSize(usize),
    MachineId(String),
    MaxWatches(usize),
    DatacenterId(String),
    SnapshotRywEnable,
    SnapshotRywDisable,
    TransactionLoggingEnable,
    TransactionLoggingDisable,
    UseConfigDatabase,
    TestCausalReadRisky,
    /// Default stamped onto every new transaction.
    TransactionDefault(TransactionOption),
}

/// Options applied to one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOption {
    CausalReadRisky,
    CausalWriteRisky,
    PrioritySystemImmediate,
    PriorityBatch,
    InitializeNewDatabase,
    AccessSystemKeys,
    ReadSystemKeys,
    Timeout(Duration),
    RetryLimit(i64),
    MaxRetryDelay(Duration),
    SizeLimit(usize),
    LockAware,
    ReadLockAware,
    FirstInBatch,
    UseProvisionalProxies,
    IncludePortInAddress,
    Tag(Tag),
    AutoThrottleTag(Tag),
    SpanParent(SpanId),
    ReportConflictingKeys,
    ExpensiveClearCostEstimationEnable,
    DebugTransactionIdentifier(String),
    LogTransaction,
    TransactionLoggingMaxFieldLength(usize),
    ServerRequestTracing,
}

impl TransactionOption {
    /// Validate value constraints that do not depend on transaction state.
    pub fn validate(&self, max_tag_length: usize) -> Result<()> {
        match self {
            TransactionOption::Tag(tag) | TransactionOption::AutoThrottleTag(tag) => {
                if tag.is_empty() || tag.len() > max_tag_length {
                    return Err(Error::InvalidOptionValue);
                }
            }
            TransactionOption::DebugTransactionIdentifier(id) => {
                if id.is_empty() || id.len() > 100 {
                    return Err(Error::InvalidOptionValue);
                }
            }
            TransactionOption::RetryLimit(limit) => {
                if *limit < -1 {
                    return Err(Error::InvalidOptionValue);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Resolved per-transaction option state.
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    pub priority: Priority,
    pub causal_read_risky: bool,
    pub causal_write_risky: bool,
    pub access_system_keys: bool,
    pub read_system_keys: bool,
    pub lock_aware: bool,
    pub read_lock_aware: bool,
    pub first_in_batch: bool,
    pub use_provisional_proxies: bool,
    pub include_port_in_address: bool,
    pub report_conflicting_keys: bool,
    pub expensive_clear_cost_estimation: bool,
    pub server_request_tracing: bool,
    pub initialize_new_database: bool,
    pub timeout: Option<Duration>,
    /// `None` means use the database default; `Some(None)` means unlimited.
    pub retry_limit: Option<Option<u32>>,
    pub max_backoff: Option<Duration>,
    pub size_limit: Option<usize>,
    pub tags: Vec<Tag>,
    pub auto_throttle_tags: Vec<Tag>,
    pub span_parent: Option<SpanId>,
    pub debug_identifier: Option<String>,
    pub log_transaction: bool,
    pub logging_max_field_length: Option<usize>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Default,
            causal_read_risky: false,
            causal_write_risky: false,
            access_system_keys: false,
            read_system_keys: false,
            lock_aware: false,
            read_lock_aware: false,
            first_in_batch: false,
            use_provisional_proxies: false,
            include_port_in_address: false,
            report_conflicting_keys: false,
            expensive_clear_cost_estimation: false,
            server_request_tracing: false,
            initialize_new_database: false,
            timeout: None,
            retry_limit: None,
            max_backoff: None,
            size_limit: None,
            tags: Vec::new(),
            auto_throttle_tags: Vec::new(),
            span_parent: None,
            debug_identifier: None,
            log_transaction: false,
            logging_max_field_length: None,
        }
    }
}

impl TransactionOptions {
    /// Apply one option. `max_tags`/`max_tag_length` come from the knobs.
    pub fn apply(
        &mut self,
        option: TransactionOption,
        max_tags: usize,
        max_tag_length: usize,
    ) -> Result<()> {
        option.validate(max_tag_length)?;
        match option {
            TransactionOption::CausalReadRisky => self.causal_read_risky = true,
            TransactionOption::CausalWriteRisky => self.causal_write_risky = true,
            TransactionOption::PrioritySystemImmediate => self.priority = Priority::Immediate,
            TransactionOption::PriorityBatch => self.priority = Priority::Batch,
            TransactionOption::InitializeNewDatabase => self.initialize_new_database = true,
            TransactionOption::AccessSystemKeys => self.access_system_keys = true,
            TransactionOption::ReadSystemKeys => self.read_system_keys = true,
            TransactionOption::Timeout(d) => self.timeout = Some(d),
            TransactionOption::RetryLimit(n) => {
                self.retry_limit = Some(if n < 0 { None } else { Some(n as u32) });
            }
            TransactionOption::MaxRetryDelay(d) => self.max_backoff = Some(d),
            TransactionOption::SizeLimit(n) => self.size_limit = Some(n),
            TransactionOption::LockAware => {
                self.lock_aware = true;
                self.read_lock_aware = true;
            }
            TransactionOption::ReadLockAware => self.read_lock_aware = true,
            TransactionOption::FirstInBatch => self.first_in_batch = true,
            TransactionOption::UseProvisionalProxies => self.use_provisional_proxies = true,
            TransactionOption::IncludePortInAddress => self.include_port_in_address = true,
            TransactionOption::Tag(tag) => {
                if self.tags.len() >= max_tags {
                    return Err(Error::InvalidOptionValue);
                }
                self.tags.push(tag);
            }
            TransactionOption::AutoThrottleTag(tag) => {
                if self.tags.len() >= max_tags {
                    return Err(Error::InvalidOptionValue);
                }
                self.tags.push(tag.clone());
                self.auto_throttle_tags.push(tag);
            }
            TransactionOption::SpanParent(span) => self.span_parent = Some(span),
            TransactionOption::ReportConflictingKeys => self.report_conflicting_keys = true,
            TransactionOption::ExpensiveClearCostEstimationEnable => {
                self.expensive_clear_cost_estimation = true;
            }
            TransactionOption::DebugTransactionIdentifier(id) => {
                self.debug_identifier = Some(id);
            }
            TransactionOption::LogTransaction => {
                if self.debug_identifier.is_none() {
                    return Err(Error::InvalidOptionValue);
                }
                self.log_transaction = true;
            }
            TransactionOption::TransactionLoggingMaxFieldLength(n) => {
                if n == 0 {
                    return Err(Error::InvalidOptionValue);
                }
                self.logging_max_field_length = Some(n);
            }
            TransactionOption::ServerRequestTracing => self.server_request_tracing = true,
        }
        Ok(())
    }
}
