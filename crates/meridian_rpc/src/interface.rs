//! Role interface descriptors.
//!
//! An interface names one cluster process and the endpoint tokens of the
//! operations it serves. Tokens are stable for the lifetime of the process:
//! a changed token for the same server id means the server migrated and any
//! cached pointer to the old interface must be refreshed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::Key;

pub type ServerId = u64;
pub type EndpointToken = u64;

/// One storage server and its per-operation endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageServerInterface {
    pub id: ServerId,
    pub address: String,
    /// Set when this interface describes a shadow (verification) server.
    pub is_shadow: bool,
    pub get_value: EndpointToken,
    pub get_key: EndpointToken,
    pub get_key_values: EndpointToken,
    pub get_key_values_stream: EndpointToken,
    pub watch_value: EndpointToken,
    pub wait_metrics: EndpointToken,
    pub split_metrics: EndpointToken,
    pub get_read_hot_ranges: EndpointToken,
    pub get_range_split_points: EndpointToken,
}

impl StorageServerInterface {
    /// Build an interface whose endpoint tokens are derived from a base
    /// token, one per operation slot.
    pub fn with_base_token(id: ServerId, address: String, base: EndpointToken) -> Self {
        Self {
            id,
            address,
            is_shadow: false,
            get_value: base,
            get_key: base + 1,
            get_key_values: base + 2,
            get_key_values_stream: base + 3,
            watch_value: base + 4,
            wait_metrics: base + 5,
            split_metrics: base + 6,
            get_read_hot_ranges: base + 7,
            get_range_split_points: base + 8,
        }
    }

    /// True when `other` describes the same process generation: same id and
    /// unchanged endpoint tokens.
    pub fn same_endpoints(&self, other: &StorageServerInterface) -> bool {
        self.id == other.id
            && self.get_value == other.get_value
            && self.get_key == other.get_key
            && self.get_key_values == other.get_key_values
            && self.get_key_values_stream == other.get_key_values_stream
            && self.watch_value == other.watch_value
    }
}

/// The replica set hosting one shard.
///
/// Shared by every transaction reading the shard; never mutated after
/// publication. Cache eviction invalidates the entry and lets holders
/// re-resolve rather than reseating servers behind their backs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationInfo {
    pub servers: Vec<Arc<StorageServerInterface>>,
    /// At least one replica in the set serves cached (non-authoritative) data.
    pub has_caches: bool,
}

impl LocationInfo {
    pub fn new(servers: Vec<Arc<StorageServerInterface>>) -> Arc<Self> {
        Arc::new(Self {
            servers,
            has_caches: false,
        })
    }
}

/// A proxy serving batched read versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrvProxyInterface {
    pub id: ServerId,
    pub address: String,
    pub get_read_version: EndpointToken,
}

/// A proxy sequencing commits and serving key-location queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitProxyInterface {
    pub id: ServerId,
    pub address: String,
    pub commit: EndpointToken,
    pub get_key_server_locations: EndpointToken,
}

/// The coordinator-advertised membership a client acts on: the current
/// proxy sets plus a generation counter that increases on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterClientInfo {
    pub generation: u64,
    pub grv_proxies: Vec<GrvProxyInterface>,
    pub commit_proxies: Vec<CommitProxyInterface>,
    /// Present during a recovery window; only transactions that opted in
    /// via `use_provisional_proxies` may use them.
    pub provisional_commit_proxies: Vec<CommitProxyInterface>,
    /// Current coordinator addresses, mirrored into the cluster file.
    pub coordinators: Vec<String>,
}

/// A key and the storage addresses caching believes host it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAddresses {
    pub key: Key,
    pub addresses: Vec<String>,
}
