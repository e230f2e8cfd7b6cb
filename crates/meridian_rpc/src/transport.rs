//! Transport traits the client runtime is written against.
//!
//! The wire codec and connection management live behind these traits; the
//! runtime only ever names an interface descriptor and a typed request. A
//! storage operation is described by [`StorageRequest`], which carries the
//! reply type, the endpoint selector, and the dispatch glue, so the load
//! balancer can be generic over operations instead of naming each one.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::Result;
use crate::interface::{
    ClusterClientInfo, CommitProxyInterface, EndpointToken, GrvProxyInterface,
    StorageServerInterface,
};
use crate::messages::{
    CommitReply, CommitRequest, GetKeyReply, GetKeyRequest, GetKeyServerLocationsReply,
    GetKeyServerLocationsRequest, GetKeyValuesReply, GetKeyValuesRequest,
    GetKeyValuesStreamReply, GetRangeSplitPointsReply, GetRangeSplitPointsRequest,
    GetReadVersionReply, GetReadVersionRequest, GetValueReply, GetValueRequest,
    ReadHotRangesReply, ReadHotRangesRequest, SplitMetricsReply, SplitMetricsRequest,
    WaitMetricsRequest, WatchValueReply, WatchValueRequest,
};
use crate::messages::StorageMetrics;

/// Receiving half of a streaming reply. The sender closes the channel after
/// the final chunk; an error item terminates the stream.
pub type ReplyStream<T> = mpsc::Receiver<Result<T>>;

/// Connection to the storage-server fleet.
#[async_trait]
pub trait StorageTransport: Send + Sync + 'static {
    async fn get_value(
        &self,
        server: &StorageServerInterface,
        req: GetValueRequest,
    ) -> Result<GetValueReply>;

    async fn get_key(
        &self,
        server: &StorageServerInterface,
        req: GetKeyRequest,
    ) -> Result<GetKeyReply>;

    async fn get_key_values(
        &self,
        server: &StorageServerInterface,
        req: GetKeyValuesRequest,
    ) -> Result<GetKeyValuesReply>;

    async fn get_key_values_stream(
        &self,
        server: &StorageServerInterface,
        req: GetKeyValuesRequest,
    ) -> Result<ReplyStream<GetKeyValuesStreamReply>>;

    async fn watch_value(
        &self,
        server: &StorageServerInterface,
        req: WatchValueRequest,
    ) -> Result<WatchValueReply>;

    async fn wait_metrics(
        &self,
        server: &StorageServerInterface,
        req: WaitMetricsRequest,
    ) -> Result<StorageMetrics>;

    async fn split_metrics(
        &self,
        server: &StorageServerInterface,
        req: SplitMetricsRequest,
    ) -> Result<SplitMetricsReply>;

    async fn get_read_hot_ranges(
        &self,
        server: &StorageServerInterface,
        req: ReadHotRangesRequest,
    ) -> Result<ReadHotRangesReply>;

    async fn get_range_split_points(
        &self,
        server: &StorageServerInterface,
        req: GetRangeSplitPointsRequest,
    ) -> Result<GetRangeSplitPointsReply>;
}

/// Connection to the proxy roles plus the coordinator-fed membership feed.
#[async_trait]
pub trait ClusterTransport: Send + Sync + 'static {
    /// Feed of the current proxy sets. The receiver's value changes whenever
    /// coordinators advertise a new generation.
    fn client_info(&self) -> watch::Receiver<ClusterClientInfo>;

    async fn get_read_version(
        &self,
        proxy: &GrvProxyInterface,
        req: GetReadVersionRequest,
    ) -> Result<GetReadVersionReply>;

    async fn commit(
        &self,
        proxy: &CommitProxyInterface,
        req: CommitRequest,
    ) -> Result<CommitReply>;

    async fn get_key_server_locations(
        &self,
        proxy: &CommitProxyInterface,
        req: GetKeyServerLocationsRequest,
    ) -> Result<GetKeyServerLocationsReply>;
}

/// Storage operations, for metrics and log labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOperation {
    GetValue,
    GetKey,
    GetKeyValues,
    GetKeyValuesStream,
    WatchValue,
    WaitMetrics,
    SplitMetrics,
    ReadHotRanges,
    RangeSplitPoints,
}

/// Descriptor for one unary storage operation: reply type, endpoint
/// selector, dispatch, and the shadow-comparison rule used by paired
/// verification reads.
#[async_trait]
pub trait StorageRequest: Clone + Send + Sync + 'static {
    type Reply: Clone + Send + Sync + 'static;

    fn operation() -> StorageOperation;

    /// Token of this operation's endpoint on `server`.
    fn endpoint(server: &StorageServerInterface) -> EndpointToken;

    async fn send(
        transport: &dyn StorageTransport,
        server: &StorageServerInterface,
        req: Self,
    ) -> Result<Self::Reply>;

    /// When this operation participates in shadow verification, compare the
    /// primary and shadow replies and describe the divergence. `None` means
    /// matching replies or an operation that is never compared.
    fn shadow_mismatch(_req: &Self, _primary: &Self::Reply, _shadow: &Self::Reply) -> Option<String> {
        None
    }
}

#[async_trait]
impl StorageRequest for GetValueRequest {
    type Reply = GetValueReply;

    fn operation() -> StorageOperation {
        StorageOperation::GetValue
    }

    fn endpoint(server: &StorageServerInterface) -> EndpointToken {
        server.get_value
    }

    async fn send(
        transport: &dyn StorageTransport,
        server: &StorageServerInterface,
        req: Self,
    ) -> Result<Self::Reply> {
        transport.get_value(server, req).await
    }

    fn shadow_mismatch(req: &Self, primary: &Self::Reply, shadow: &Self::Reply) -> Option<String> {
        (primary.value != shadow.value).then(|| {
            format!(
                "get_value key={:?} version={} primary={:?} shadow={:?}",
                req.key, req.version, primary.value, shadow.value
            )
        })
    }
}

#[async_trait]
impl StorageRequest for GetKeyRequest {
    type Reply = GetKeyReply;

    fn operation() -> StorageOperation {
        StorageOperation::GetKey
    }

    fn endpoint(server: &StorageServerInterface) -> EndpointToken {
        server.get_key
    }

    async fn send(
        transport: &dyn StorageTransport,
        server: &StorageServerInterface,
        req: Self,
    ) -> Result<Self::Reply> {
        transport.get_key(server, req).await
    }

    fn shadow_mismatch(req: &Self, primary: &Self::Reply, shadow: &Self::Reply) -> Option<String> {
        (primary.selector != shadow.selector).then(|| {
            format!(
                "get_key selector={:?} version={} primary={:?} shadow={:?}",
                req.selector, req.version, primary.selector, shadow.selector
            )
        })
    }
}

#[async_trait]
impl StorageRequest for GetKeyValuesRequest {
    type Reply = GetKeyValuesReply;

    fn operation() -> StorageOperation {
        StorageOperation::GetKeyValues
    }

    fn endpoint(server: &StorageServerInterface) -> EndpointToken {
        server.get_key_values
    }

    async fn send(
        transport: &dyn StorageTransport,
        server: &StorageServerInterface,
        req: Self,
    ) -> Result<Self::Reply> {
        transport.get_key_values(server, req).await
    }

    fn shadow_mismatch(req: &Self, primary: &Self::Reply, shadow: &Self::Reply) -> Option<String> {
        (primary.data != shadow.data || primary.more != shadow.more).then(|| {
            format!(
                "get_key_values begin={:?} end={:?} version={} primary_rows={} shadow_rows={}",
                req.begin,
                req.end,
                req.version,
                primary.data.len(),
                shadow.data.len()
            )
        })
    }
}

#[async_trait]
impl StorageRequest for WatchValueRequest {
    type Reply = WatchValueReply;

    fn operation() -> StorageOperation {
        StorageOperation::WatchValue
    }

    fn endpoint(server: &StorageServerInterface) -> EndpointToken {
        server.watch_value
    }

    async fn send(
        transport: &dyn StorageTransport,
        server: &StorageServerInterface,
        req: Self,
    ) -> Result<Self::Reply> {
        transport.watch_value(server, req).await
    }
}

#[async_trait]
impl StorageRequest for WaitMetricsRequest {
    type Reply = StorageMetrics;

    fn operation() -> StorageOperation {
        StorageOperation::WaitMetrics
    }

    fn endpoint(server: &StorageServerInterface) -> EndpointToken {
        server.wait_metrics
    }

    async fn send(
        transport: &dyn StorageTransport,
        server: &StorageServerInterface,
        req: Self,
    ) -> Result<Self::Reply> {
        transport.wait_metrics(server, req).await
    }
}

#[async_trait]
impl StorageRequest for SplitMetricsRequest {
    type Reply = SplitMetricsReply;

    fn operation() -> StorageOperation {
        StorageOperation::SplitMetrics
    }

    fn endpoint(server: &StorageServerInterface) -> EndpointToken {
        server.split_metrics
    }

    async fn send(
        transport: &dyn StorageTransport,
        server: &StorageServerInterface,
        req: Self,
    ) -> Result<Self::Reply> {
        transport.split_metrics(server, req).await
    }
}

#[async_trait]
impl StorageRequest for ReadHotRangesRequest {
    type Reply = ReadHotRangesReply;

    fn operation() -> StorageOperation {
        StorageOperation::ReadHotRanges
    }

    fn endpoint(server: &StorageServerInterface) -> EndpointToken {
        server.get_read_hot_ranges
    }

    async fn send(
        transport: &dyn StorageTransport,
        server: &StorageServerInterface,
        req: Self,
    ) -> Result<Self::Reply> {
        transport.get_read_hot_ranges(server, req).await
    }
}

#[async_trait]
impl StorageRequest for GetRangeSplitPointsRequest {
    type Reply = GetRangeSplitPointsReply;

    fn operation() -> StorageOperation {
        StorageOperation::RangeSplitPoints
    }

    fn endpoint(server: &StorageServerInterface) -> EndpointToken {
        server.get_range_split_points
    }

    async fn send(
        transport: &dyn StorageTransport,
        server: &StorageServerInterface,
        req: Self,
    ) -> Result<Self::Reply> {
        transport.get_range_split_points(server, req).await
    }
}
