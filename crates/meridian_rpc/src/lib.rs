//! Wire contract for the meridian key-value cluster.
//!
//! This crate holds everything both sides of the client/transport seam need
//! to agree on: the key/value data model, the request and reply messages for
//! every cluster role, the per-role interface descriptors with their stable
//! endpoint tokens, the error taxonomy, and the async transport traits the
//! client runtime is written against. It is kept dependency-light because it
//! is consumed by the runtime, by transport implementations, and by test
//! harnesses alike.

pub mod error;
pub mod interface;
pub mod messages;
pub mod transport;
pub mod types;

pub use error::{Error, Result, RetryClass};
pub use interface::{
    ClusterClientInfo, CommitProxyInterface, EndpointToken, GrvProxyInterface, LocationInfo,
    ServerId, StorageServerInterface,
};
pub use types::{
    Key, KeyRange, KeySelector, KeyValue, Mutation, MutationType, Priority, RangeLimits,
    RangeResult, Tag, Version, Versionstamp, INVALID_VERSION, LATEST_VERSION,
};
