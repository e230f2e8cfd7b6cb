//! Transactional client runtime for a meridian key-value cluster.
//!
//! The cluster partitions its key space into shards hosted by storage
//! servers, hands out read versions through GRV proxies, and sequences
//! commits through commit proxies. This crate implements the client side:
//! a [`Database`] context owning the shard-location cache, read-version
//! batchers, watch map, throttle table, and shadow-verification registry,
//! and a [`Transaction`] offering strictly-serializable reads and
//! optimistic commits with a structured retry loop.
//!
//! The wire codec and connection management are not here: the runtime is
//! written against the transport traits in [`meridian_rpc`], so any
//! implementation of those traits (including in-process test fabrics) can
//! back a database.
//!
//! ```no_run
//! # use meridian_client::Database;
//! # use bytes::Bytes;
//! # async fn example(db: Database) -> meridian_client::Result<()> {
//! let mut tr = db.create_transaction();
//! loop {
//!     tr.set(Bytes::from("hello"), Bytes::from("world"))?;
//!     match tr.commit().await {
//!         Ok(_version) => break,
//!         Err(e) => tr.on_error(e).await?,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cluster_file;
pub mod database;
pub mod failure;
pub mod knobs;
pub mod load_balance;
pub mod location_cache;
pub mod metrics;
pub mod options;
pub mod range_stream;
pub mod shard_metrics;
pub mod throttle;
pub mod transaction;
pub mod tss;
pub mod watches;

mod grv;

pub use cluster_file::{ClusterDescriptor, ClusterFile};
pub use database::{Database, DatabaseHealth};
pub use knobs::ClientKnobs;
pub use meridian_rpc::error::{Error, Result, RetryClass};
pub use meridian_rpc::types::{
    Key, KeyRange, KeySelector, KeyValue, MutationType, Priority, RangeLimits, RangeResult,
    Value, Version, Versionstamp, INVALID_VERSION, LATEST_VERSION,
};
pub use options::{DatabaseOption, NetworkOption, TransactionOption};
pub use range_stream::RangeStream;
pub use transaction::{Transaction, TransactionWatch, VersionstampFuture};
pub use tss::{MismatchEvent, MismatchRecord};
pub use watches::Watch;
