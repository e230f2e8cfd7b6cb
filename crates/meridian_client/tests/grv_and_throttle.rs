//! Read-version batching and tag-throttle piggybacking.

mod common;

use common::{key, val, MockCluster};
use meridian_client::{Error, TransactionOption};
use meridian_rpc::messages::TagThrottleLimits;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn concurrent_requests_share_one_grv_rpc() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    // Warm the batcher: the first reply's latency opens a batching window.
    let mut warmup = db.create_transaction();
    warmup.get_read_version().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let before_rpcs = cluster.counters.grv_rpcs.load(Ordering::SeqCst);

    let mut t1 = db.create_transaction();
    let mut t2 = db.create_transaction();
    let mut t3 = db.create_transaction();
    let (v1, v2, v3) = tokio::join!(
        t1.get_read_version(),
        t2.get_read_version(),
        t3.get_read_version()
    );
    let (v1, v2, v3) = (v1.unwrap(), v2.unwrap(), v3.unwrap());

    // All three waiters read the same snapshot.
    assert_eq!(v1, v2);
    assert_eq!(v2, v3);

    // The batcher coalesced them: fewer RPCs than waiters, and at least
    // one request stood for multiple transactions.
    let rpcs = cluster.counters.grv_rpcs.load(Ordering::SeqCst) - before_rpcs;
    assert!(rpcs < 3, "expected coalescing, saw {rpcs} GRV RPCs");
    assert!(cluster.counters.grv_max_count.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn read_version_is_stable_within_a_transaction() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let mut tr = db.create_transaction();
    let first = tr.get_read_version().await.unwrap();

    // Another commit advances the cluster version.
    let mut writer = db.create_transaction();
    writer.set(key("advance"), val("1")).unwrap();
    writer.commit().await.unwrap();

    let second = tr.get_read_version().await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn explicit_read_version_cannot_be_reset() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let mut tr = db.create_transaction();
    tr.set_read_version(1234).unwrap();
    assert_eq!(tr.get_read_version().await.unwrap(), 1234);
    assert_eq!(tr.set_read_version(99), Err(Error::ReadVersionAlreadySet));
}

#[tokio::test]
async fn locked_cluster_rejects_unaware_transactions() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();
    cluster.faults.lock().unwrap().locked = true;

    let mut tr = db.create_transaction();
    assert_eq!(tr.get_read_version().await, Err(Error::DatabaseLocked));

    let mut aware = db.create_transaction();
    aware.set_option(TransactionOption::LockAware).unwrap();
    assert!(aware.get_read_version().await.is_ok());
}

#[tokio::test]
async fn grv_reply_installs_tag_throttles() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    cluster.faults.lock().unwrap().tag_throttles.insert(
        "hot-tenant".to_string(),
        TagThrottleLimits {
            rate: 0.0,
            expiration_secs: 30.0,
        },
    );

    // Carry the tag so the reply's throttle update lands in the table.
    let mut tr = db.create_transaction();
    tr.set_option(TransactionOption::Tag("hot-tenant".into()))
        .unwrap();
    tr.get_read_version().await.unwrap();

    // The next transaction with the same tag is throttled client-side
    // before any RPC.
    cluster.faults.lock().unwrap().tag_throttles.clear();
    let before = cluster.counters.grv_rpcs.load(Ordering::SeqCst);
    let mut throttled = db.create_transaction();
    throttled
        .set_option(TransactionOption::Tag("hot-tenant".into()))
        .unwrap();
    let result = tokio::time::timeout(
        Duration::from_millis(200),
        throttled.get_read_version(),
    )
    .await;
    match result {
        // Either the delay is still pending or the throttle fired.
        Err(_) => {
            assert_eq!(cluster.counters.grv_rpcs.load(Ordering::SeqCst), before);
        }
        Ok(outcome) => assert_eq!(outcome, Err(Error::TagThrottled)),
    }
}
