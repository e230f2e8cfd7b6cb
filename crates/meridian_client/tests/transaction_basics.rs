//! Reads, writes, selectors, and size boundaries against the mock fabric.

mod common;

use bytes::Bytes;
use common::{key, range, val, MockCluster};
use meridian_client::{Error, KeySelector, MutationType, RangeLimits, TransactionOption};
use meridian_rpc::types::all_keys_end;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn set_then_get_across_transactions() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let mut tr = db.create_transaction();
    tr.set(key("hello"), val("world")).unwrap();
    let committed = tr.commit().await.unwrap();
    assert!(committed > 0);
    assert_eq!(tr.committed_version(), committed);

    let mut tr = db.create_transaction();
    let got = tr.get(key("hello"), false).await.unwrap();
    assert_eq!(got, Some(val("world")));
    let missing = tr.get(key("nothing"), false).await.unwrap();
    assert_eq!(missing, None);
}

#[tokio::test]
async fn get_range_returns_sorted_committed_writes() {
    let cluster = MockCluster::with_splits(&["g", "p"]);
    let db = cluster.database();

    let mut tr = db.create_transaction();
    for k in ["d", "a", "x", "m", "q", "b"] {
        tr.set(key(k), val(k)).unwrap();
    }
    tr.commit().await.unwrap();

    let mut tr = db.create_transaction();
    let result = tr
        .get_range(
            KeySelector::first_greater_or_equal(key("a")),
            KeySelector::first_greater_or_equal(key("z")),
            RangeLimits::default(),
            false,
            false,
        )
        .await
        .unwrap();
    let keys: Vec<_> = result.kvs.iter().map(|kv| kv.key.clone()).collect();
    assert_eq!(
        keys,
        vec![key("a"), key("b"), key("d"), key("m"), key("q"), key("x")]
    );
    assert!(!result.more);

    // Reverse iteration sees the same keys backwards.
    let result = tr
        .get_range(
            KeySelector::first_greater_or_equal(key("a")),
            KeySelector::first_greater_or_equal(key("z")),
            RangeLimits::default(),
            false,
            true,
        )
        .await
        .unwrap();
    let reversed: Vec<_> = result.kvs.iter().map(|kv| kv.key.clone()).collect();
    assert_eq!(reversed.first(), Some(&key("x")));
    assert_eq!(reversed.last(), Some(&key("a")));
}

#[tokio::test]
async fn range_limits_truncate_and_report_more() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let mut tr = db.create_transaction();
    for i in 0..10 {
        tr.set(key(&format!("row/{i}")), val("v")).unwrap();
    }
    tr.commit().await.unwrap();

    let mut tr = db.create_transaction();
    let result = tr
        .get_range(
            KeySelector::first_greater_or_equal(key("row/")),
            KeySelector::first_greater_or_equal(key("row0")),
            RangeLimits::rows(4),
            false,
            false,
        )
        .await
        .unwrap();
    assert_eq!(result.len(), 4);
    assert!(result.more);
}

#[tokio::test]
async fn empty_range_makes_no_rpc() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let mut tr = db.create_transaction();
    let before = cluster.counters.get_range_rpcs.load(Ordering::SeqCst);
    let result = tr
        .get_range(
            KeySelector::first_greater_or_equal(key("z")),
            KeySelector::first_greater_or_equal(key("a")),
            RangeLimits::default(),
            false,
            false,
        )
        .await
        .unwrap();
    assert!(result.is_empty());
    assert_eq!(
        cluster.counters.get_range_rpcs.load(Ordering::SeqCst),
        before
    );
}

#[tokio::test]
async fn selectors_clamp_at_key_space_edges() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let mut tr = db.create_transaction();
    tr.set(key("only"), val("1")).unwrap();
    tr.commit().await.unwrap();

    let mut tr = db.create_transaction();
    // Positive offset pinned to the end of the key space.
    let resolved = tr
        .get_key(KeySelector::new(all_keys_end(), false, 2), false)
        .await
        .unwrap();
    assert_eq!(resolved, all_keys_end());

    // Non-positive offset at the beginning resolves to the empty key.
    let resolved = tr
        .get_key(KeySelector::new(Bytes::new(), false, 0), false)
        .await
        .unwrap();
    assert_eq!(resolved, Bytes::new());
}

#[tokio::test]
async fn get_key_resolves_selectors() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let mut tr = db.create_transaction();
    for k in ["a", "c", "e"] {
        tr.set(key(k), val(k)).unwrap();
    }
    tr.commit().await.unwrap();

    let mut tr = db.create_transaction();
    assert_eq!(
        tr.get_key(KeySelector::first_greater_or_equal(key("b")), false)
            .await
            .unwrap(),
        key("c")
    );
    assert_eq!(
        tr.get_key(KeySelector::first_greater_than(key("c")), false)
            .await
            .unwrap(),
        key("e")
    );
    assert_eq!(
        tr.get_key(KeySelector::last_less_than(key("c")), false)
            .await
            .unwrap(),
        key("a")
    );
    assert_eq!(
        tr.get_key(KeySelector::last_less_or_equal(key("c")), false)
            .await
            .unwrap(),
        key("c")
    );
}

#[tokio::test]
async fn oversize_keys_and_values_are_rejected() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();
    let knobs = db.knobs().clone();

    let mut tr = db.create_transaction();
    let big_key = Bytes::from(vec![b'k'; knobs.key_size_limit + 1]);
    assert_eq!(tr.set(big_key, val("v")), Err(Error::KeyTooLarge));

    let big_value = Bytes::from(vec![b'v'; knobs.value_size_limit + 1]);
    assert_eq!(tr.set(key("k"), big_value), Err(Error::ValueTooLarge));
}

#[tokio::test]
async fn size_limit_fails_commit_with_transaction_too_large() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let mut tr = db.create_transaction();
    tr.set_option(TransactionOption::SizeLimit(64)).unwrap();
    tr.set(key("a"), Bytes::from(vec![b'x'; 128])).unwrap();
    assert_eq!(tr.commit().await, Err(Error::TransactionTooLarge));
}

#[tokio::test]
async fn clear_range_removes_committed_keys() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let mut tr = db.create_transaction();
    for k in ["p/1", "p/2", "q/1"] {
        tr.set(key(k), val("v")).unwrap();
    }
    tr.commit().await.unwrap();

    let mut tr = db.create_transaction();
    tr.clear_range(range("p/", "p0")).unwrap();
    tr.commit().await.unwrap();

    let mut tr = db.create_transaction();
    assert_eq!(tr.get(key("p/1"), false).await.unwrap(), None);
    assert_eq!(tr.get(key("p/2"), false).await.unwrap(), None);
    assert_eq!(tr.get(key("q/1"), false).await.unwrap(), Some(val("v")));
}

#[tokio::test]
async fn atomic_add_is_server_evaluated() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    for _ in 0..3 {
        let mut tr = db.create_transaction();
        tr.atomic_op(
            key("counter"),
            Bytes::copy_from_slice(&2u64.to_le_bytes()),
            MutationType::Add,
        )
        .unwrap();
        tr.commit().await.unwrap();
    }

    let mut tr = db.create_transaction();
    let raw = tr.get(key("counter"), false).await.unwrap().unwrap();
    assert_eq!(u64::from_le_bytes(raw[..8].try_into().unwrap()), 6);
}

#[tokio::test]
async fn wrong_shard_read_retries_after_invalidation() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let mut tr = db.create_transaction();
    tr.set(key("moved"), val("here")).unwrap();
    tr.commit().await.unwrap();

    cluster
        .faults
        .lock()
        .unwrap()
        .wrong_shard_keys
        .insert(b"moved".to_vec());

    let mut tr = db.create_transaction();
    let got = tr.get(key("moved"), false).await.unwrap();
    assert_eq!(got, Some(val("here")));
}

#[tokio::test]
async fn system_keys_need_an_option() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let system_key = Bytes::from_static(b"\xff/anything");
    let mut tr = db.create_transaction();
    assert_eq!(
        tr.get(system_key.clone(), false).await.err(),
        Some(Error::SystemKeyAccessDenied)
    );
    assert_eq!(
        tr.set(system_key.clone(), val("x")),
        Err(Error::SystemKeyAccessDenied)
    );

    let mut tr = db.create_transaction();
    tr.set_option(TransactionOption::AccessSystemKeys).unwrap();
    tr.set(system_key, val("x")).unwrap();
    tr.commit().await.unwrap();
}
