//! Watch arming, sharing, and version-ABA behavior.

mod common;

use common::{eventually, key, val, MockCluster};
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn watch_fires_when_another_transaction_changes_the_key() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let mut tr = db.create_transaction();
    tr.set(key("door"), val("closed")).unwrap();
    tr.commit().await.unwrap();

    let mut tr = db.create_transaction();
    let current = tr.get(key("door"), false).await.unwrap();
    let watch = tr.watch(key("door"), current).unwrap();
    tr.commit().await.unwrap();

    let waiter = tokio::spawn(watch.changed());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    let mut writer = db.create_transaction();
    writer.set(key("door"), val("open")).unwrap();
    let commit_version = writer.commit().await.unwrap();

    let fired_at = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("watch should fire")
        .unwrap()
        .unwrap();
    assert!(fired_at >= commit_version);
}

#[tokio::test]
async fn watchers_of_one_key_share_a_single_server_watch() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let mut tr = db.create_transaction();
    tr.set(key("shared"), val("v")).unwrap();
    tr.commit().await.unwrap();

    let mut watches = Vec::new();
    for _ in 0..5 {
        let mut tr = db.create_transaction();
        let current = tr.get(key("shared"), false).await.unwrap();
        let watch = tr.watch(key("shared"), current).unwrap();
        tr.commit().await.unwrap();
        watches.push(tokio::spawn(watch.changed()));
    }

    eventually(|| db.watch_count() == 1, "watch map to coalesce").await;

    let mut writer = db.create_transaction();
    writer.set(key("shared"), val("v2")).unwrap();
    writer.commit().await.unwrap();

    for w in watches {
        tokio::time::timeout(Duration::from_secs(5), w)
            .await
            .expect("shared watch should fire")
            .unwrap()
            .unwrap();
    }
    eventually(|| db.watch_count() == 0, "watch map to drain").await;
}

#[tokio::test]
async fn stale_server_reply_does_not_resolve_a_newer_watch() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let mut tr = db.create_transaction();
    tr.set(key("aba"), val("B")).unwrap();
    tr.commit().await.unwrap();

    // The server's first watch answer reports an old change version, as
    // if it raced a watch armed by an earlier incarnation of this key.
    cluster.faults.lock().unwrap().watch_fire_once = Some(12);

    let mut tr = db.create_transaction();
    let current = tr.get(key("aba"), false).await.unwrap();
    assert_eq!(current, Some(val("B")));
    let watch = tr.watch(key("aba"), current).unwrap();
    tr.commit().await.unwrap();

    let waiter = tokio::spawn(watch.changed());

    // The stale reply must be swallowed: the watch stays armed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert_eq!(db.watch_count(), 1);
    assert!(cluster.counters.watch_rpcs.load(Ordering::SeqCst) >= 2);

    // A real change still fires it.
    let mut writer = db.create_transaction();
    writer.set(key("aba"), val("C")).unwrap();
    writer.commit().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("watch should fire after a real change")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn commit_failure_cancels_pending_watches() {
    let cluster = MockCluster::single_shard();
    let db = cluster.database();

    let mut tr = db.create_transaction();
    tr.set(key("w"), val("0")).unwrap();
    tr.commit().await.unwrap();

    // A conflicting transaction whose watch never arms.
    let mut t1 = db.create_transaction();
    let seen = t1.get(key("w"), false).await.unwrap();
    let watch = t1.watch(key("w"), seen.clone()).unwrap();

    let mut t2 = db.create_transaction();
    t2.set(key("w"), val("1")).unwrap();
    t2.commit().await.unwrap();

    t1.set(key("w"), val("2")).unwrap();
    assert!(t1.commit().await.is_err());

    let outcome = tokio::time::timeout(Duration::from_secs(1), watch.changed())
        .await
        .expect("cancelled watch resolves promptly");
    assert!(outcome.is_err());
}
