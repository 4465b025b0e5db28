//! Postgres change store tests.
//!
//! - Require `DATABASE_URL` pointing at a disposable Postgres instance.
//! - Marked `#[ignore]`; run with `cargo test -- --ignored`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sitecache::application::repos::{ChangeQuery, ChangeReader};
use sitecache::cache::{ChangeSource, ChangeTracker, TrackerConfig, TrackerMode, handler_fn};
use sitecache::domain::changes::{
    ChangeId, ChangeRecord, ChangeType, CollectionId, NewChange, SiteId, UserId,
};
use sitecache::infra::db::PostgresChangeStore;
use sqlx::PgPool;

fn tracker_config() -> TrackerConfig {
    TrackerConfig {
        poll_interval_ms: 60_000,
        drain_interval_ms: 20,
        push_enabled: true,
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn appends_are_transactional(pool: PgPool) {
    let store = Arc::new(PostgresChangeStore::new(pool));
    let tracker = ChangeTracker::new(Arc::clone(&store), tracker_config());

    let mut tx = store.begin().await.expect("begin");
    tracker
        .add_change(&mut tx, NewChange::new(1, CollectionId(1), ChangeType::Added))
        .await
        .expect("append");
    tx.rollback().await.expect("rollback");
    assert_eq!(store.latest_id().await.expect("latest"), None);

    let mut tx = store.begin().await.expect("begin");
    let id = tracker
        .add_change(
            &mut tx,
            NewChange::new(2, CollectionId(1), ChangeType::Updated)
                .by(Some(UserId(3)))
                .on_site(Some(SiteId(4))),
        )
        .await
        .expect("append");
    tx.commit().await.expect("commit");

    let records = store
        .query(&ChangeQuery::default().for_site(Some(SiteId(4))))
        .await
        .expect("query");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].user_id, Some(UserId(3)));
    assert_eq!(records[0].change_type, ChangeType::Updated);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn notifications_drive_delivery(pool: PgPool) {
    let store = Arc::new(PostgresChangeStore::new(pool));
    let tracker = ChangeTracker::connect(Arc::clone(&store), tracker_config()).await;

    let seen = Arc::new(Mutex::new(Vec::<ChangeId>::new()));
    let sink = Arc::clone(&seen);
    tracker
        .subscribe(handler_fn(move |record: &ChangeRecord| {
            sink.lock().expect("sink lock").push(record.id);
            Ok(())
        }))
        .await;
    assert_eq!(tracker.mode(), TrackerMode::Push);

    let mut tx = store.begin().await.expect("begin");
    let id = tracker
        .add_change(&mut tx, NewChange::new(5, CollectionId(2), ChangeType::Removed))
        .await
        .expect("append");
    tx.commit().await.expect("commit");

    for _ in 0..200 {
        if !seen.lock().expect("sink lock").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*seen.lock().expect("sink lock"), vec![id]);
    tracker.shutdown().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn late_commit_of_lower_id_is_still_delivered(pool: PgPool) {
    let store = Arc::new(PostgresChangeStore::new(pool));
    let config = TrackerConfig {
        poll_interval_ms: 60_000,
        drain_interval_ms: 60_000,
        push_enabled: false,
    };
    let tracker = ChangeTracker::connect(Arc::clone(&store), config).await;

    let seen = Arc::new(Mutex::new(Vec::<ChangeId>::new()));
    let sink = Arc::clone(&seen);
    tracker
        .subscribe(handler_fn(move |record: &ChangeRecord| {
            sink.lock().expect("sink lock").push(record.id);
            Ok(())
        }))
        .await;

    let mut slow = store.begin().await.expect("begin");
    let slow_id = tracker
        .add_change(&mut slow, NewChange::new(1, CollectionId(3), ChangeType::Updated))
        .await
        .expect("append");

    let fast_store = Arc::clone(&store);
    let fast_tracker = tracker.clone();
    let fast = tokio::spawn(async move {
        let mut tx = fast_store.begin().await.expect("begin");
        let id = fast_tracker
            .add_change(&mut tx, NewChange::new(2, CollectionId(3), ChangeType::Updated))
            .await
            .expect("append");
        tx.commit().await.expect("commit");
        id
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!fast.is_finished(), "second writer must wait for the first");
    tracker.invalidate_now().await.expect("invalidate");
    assert!(seen.lock().expect("sink lock").is_empty());

    slow.commit().await.expect("commit");
    let fast_id = fast.await.expect("fast writer");
    assert!(slow_id < fast_id);

    tracker.invalidate_now().await.expect("invalidate");
    assert_eq!(*seen.lock().expect("sink lock"), vec![slow_id, fast_id]);
    tracker.shutdown().await;
}
