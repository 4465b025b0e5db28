//! Retention windowing of the per-tenant changes cache.

use std::sync::Arc;

use sitecache::cache::{ChangesCaches, ChangesConfig, Clock, ManualClock};
use sitecache::domain::changes::{ChangeId, ChangeType, CollectionId, NewChange, SiteId};
use sitecache::infra::memory::MemoryChangeStore;
use time::{Duration, OffsetDateTime};

const ARTICLES: CollectionId = CollectionId(8);

fn start() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::days(30)
}

fn config() -> ChangesConfig {
    ChangesConfig {
        retention_secs: 24 * 60 * 60,
        refresh_interval_ms: 500,
    }
}

fn seed(store: &MemoryChangeStore, site: SiteId, entity: i64, created: OffsetDateTime) -> ChangeId {
    store
        .insert(
            NewChange::new(entity, ARTICLES, ChangeType::Updated).on_site(Some(site)),
            created,
        )
        .id
}

#[tokio::test]
async fn entries_outside_retention_are_not_returned() {
    let clock = Arc::new(ManualClock::new(start()));
    let store = Arc::new(MemoryChangeStore::with_clock(clock.clone()));
    let site = SiteId(1);

    let now = clock.now();
    let t0 = seed(&store, site, 1, now - Duration::hours(25));
    let t1 = seed(&store, site, 2, now - Duration::hours(20));
    let t2 = seed(&store, site, 3, now - Duration::hours(2));
    let t3 = seed(&store, site, 4, now - Duration::minutes(1));

    let caches = ChangesCaches::with_clock(store.clone(), config(), clock.clone());
    let window = caches.for_site(Some(site));

    let mut ids: Vec<ChangeId> = window
        .get_collection_changes(ARTICLES, None, None, None)
        .await
        .expect("collection observed")
        .into_iter()
        .map(|record| record.id)
        .collect();
    ids.sort_unstable();

    assert!(!ids.contains(&t0));
    assert_eq!(ids, vec![t1, t2, t3]);
}

#[tokio::test]
async fn window_slides_as_time_passes() {
    let clock = Arc::new(ManualClock::new(start()));
    let store = Arc::new(MemoryChangeStore::with_clock(clock.clone()));
    let site = SiteId(2);

    let now = clock.now();
    let older = seed(&store, site, 1, now - Duration::hours(23));
    let newer = seed(&store, site, 2, now - Duration::hours(1));

    let caches = ChangesCaches::with_clock(store.clone(), config(), clock.clone());
    let window = caches.for_site(Some(site));
    assert_eq!(
        window
            .get_collection_changes(ARTICLES, None, None, None)
            .await
            .expect("observed")
            .len(),
        2
    );

    clock.advance(Duration::hours(2));
    let latest = seed(&store, site, 3, clock.now());

    let ids: Vec<ChangeId> = window
        .get_collection_changes(ARTICLES, None, None, None)
        .await
        .expect("observed")
        .into_iter()
        .map(|record| record.id)
        .collect();

    assert!(!ids.contains(&older));
    assert!(ids.contains(&newer));
    assert!(ids.contains(&latest));
    assert_eq!(window.last_change_id().await, Some(latest));
}

#[tokio::test]
async fn cursor_range_selects_incremental_changes() {
    let clock = Arc::new(ManualClock::new(start()));
    let store = Arc::new(MemoryChangeStore::with_clock(clock.clone()));
    let site = SiteId(3);
    let now = clock.now();
    let ids: Vec<ChangeId> = (1..=5).map(|entity| seed(&store, site, entity, now)).collect();

    let caches = ChangesCaches::with_clock(store.clone(), config(), clock.clone());
    let window = caches.for_site(Some(site));

    let mut since: Vec<ChangeId> = window
        .get_collection_changes(ARTICLES, Some(ids[2]), None, None)
        .await
        .expect("observed")
        .into_iter()
        .map(|record| record.id)
        .collect();
    since.sort_unstable();
    assert_eq!(since, vec![ids[3], ids[4]]);

    assert!(
        window
            .get_collection_changes(CollectionId(99), None, None, None)
            .await
            .is_none()
    );
}
