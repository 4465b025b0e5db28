use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use metrics_util::debugging::DebuggingRecorder;
use sitecache::cache::{
    BuildError, CacheConfig, CacheFactories, CachePolicy, Cacheable, ChangeSource, ChangeTracker,
    ChangesCaches, DataCache, TrackerConfig, handler_fn,
};
use sitecache::domain::changes::{
    ChangeType, CollectionId, EntityId, NewChange, ObjectId, SiteId,
};
use sitecache::infra::memory::MemoryChangeStore;
use sitecache::infra::telemetry;

const PAGES: CollectionId = CollectionId(5);

#[derive(Default)]
struct Menu;

#[async_trait]
impl Cacheable for Menu {
    async fn initialize(
        &mut self,
        _site: Option<SiteId>,
        _object_id: Option<ObjectId>,
    ) -> Result<CachePolicy, BuildError> {
        Ok(CachePolicy::on_change([PAGES]))
    }

    fn expires(&self, _: CollectionId, _: EntityId, _: ChangeType) -> bool {
        true
    }
}

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let store = Arc::new(MemoryChangeStore::new());
    let tracker = ChangeTracker::connect(
        Arc::clone(&store),
        TrackerConfig {
            poll_interval_ms: 60_000,
            drain_interval_ms: 60_000,
            push_enabled: false,
        },
    )
    .await;

    let mut factories = CacheFactories::new();
    factories.register_default::<Menu>();
    let cache = DataCache::new(Arc::new(tracker.clone()), factories, &CacheConfig::default());

    // hit, miss, build
    let site = Some(SiteId(1));
    cache.get::<Menu>(site, None).await.expect("get");
    cache.get::<Menu>(site, None).await.expect("get");

    // failing subscriber, fetch, dispatch, eviction
    tracker
        .subscribe(handler_fn(|_| Err("rejected".into())))
        .await;
    tracker
        .add_change(&mut (), NewChange::new(1, PAGES, ChangeType::Updated).on_site(site))
        .await
        .expect("append");
    tracker.invalidate_now().await.expect("invalidate");

    // change window refresh
    let caches = ChangesCaches::new(store, CacheConfig::default().changes);
    caches.for_site(site).last_change_id().await;
    tracker.shutdown().await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "sitecache_changes_fetched_total",
        "sitecache_changes_dispatched_total",
        "sitecache_subscriber_failures_total",
        "sitecache_dispatch_queue_len",
        "sitecache_poll_ms",
        "sitecache_entry_hit_total",
        "sitecache_entry_miss_total",
        "sitecache_entry_built_total",
        "sitecache_entry_evicted_total",
        "sitecache_changes_refresh_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
