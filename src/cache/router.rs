//! Tenant router: the typed cache consumer API.
//!
//! Every call names its tenant explicitly; `None` selects the tenant-less
//! registry. Registries are created on first reference and live until an
//! external reaper calls [`DataCache::drop_site`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::domain::changes::{ChangeRecord, ObjectId, SiteId};

use super::cacheable::{CacheFactories, Cacheable};
use super::clock::{Clock, SystemClock};
use super::config::CacheConfig;
use super::error::CacheError;
use super::registry::SiteDataCache;
use super::tracker::{ChangeHandler, ChangeSource, HandlerError, Subscription};

/// Multi-tenant object cache kept coherent by a change source.
#[derive(Clone)]
pub struct DataCache {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    factories: CacheFactories,
    global: Arc<SiteDataCache>,
    sites: DashMap<SiteId, Arc<SiteDataCache>>,
    source: Arc<dyn ChangeSource>,
    subscription: OnceCell<Subscription>,
    clock: Arc<dyn Clock>,
    unique_id_attempts: u32,
}

impl DataCache {
    pub fn new(source: Arc<dyn ChangeSource>, factories: CacheFactories, config: &CacheConfig) -> Self {
        Self::with_clock(source, factories, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        source: Arc<dyn ChangeSource>,
        factories: CacheFactories,
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                factories,
                global: Arc::new(SiteDataCache::new(None, Arc::clone(&clock))),
                sites: DashMap::new(),
                source,
                subscription: OnceCell::new(),
                clock,
                unique_id_attempts: config.unique_id_attempts(),
            }),
        }
    }

    /// Cached `T` for `(site, object_id)`, constructing it on a miss.
    pub async fn get<T: Cacheable>(
        &self,
        site: Option<SiteId>,
        object_id: Option<ObjectId>,
    ) -> Result<Arc<T>, CacheError> {
        self.registry(site)
            .await
            .get::<T>(&self.inner.factories, object_id)
            .await
    }

    /// Cached `T` for `(site, object_id)` if present; never constructs.
    pub async fn get_existing<T: Cacheable>(
        &self,
        site: Option<SiteId>,
        object_id: Option<ObjectId>,
    ) -> Result<Option<Arc<T>>, CacheError> {
        self.registry(site).await.get_existing::<T>(object_id).await
    }

    pub async fn get_global<T: Cacheable>(
        &self,
        object_id: Option<ObjectId>,
    ) -> Result<Arc<T>, CacheError> {
        self.get::<T>(None, object_id).await
    }

    pub async fn get_existing_global<T: Cacheable>(
        &self,
        object_id: Option<ObjectId>,
    ) -> Result<Option<Arc<T>>, CacheError> {
        self.get_existing::<T>(None, object_id).await
    }

    /// Evict `T` for `(site, object_id)`; a missing entry is not an error.
    pub async fn expire<T: Cacheable>(
        &self,
        site: Option<SiteId>,
        object_id: Option<ObjectId>,
    ) -> Result<bool, CacheError> {
        self.registry(site).await.expire::<T>(object_id).await
    }

    pub async fn expire_global<T: Cacheable>(
        &self,
        object_id: Option<ObjectId>,
    ) -> Result<bool, CacheError> {
        self.expire::<T>(None, object_id).await
    }

    /// Build and cache `T` under a fresh random object id.
    pub async fn create_with_unique_id<T: Cacheable>(
        &self,
        site: Option<SiteId>,
    ) -> Result<(ObjectId, Arc<T>), CacheError> {
        self.registry(site)
            .await
            .create_with_unique_id::<T>(&self.inner.factories, self.inner.unique_id_attempts)
            .await
    }

    pub async fn create_with_unique_id_global<T: Cacheable>(
        &self,
    ) -> Result<(ObjectId, Arc<T>), CacheError> {
        self.create_with_unique_id::<T>(None).await
    }

    /// Tenants whose registry has not been touched for at least `idle_for`.
    pub fn idle_sites(&self, idle_for: Duration) -> Vec<SiteId> {
        let Ok(idle_for) = time::Duration::try_from(idle_for) else {
            return Vec::new();
        };
        let now = self.inner.clock.now();
        self.inner
            .sites
            .iter()
            .filter(|entry| now - entry.value().last_access() >= idle_for)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Discard a tenant's registry and everything cached in it.
    pub fn drop_site(&self, site: SiteId) -> bool {
        let dropped = self.inner.sites.remove(&site).is_some();
        if dropped {
            info!(site_id = %site, "Tenant cache registry dropped");
        }
        dropped
    }

    /// Number of live tenant registries, excluding the tenant-less one.
    pub fn site_count(&self) -> usize {
        self.inner.sites.len()
    }

    async fn registry(&self, site: Option<SiteId>) -> Arc<SiteDataCache> {
        self.ensure_subscribed().await;
        self.inner.registry(site)
    }

    async fn ensure_subscribed(&self) {
        let inner = &self.inner;
        inner
            .subscription
            .get_or_init(|| async {
                let handler: Arc<dyn ChangeHandler> = Arc::new(RouterSubscriber {
                    router: Arc::downgrade(inner),
                });
                let subscription = inner.source.subscribe(handler).await;
                debug!(subscription = subscription.id(), "Data cache subscribed to changes");
                subscription
            })
            .await;
    }
}

impl RouterInner {
    fn registry(&self, site: Option<SiteId>) -> Arc<SiteDataCache> {
        match site {
            None => Arc::clone(&self.global),
            Some(site) => {
                let entry = self.sites.entry(site).or_insert_with(|| {
                    debug!(site_id = %site, "Tenant cache registry created");
                    Arc::new(SiteDataCache::new(Some(site), Arc::clone(&self.clock)))
                });
                Arc::clone(entry.value())
            }
        }
    }

    /// Tenant-less records reach every registry; tenant records only their own.
    fn targets(&self, record: &ChangeRecord) -> Vec<Arc<SiteDataCache>> {
        match record.site_id {
            Some(site) => self
                .sites
                .get(&site)
                .map(|entry| vec![Arc::clone(entry.value())])
                .unwrap_or_default(),
            None => std::iter::once(Arc::clone(&self.global))
                .chain(self.sites.iter().map(|entry| Arc::clone(entry.value())))
                .collect(),
        }
    }
}

impl Drop for RouterInner {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get() {
            self.source.unsubscribe(*subscription);
        }
    }
}

struct RouterSubscriber {
    router: Weak<RouterInner>,
}

#[async_trait]
impl ChangeHandler for RouterSubscriber {
    async fn on_change(&self, change: &ChangeRecord) -> Result<(), HandlerError> {
        let Some(router) = self.router.upgrade() else {
            return Ok(());
        };
        for registry in router.targets(change) {
            registry.on_change(change).await;
        }
        Ok(())
    }
}
