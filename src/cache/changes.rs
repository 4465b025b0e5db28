//! Rolling per-tenant window of recent change records.
//!
//! Serves "what changed in this collection since cursor X" for incremental
//! sync. It is a read index only: it pulls from the store on read when the
//! refresh interval has elapsed and never takes part in eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use metrics::histogram;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::application::repos::{ChangeQuery, ChangeReader};
use crate::domain::changes::{ChangeId, ChangeRecord, CollectionId, SiteId};

use super::clock::{Clock, SystemClock};
use super::config::ChangesConfig;

const METRIC_REFRESH_MS: &str = "sitecache_changes_refresh_ms";

/// Predicate applied by [`ChangesCache::get_collection_changes`].
pub type ChangeFilter<'a> = &'a (dyn Fn(&ChangeRecord) -> bool + Send + Sync);

#[derive(Debug)]
struct CollectionWindow {
    records: Vec<ChangeRecord>,
    oldest: OffsetDateTime,
}

impl CollectionWindow {
    fn new(first: &ChangeRecord) -> Self {
        Self {
            records: Vec::new(),
            oldest: first.created,
        }
    }

    fn push(&mut self, record: ChangeRecord, cutoff: OffsetDateTime) {
        self.oldest = self.oldest.min(record.created);
        self.records.push(record);

        // Timestamps may arrive out of id order, so prune by scan.
        if self.oldest <= cutoff {
            self.records.retain(|record| record.created > cutoff);
            self.oldest = self
                .records
                .iter()
                .map(|record| record.created)
                .min()
                .unwrap_or(cutoff);
        }
    }
}

#[derive(Debug, Default)]
struct Window {
    collections: HashMap<CollectionId, CollectionWindow>,
    last_id: Option<ChangeId>,
    last_refresh: Option<OffsetDateTime>,
}

/// Change window of a single tenant.
pub struct ChangesCache {
    site: Option<SiteId>,
    reader: Arc<dyn ChangeReader>,
    clock: Arc<dyn Clock>,
    config: ChangesConfig,
    window: RwLock<Window>,
}

impl ChangesCache {
    pub fn new(
        site: Option<SiteId>,
        reader: Arc<dyn ChangeReader>,
        clock: Arc<dyn Clock>,
        config: ChangesConfig,
    ) -> Self {
        Self {
            site,
            reader,
            clock,
            config,
            window: RwLock::new(Window::default()),
        }
    }

    pub fn site(&self) -> Option<SiteId> {
        self.site
    }

    /// Retained changes of `collection` with `from < id <= to`, in no
    /// particular order. `None` when the collection was never observed.
    pub async fn get_collection_changes(
        &self,
        collection: CollectionId,
        from: Option<ChangeId>,
        to: Option<ChangeId>,
        filter: Option<ChangeFilter<'_>>,
    ) -> Option<Vec<ChangeRecord>> {
        let now = self.refresh_if_due().await;
        let cutoff = self.cutoff(now);

        let window = self.window.read().await;
        let collection = window.collections.get(&collection)?;
        Some(
            collection
                .records
                .iter()
                .filter(|record| record.created > cutoff)
                .filter(|record| from.is_none_or(|from| record.id > from))
                .filter(|record| to.is_none_or(|to| record.id <= to))
                .filter(|record| filter.is_none_or(|filter| filter(*record)))
                .cloned()
                .collect(),
        )
    }

    /// Highest change id observed for this tenant.
    pub async fn last_change_id(&self) -> Option<ChangeId> {
        self.refresh_if_due().await;
        self.window.read().await.last_id
    }

    async fn refresh_if_due(&self) -> OffsetDateTime {
        let now = self.clock.now();
        if !self.is_due(&*self.window.read().await, now) {
            return now;
        }

        let mut window = self.window.write().await;
        if self.is_due(&window, now) {
            self.refresh(&mut window, now).await;
        }
        now
    }

    fn is_due(&self, window: &Window, now: OffsetDateTime) -> bool {
        window.last_refresh.is_none_or(|last| {
            time::Duration::try_from(self.config.refresh_interval())
                .is_ok_and(|interval| now - last >= interval)
        })
    }

    fn cutoff(&self, now: OffsetDateTime) -> OffsetDateTime {
        time::Duration::try_from(self.config.retention())
            .ok()
            .and_then(|retention| now.checked_sub(retention))
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    async fn refresh(&self, window: &mut Window, now: OffsetDateTime) {
        let started_at = Instant::now();
        let cutoff = self.cutoff(now);

        let mut query = ChangeQuery::default()
            .for_site(self.site)
            .created_after(cutoff);
        query.since_id = window.last_id;

        match self.reader.query(&query).await {
            Ok(mut records) => {
                records.sort_unstable_by_key(|record| record.id);
                let fetched = records.len();
                for record in records {
                    window.last_id = Some(window.last_id.map_or(record.id, |last| last.max(record.id)));
                    window
                        .collections
                        .entry(record.collection_id)
                        .or_insert_with(|| CollectionWindow::new(&record))
                        .push(record, cutoff);
                }
                if fetched > 0 {
                    debug!(
                        site_id = ?self.site,
                        fetched,
                        last_id = window.last_id,
                        "Change window refreshed"
                    );
                }
            }
            Err(err) => {
                warn!(
                    site_id = ?self.site,
                    error = %err,
                    "Change window refresh failed; serving retained records"
                );
            }
        }

        window.last_refresh = Some(now);
        histogram!(METRIC_REFRESH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
    }
}

/// Lazily created change windows, one per tenant.
pub struct ChangesCaches {
    reader: Arc<dyn ChangeReader>,
    clock: Arc<dyn Clock>,
    config: ChangesConfig,
    caches: DashMap<Option<SiteId>, Arc<ChangesCache>>,
}

impl ChangesCaches {
    pub fn new(reader: Arc<dyn ChangeReader>, config: ChangesConfig) -> Self {
        Self::with_clock(reader, config, Arc::new(SystemClock))
    }

    pub fn with_clock(reader: Arc<dyn ChangeReader>, config: ChangesConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            reader,
            clock,
            config,
            caches: DashMap::new(),
        }
    }

    pub fn for_site(&self, site: Option<SiteId>) -> Arc<ChangesCache> {
        let entry = self.caches.entry(site).or_insert_with(|| {
            Arc::new(ChangesCache::new(
                site,
                Arc::clone(&self.reader),
                Arc::clone(&self.clock),
                self.config.clone(),
            ))
        });
        Arc::clone(entry.value())
    }
}
