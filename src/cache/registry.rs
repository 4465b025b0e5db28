//! Per-tenant cache registry.
//!
//! Holds the keyed entries of one tenant plus a secondary index from each
//! handled collection to the entries it can invalidate. Both maps sit behind a
//! single async mutex, so `get`, `expire` and `on_change` never interleave and
//! the index always mirrors the entries exactly.
//!
//! The mutex is held across construction, which makes construction of a key
//! at-most-once. A type whose `initialize` reaches back into the same
//! registry would deadlock; cacheable types must not do that.

use std::any::{TypeId, type_name};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use metrics::counter;
use rand::Rng;
use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::domain::changes::{ChangeRecord, CollectionId, ObjectId, SiteId};

use super::cacheable::{CacheFactories, Cacheable, CachedObject, Keying};
use super::clock::Clock;
use super::error::CacheError;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::registry";
const METRIC_HIT: &str = "sitecache_entry_hit_total";
const METRIC_MISS: &str = "sitecache_entry_miss_total";
const METRIC_BUILT: &str = "sitecache_entry_built_total";
const METRIC_EVICTED: &str = "sitecache_entry_evicted_total";

#[derive(Debug, Clone, Copy)]
struct EntryKey {
    type_id: TypeId,
    type_name: &'static str,
    object_id: Option<ObjectId>,
}

impl EntryKey {
    fn of<T: Cacheable>(object_id: Option<ObjectId>) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            object_id,
        }
    }
}

impl PartialEq for EntryKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.object_id == other.object_id
    }
}

impl Eq for EntryKey {}

impl Hash for EntryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.object_id.hash(state);
    }
}

struct CacheEntry {
    object: Arc<dyn CachedObject>,
    handled: Vec<CollectionId>,
    expires_at: Option<OffsetDateTime>,
}

impl CacheEntry {
    fn is_stale(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Entries {
    by_key: HashMap<EntryKey, CacheEntry>,
    by_collection: HashMap<CollectionId, HashSet<EntryKey>>,
}

impl Entries {
    /// Live entry for `key`; a stale one is evicted and reported as absent.
    fn lookup(&mut self, key: &EntryKey, now: OffsetDateTime) -> Option<Arc<dyn CachedObject>> {
        let stale = self.by_key.get(key)?.is_stale(now);
        if stale {
            self.remove(key);
            counter!(METRIC_EVICTED, "reason" => "ttl").increment(1);
            debug!(type_name = key.type_name, object_id = ?key.object_id, "Cache entry outlived its ttl");
            return None;
        }
        self.by_key.get(key).map(|entry| Arc::clone(&entry.object))
    }

    fn insert(&mut self, key: EntryKey, entry: CacheEntry) {
        // Re-inserting a key replaces its index registrations instead of adding to them.
        self.remove(&key);
        for collection in &entry.handled {
            self.by_collection.entry(*collection).or_default().insert(key);
        }
        self.by_key.insert(key, entry);
    }

    fn remove(&mut self, key: &EntryKey) -> bool {
        let Some(entry) = self.by_key.remove(key) else {
            return false;
        };
        for collection in &entry.handled {
            if let Some(keys) = self.by_collection.get_mut(collection) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_collection.remove(collection);
                }
            }
        }
        true
    }
}

/// Cache entries of one tenant; `site == None` is the tenant-less registry.
pub struct SiteDataCache {
    site: Option<SiteId>,
    clock: Arc<dyn Clock>,
    last_access: Mutex<OffsetDateTime>,
    entries: AsyncMutex<Entries>,
}

impl SiteDataCache {
    pub fn new(site: Option<SiteId>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            site,
            clock,
            last_access: Mutex::new(now),
            entries: AsyncMutex::new(Entries::default()),
        }
    }

    pub fn site(&self) -> Option<SiteId> {
        self.site
    }

    /// When a lookup last touched this registry.
    pub fn last_access(&self) -> OffsetDateTime {
        *mutex_lock(&self.last_access, SOURCE, "last_access")
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.by_key.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cached `T` for `object_id`, constructing it on a miss.
    pub async fn get<T: Cacheable>(
        &self,
        factories: &CacheFactories,
        object_id: Option<ObjectId>,
    ) -> Result<Arc<T>, CacheError> {
        check_keying::<T>(object_id)?;
        self.touch();

        let key = EntryKey::of::<T>(object_id);
        let mut entries = self.entries.lock().await;
        if let Some(object) = entries.lookup(&key, self.clock.now()) {
            counter!(METRIC_HIT).increment(1);
            return downcast::<T>(object);
        }
        counter!(METRIC_MISS).increment(1);

        self.build::<T>(&mut entries, factories, key).await
    }

    /// Cached `T` for `object_id`, or `None` without constructing.
    pub async fn get_existing<T: Cacheable>(
        &self,
        object_id: Option<ObjectId>,
    ) -> Result<Option<Arc<T>>, CacheError> {
        check_keying::<T>(object_id)?;
        self.touch();

        let key = EntryKey::of::<T>(object_id);
        let mut entries = self.entries.lock().await;
        match entries.lookup(&key, self.clock.now()) {
            Some(object) => {
                counter!(METRIC_HIT).increment(1);
                downcast::<T>(object).map(Some)
            }
            None => {
                counter!(METRIC_MISS).increment(1);
                Ok(None)
            }
        }
    }

    /// Evict `T` for `object_id`. Returns whether an entry was removed.
    pub async fn expire<T: Cacheable>(&self, object_id: Option<ObjectId>) -> Result<bool, CacheError> {
        check_keying::<T>(object_id)?;

        let key = EntryKey::of::<T>(object_id);
        let removed = self.entries.lock().await.remove(&key);
        if removed {
            counter!(METRIC_EVICTED, "reason" => "explicit").increment(1);
            debug!(
                site_id = ?self.site,
                type_name = key.type_name,
                object_id = ?object_id,
                "Cache entry expired"
            );
        }
        Ok(removed)
    }

    /// Construct `T` under a fresh random object id not in use in this registry.
    pub async fn create_with_unique_id<T: Cacheable>(
        &self,
        factories: &CacheFactories,
        attempts: u32,
    ) -> Result<(ObjectId, Arc<T>), CacheError> {
        if T::KEYING != Keying::PerObject {
            return Err(CacheError::contract(
                type_name::<T>(),
                "unique ids require a per-object cacheable type",
            ));
        }
        self.touch();

        let mut entries = self.entries.lock().await;
        for _ in 0..attempts.max(1) {
            let object_id = random_object_id();
            let key = EntryKey::of::<T>(Some(object_id));
            if entries.by_key.contains_key(&key) {
                continue;
            }
            counter!(METRIC_MISS).increment(1);
            let object = self.build::<T>(&mut entries, factories, key).await?;
            return Ok((object_id, object));
        }

        Err(CacheError::UniqueIdExhausted {
            type_name: type_name::<T>(),
            attempts: attempts.max(1),
        })
    }

    /// Evict every entry in the record's collection whose predicate accepts
    /// the change. Returns the number of evicted entries.
    pub async fn on_change(&self, record: &ChangeRecord) -> usize {
        let mut entries = self.entries.lock().await;
        let Some(candidates) = entries.by_collection.get(&record.collection_id) else {
            return 0;
        };

        let doomed: Vec<EntryKey> = candidates
            .iter()
            .filter(|key| {
                entries.by_key.get(key).is_some_and(|entry| {
                    entry
                        .object
                        .expires(record.collection_id, record.entity_id, record.change_type)
                })
            })
            .copied()
            .collect();

        for key in &doomed {
            entries.remove(key);
        }

        if !doomed.is_empty() {
            counter!(METRIC_EVICTED, "reason" => "change").increment(doomed.len() as u64);
            debug!(
                site_id = ?self.site,
                change_id = record.id,
                collection_id = record.collection_id.0,
                entity_id = record.entity_id,
                evicted = doomed.len(),
                "Cache entries invalidated by change"
            );
        }
        doomed.len()
    }

    async fn build<T: Cacheable>(
        &self,
        entries: &mut Entries,
        factories: &CacheFactories,
        key: EntryKey,
    ) -> Result<Arc<T>, CacheError> {
        let factory = factories
            .get::<T>()
            .ok_or(CacheError::MissingFactory {
                type_name: key.type_name,
            })?;

        let mut object = factory().map_err(|err| CacheError::construction(key.type_name, err))?;
        let policy = object
            .initialize(self.site, key.object_id)
            .await
            .map_err(|err| CacheError::construction(key.type_name, err))?;

        let now = self.clock.now();
        let expires_at = policy
            .ttl
            .and_then(|ttl| time::Duration::try_from(ttl).ok())
            .and_then(|ttl| now.checked_add(ttl));

        let object = Arc::new(object);
        entries.insert(
            key,
            CacheEntry {
                object: Arc::clone(&object) as Arc<dyn CachedObject>,
                handled: policy.handled,
                expires_at,
            },
        );

        counter!(METRIC_BUILT).increment(1);
        debug!(
            site_id = ?self.site,
            type_name = key.type_name,
            object_id = ?key.object_id,
            "Cache entry built"
        );
        Ok(object)
    }

    fn touch(&self) {
        *mutex_lock(&self.last_access, SOURCE, "touch") = self.clock.now();
    }
}

fn check_keying<T: Cacheable>(object_id: Option<ObjectId>) -> Result<(), CacheError> {
    match (T::KEYING, object_id) {
        (Keying::Singleton, Some(_)) => Err(CacheError::contract(
            type_name::<T>(),
            "singleton cacheable type does not accept an object id",
        )),
        (Keying::PerObject, None) => Err(CacheError::contract(
            type_name::<T>(),
            "per-object cacheable type requires an object id",
        )),
        _ => Ok(()),
    }
}

fn downcast<T: Cacheable>(object: Arc<dyn CachedObject>) -> Result<Arc<T>, CacheError> {
    object
        .into_any()
        .downcast::<T>()
        .map_err(|_| CacheError::TypeMismatch {
            type_name: type_name::<T>(),
        })
}

fn random_object_id() -> ObjectId {
    ObjectId(rand::thread_rng().gen_range(1..=i64::MAX))
}
