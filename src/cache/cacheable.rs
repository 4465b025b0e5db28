//! Contract implemented by every cached type, plus factory injection.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::changes::{ChangeType, CollectionId, EntityId, ObjectId, SiteId};

use super::error::BuildError;

/// Whether a cached type is a per-tenant singleton or keyed by object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keying {
    /// One instance per registry; lookups must not pass an object id.
    Singleton,
    /// Many instances per registry; lookups must pass an object id.
    PerObject,
}

/// Declared by `Cacheable::initialize`: which collections can invalidate the
/// entry and how long it may live regardless of changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePolicy {
    pub handled: Vec<CollectionId>,
    pub ttl: Option<Duration>,
}

impl CachePolicy {
    pub fn on_change(collections: impl IntoIterator<Item = CollectionId>) -> Self {
        Self {
            handled: collections.into_iter().collect(),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A lazily built, tenant-scoped cache entry.
///
/// Instances come from the factory registered in [`CacheFactories`], then
/// `initialize` loads their state. `expires` is consulted for every change
/// record in one of the policy's handled collections; answering `false`
/// keeps the entry.
#[async_trait]
pub trait Cacheable: Send + Sync + Sized + 'static {
    const KEYING: Keying = Keying::Singleton;

    async fn initialize(
        &mut self,
        site: Option<SiteId>,
        object_id: Option<ObjectId>,
    ) -> Result<CachePolicy, BuildError>;

    fn expires(&self, collection: CollectionId, entity_id: EntityId, change_type: ChangeType)
    -> bool;
}

/// Object-safe view of a cached entry.
pub(crate) trait CachedObject: Send + Sync {
    fn expires(&self, collection: CollectionId, entity_id: EntityId, change_type: ChangeType)
    -> bool;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Cacheable> CachedObject for T {
    fn expires(
        &self,
        collection: CollectionId,
        entity_id: EntityId,
        change_type: ChangeType,
    ) -> bool {
        Cacheable::expires(self, collection, entity_id, change_type)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

type Factory<T> = Arc<dyn Fn() -> Result<T, BuildError> + Send + Sync>;

/// Constructors for cacheable types, injected into the cache router.
#[derive(Default)]
pub struct CacheFactories {
    factories: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl CacheFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for `T`, replacing any earlier one.
    pub fn register<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Cacheable,
        F: Fn() -> Result<T, BuildError> + Send + Sync + 'static,
    {
        let factory: Factory<T> = Arc::new(factory);
        self.factories.insert(TypeId::of::<T>(), Box::new(factory));
        self
    }

    /// Register `T::default` as the constructor for `T`.
    pub fn register_default<T>(&mut self) -> &mut Self
    where
        T: Cacheable + Default,
    {
        self.register::<T, _>(|| Ok(T::default()))
    }

    pub fn contains<T: Cacheable>(&self) -> bool {
        self.factories.contains_key(&TypeId::of::<T>())
    }

    pub(crate) fn get<T: Cacheable>(&self) -> Option<Factory<T>> {
        self.factories
            .get(&TypeId::of::<T>())
            .and_then(|factory| factory.downcast_ref::<Factory<T>>())
            .cloned()
    }
}

impl fmt::Debug for CacheFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFactories")
            .field("registered", &self.factories.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        value: u32,
    }

    #[async_trait]
    impl Cacheable for Counter {
        async fn initialize(
            &mut self,
            _site: Option<SiteId>,
            _object_id: Option<ObjectId>,
        ) -> Result<CachePolicy, BuildError> {
            self.value += 1;
            Ok(CachePolicy::on_change([CollectionId(3)]).with_ttl(Duration::from_secs(60)))
        }

        fn expires(&self, collection: CollectionId, _: EntityId, _: ChangeType) -> bool {
            collection == CollectionId(3)
        }
    }

    #[tokio::test]
    async fn registered_factory_builds_instances() {
        let mut factories = CacheFactories::new();
        factories.register::<Counter, _>(|| Ok(Counter { value: 41 }));
        assert!(factories.contains::<Counter>());

        let factory = factories.get::<Counter>().expect("factory registered");
        let mut counter = factory().expect("build");
        let policy = counter.initialize(None, None).await.expect("initialize");

        assert_eq!(counter.value, 42);
        assert_eq!(policy.handled, vec![CollectionId(3)]);
        assert_eq!(policy.ttl, Some(Duration::from_secs(60)));
    }

    #[test]
    fn default_keying_is_singleton() {
        assert_eq!(Counter::KEYING, Keying::Singleton);
    }

    #[test]
    fn missing_factory_is_none() {
        let factories = CacheFactories::new();
        assert!(factories.get::<Counter>().is_none());
    }

    #[test]
    fn erased_entry_keeps_expiry_predicate() {
        let object: Arc<dyn CachedObject> = Arc::new(Counter::default());
        assert!(object.expires(CollectionId(3), 1, ChangeType::Updated));
        assert!(!object.expires(CollectionId(4), 1, ChangeType::Updated));

        let any = object.into_any();
        assert!(any.downcast::<Counter>().is_ok());
    }

    #[test]
    fn register_default_uses_default_impl() {
        let mut factories = CacheFactories::new();
        factories.register_default::<Counter>();
        let factory = factories.get::<Counter>().expect("factory registered");
        assert_eq!(factory().expect("build").value, 0);
    }
}
