//! Change records: immutable facts describing one entity mutation.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::error::DomainError;

/// Store-assigned, monotonically increasing change identifier.
pub type ChangeId = i64;

/// Identifier of a mutated entity within its collection.
pub type EntityId = i64;

/// Tenant (site) identifier. `None` in an `Option<SiteId>` means tenant-less.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub i64);

/// Acting user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Logical collection (table/kind) an entity belongs to; routes invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(pub i32);

/// Sub-key distinguishing instances of the same cached kind within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub i64);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of mutation a change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Updated,
    Removed,
}

impl ChangeType {
    /// Persisted numeric code.
    pub fn code(self) -> i16 {
        match self {
            Self::Added => 0,
            Self::Updated => 1,
            Self::Removed => 2,
        }
    }
}

impl TryFrom<i16> for ChangeType {
    type Error = DomainError;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Added),
            1 => Ok(Self::Updated),
            2 => Ok(Self::Removed),
            other => Err(DomainError::validation(format!(
                "unknown change type code {other}"
            ))),
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Removed => "removed",
        };
        f.write_str(label)
    }
}

/// A persisted change record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: ChangeId,
    pub entity_id: EntityId,
    pub collection_id: CollectionId,
    pub change_type: ChangeType,
    pub user_id: Option<UserId>,
    pub site_id: Option<SiteId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
}

/// A change about to be appended; the store assigns `id` and `created`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChange {
    pub entity_id: EntityId,
    pub collection_id: CollectionId,
    pub change_type: ChangeType,
    pub user_id: Option<UserId>,
    pub site_id: Option<SiteId>,
}

impl NewChange {
    /// A system-initiated, tenant-less change.
    pub fn new(entity_id: EntityId, collection_id: CollectionId, change_type: ChangeType) -> Self {
        Self {
            entity_id,
            collection_id,
            change_type,
            user_id: None,
            site_id: None,
        }
    }

    /// Tag the change with the acting user.
    pub fn by(mut self, user: Option<UserId>) -> Self {
        self.user_id = user;
        self
    }

    /// Tag the change with the tenant it belongs to.
    pub fn on_site(mut self, site: Option<SiteId>) -> Self {
        self.site_id = site;
        self
    }

    /// Materialize into a record once the store has assigned identity.
    pub fn into_record(self, id: ChangeId, created: OffsetDateTime) -> ChangeRecord {
        ChangeRecord {
            id,
            entity_id: self.entity_id,
            collection_id: self.collection_id,
            change_type: self.change_type,
            user_id: self.user_id,
            site_id: self.site_id,
            created,
        }
    }
}
