//! Repository traits describing the change-record store.

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::domain::changes::{ChangeId, ChangeRecord, NewChange, SiteId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
    #[error("change notification unavailable: {0}")]
    Notification(String),
}

impl StoreError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Which tenants a change query covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SiteFilter {
    /// Every tenant, including tenant-less records.
    #[default]
    Any,
    /// Exactly one tenant; `Only(None)` selects tenant-less records.
    Only(Option<SiteId>),
}

/// Range query over the change log. Results are ordered by ascending id.
#[derive(Debug, Clone, Default)]
pub struct ChangeQuery {
    pub site: SiteFilter,
    /// Exclusive lower bound on `id`.
    pub since_id: Option<ChangeId>,
    /// Exclusive lower bound on `created`.
    pub created_after: Option<OffsetDateTime>,
}

impl ChangeQuery {
    pub fn since(id: ChangeId) -> Self {
        Self {
            since_id: Some(id),
            ..Self::default()
        }
    }

    pub fn for_site(mut self, site: Option<SiteId>) -> Self {
        self.site = SiteFilter::Only(site);
        self
    }

    pub fn created_after(mut self, at: OffsetDateTime) -> Self {
        self.created_after = Some(at);
        self
    }

    /// Whether `record` satisfies this query.
    pub fn matches(&self, record: &ChangeRecord) -> bool {
        if let SiteFilter::Only(site) = self.site
            && record.site_id != site
        {
            return false;
        }
        if let Some(since) = self.since_id
            && record.id <= since
        {
            return false;
        }
        if let Some(after) = self.created_after
            && record.created <= after
        {
            return false;
        }
        true
    }
}

/// Push notification channel: each received unit means "new records may exist".
///
/// The stream ending means the push source is gone and the consumer should
/// fall back to polling.
pub struct ChangeSignal {
    rx: mpsc::Receiver<()>,
}

impl ChangeSignal {
    pub fn new(rx: mpsc::Receiver<()>) -> Self {
        Self { rx }
    }

    /// Create a connected sender/signal pair.
    pub fn channel(capacity: usize) -> (mpsc::Sender<()>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }

    /// Wait for the next notification; `None` once the source has closed.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// Read side of the change log.
#[async_trait]
pub trait ChangeReader: Send + Sync + 'static {
    /// The current high-water mark, without reading any records.
    async fn latest_id(&self) -> Result<Option<ChangeId>, StoreError>;

    /// Records matching `query`, ordered by ascending id.
    async fn query(&self, query: &ChangeQuery) -> Result<Vec<ChangeRecord>, StoreError>;

    /// Subscribe to table-change notifications if the store supports push.
    ///
    /// `Ok(None)` means the store is poll-only.
    async fn listen(&self) -> Result<Option<ChangeSignal>, StoreError> {
        Ok(None)
    }
}

/// Write side of the change log.
///
/// Records must become visible to readers in ascending id order: a record
/// may not appear after a higher id has already been readable. Readers resume
/// from the highest id they saw and never look back.
#[async_trait]
pub trait ChangeWriter: ChangeReader {
    /// Transaction handle the append participates in.
    type Tx: Send;

    /// Append a record inside the caller's transaction; the store assigns the id.
    async fn append(&self, tx: &mut Self::Tx, change: NewChange) -> Result<ChangeId, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::changes::{ChangeType, CollectionId};

    fn record(id: ChangeId, site: Option<SiteId>, created: OffsetDateTime) -> ChangeRecord {
        NewChange::new(1, CollectionId(1), ChangeType::Added)
            .on_site(site)
            .into_record(id, created)
    }

    #[test]
    fn default_query_matches_everything() {
        let query = ChangeQuery::default();
        assert!(query.matches(&record(1, None, OffsetDateTime::UNIX_EPOCH)));
        assert!(query.matches(&record(2, Some(SiteId(4)), OffsetDateTime::UNIX_EPOCH)));
    }

    #[test]
    fn site_filter_distinguishes_tenant_less_records() {
        let query = ChangeQuery::default().for_site(None);
        assert!(query.matches(&record(1, None, OffsetDateTime::UNIX_EPOCH)));
        assert!(!query.matches(&record(2, Some(SiteId(4)), OffsetDateTime::UNIX_EPOCH)));
    }

    #[test]
    fn since_and_created_after_are_exclusive() {
        let now = OffsetDateTime::UNIX_EPOCH + time::Duration::hours(1);
        let query = ChangeQuery::since(5).created_after(now);

        assert!(!query.matches(&record(5, None, now + time::Duration::SECOND)));
        assert!(!query.matches(&record(6, None, now)));
        assert!(query.matches(&record(6, None, now + time::Duration::SECOND)));
    }

    #[tokio::test]
    async fn signal_ends_when_sender_drops() {
        let (tx, mut signal) = ChangeSignal::channel(4);
        tx.send(()).await.expect("send notification");
        drop(tx);

        assert_eq!(signal.recv().await, Some(()));
        assert_eq!(signal.recv().await, None);
    }
}
