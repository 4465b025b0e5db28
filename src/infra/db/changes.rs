use async_trait::async_trait;
use sqlx::{
    Postgres, QueryBuilder, Transaction,
    postgres::PgListener,
};
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::application::repos::{
    ChangeQuery, ChangeReader, ChangeSignal, ChangeWriter, SiteFilter, StoreError,
};
use crate::domain::changes::{
    ChangeId, ChangeRecord, ChangeType, CollectionId, NewChange, SiteId, UserId,
};

use super::{PostgresChangeStore, map_sqlx_error};

/// Channel the `change_records` insert trigger notifies on.
pub const NOTIFY_CHANNEL: &str = "change_records";

const SIGNAL_CAPACITY: usize = 16;

/// Advisory lock serializing appenders, so ids become visible in id order.
const APPEND_LOCK_KEY: i64 = 0x7369_7465_6361_6368;

#[derive(sqlx::FromRow)]
struct ChangeRow {
    id: i64,
    entity_id: i64,
    collection_id: i32,
    change_type: i16,
    user_id: Option<i64>,
    site_id: Option<i64>,
    created: OffsetDateTime,
}

impl TryFrom<ChangeRow> for ChangeRecord {
    type Error = StoreError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        let change_type = ChangeType::try_from(row.change_type).map_err(|err| {
            StoreError::Integrity {
                message: format!("change record {}: {err}", row.id),
            }
        })?;
        Ok(Self {
            id: row.id,
            entity_id: row.entity_id,
            collection_id: CollectionId(row.collection_id),
            change_type,
            user_id: row.user_id.map(UserId),
            site_id: row.site_id.map(SiteId),
            created: row.created,
        })
    }
}

#[async_trait]
impl ChangeReader for PostgresChangeStore {
    async fn latest_id(&self) -> Result<Option<ChangeId>, StoreError> {
        sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(id) FROM change_records")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)
    }

    async fn query(&self, query: &ChangeQuery) -> Result<Vec<ChangeRecord>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, entity_id, collection_id, change_type, user_id, site_id, created \
             FROM change_records WHERE TRUE",
        );

        match query.site {
            SiteFilter::Any => {}
            SiteFilter::Only(Some(site)) => {
                qb.push(" AND site_id = ").push_bind(site.0);
            }
            SiteFilter::Only(None) => {
                qb.push(" AND site_id IS NULL");
            }
        }
        if let Some(since) = query.since_id {
            qb.push(" AND id > ").push_bind(since);
        }
        if let Some(after) = query.created_after {
            qb.push(" AND created > ").push_bind(after);
        }
        qb.push(" ORDER BY id ASC");

        let rows = qb
            .build_query_as::<ChangeRow>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(ChangeRecord::try_from).collect()
    }

    async fn listen(&self) -> Result<Option<ChangeSignal>, StoreError> {
        let mut listener = PgListener::connect_with(self.pool())
            .await
            .map_err(|err| StoreError::Notification(err.to_string()))?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .map_err(|err| StoreError::Notification(err.to_string()))?;

        let (tx, signal) = ChangeSignal::channel(SIGNAL_CAPACITY);
        tokio::spawn(forward_notifications(listener, tx));
        debug!(channel = NOTIFY_CHANNEL, "Listening for change notifications");
        Ok(Some(signal))
    }
}

#[async_trait]
impl ChangeWriter for PostgresChangeStore {
    type Tx = Transaction<'static, Postgres>;

    async fn append(&self, tx: &mut Self::Tx, change: NewChange) -> Result<ChangeId, StoreError> {
        // Held until the caller's transaction ends; the id is drawn after it.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;

        sqlx::query_scalar::<_, i64>(
            "INSERT INTO change_records (entity_id, collection_id, change_type, user_id, site_id) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id",
        )
        .bind(change.entity_id)
        .bind(change.collection_id.0)
        .bind(change.change_type.code())
        .bind(change.user_id.map(|user| user.0))
        .bind(change.site_id.map(|site| site.0))
        .fetch_one(&mut **tx)
        .await
        .map_err(map_sqlx_error)
    }
}

/// Relay notifications until the listener fails or the signal is dropped.
///
/// Payloads are ignored; each one only means "poll now". Dropping `tx` ends
/// the signal, which moves the tracker to polling.
async fn forward_notifications(mut listener: PgListener, tx: mpsc::Sender<()>) {
    loop {
        tokio::select! {
            _ = tx.closed() => break,
            received = listener.recv() => match received {
                Ok(_) => {
                    if let Err(TrySendError::Closed(_)) = tx.try_send(()) {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Change notification listener failed");
                    break;
                }
            },
        }
    }
    debug!("Change notification relay stopped");
}
