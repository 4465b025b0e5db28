//! In-process change store.
//!
//! Appends are visible immediately, so the transaction handle is `()`.
//! Optionally behaves as a push-capable store, signalling listeners on every
//! append. Used by tests and single-process deployments.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::application::repos::{
    ChangeQuery, ChangeReader, ChangeSignal, ChangeWriter, StoreError,
};
use crate::cache::lock::{mutex_lock, rw_read, rw_write};
use crate::cache::{Clock, SystemClock};
use crate::domain::changes::{ChangeId, ChangeRecord, NewChange};

const SOURCE: &str = "infra::memory";
const SIGNAL_CAPACITY: usize = 16;

pub struct MemoryChangeStore {
    clock: Arc<dyn Clock>,
    records: RwLock<Vec<ChangeRecord>>,
    next_id: AtomicI64,
    push_capable: bool,
    listeners: Mutex<Vec<mpsc::Sender<()>>>,
    unavailable: AtomicBool,
}

impl MemoryChangeStore {
    /// A poll-only store stamping records with the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
            push_capable: false,
            listeners: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Enable push notification for `listen`.
    pub fn with_notifications(mut self) -> Self {
        self.push_capable = true;
        self
    }

    /// Append a record with an explicit creation time.
    pub fn insert(&self, change: NewChange, created: OffsetDateTime) -> ChangeRecord {
        let record = {
            let mut records = rw_write(&self.records, SOURCE, "insert");
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let record = change.into_record(id, created);
            records.push(record.clone());
            record
        };
        self.notify();
        record
    }

    /// Drop every notification sender, ending all open `ChangeSignal`s.
    pub fn close_listeners(&self) {
        self.lock_listeners().clear();
    }

    /// Simulate an outage: reads fail with a persistence error while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.read_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::from_persistence("memory store unavailable"));
        }
        Ok(())
    }

    fn notify(&self) {
        self.lock_listeners()
            .retain(|tx| !matches!(tx.try_send(()), Err(TrySendError::Closed(_))));
    }

    fn read_records(&self) -> RwLockReadGuard<'_, Vec<ChangeRecord>> {
        rw_read(&self.records, SOURCE, "read_records")
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<mpsc::Sender<()>>> {
        mutex_lock(&self.listeners, SOURCE, "listeners")
    }
}

impl Default for MemoryChangeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeReader for MemoryChangeStore {
    async fn latest_id(&self) -> Result<Option<ChangeId>, StoreError> {
        self.check_available()?;
        Ok(self.read_records().last().map(|record| record.id))
    }

    async fn query(&self, query: &ChangeQuery) -> Result<Vec<ChangeRecord>, StoreError> {
        self.check_available()?;
        Ok(self
            .read_records()
            .iter()
            .filter(|record| query.matches(record))
            .cloned()
            .collect())
    }

    async fn listen(&self) -> Result<Option<ChangeSignal>, StoreError> {
        if !self.push_capable {
            return Ok(None);
        }
        self.check_available()?;
        let (tx, signal) = ChangeSignal::channel(SIGNAL_CAPACITY);
        self.lock_listeners().push(tx);
        Ok(Some(signal))
    }
}

#[async_trait]
impl ChangeWriter for MemoryChangeStore {
    type Tx = ();

    async fn append(&self, _tx: &mut (), change: NewChange) -> Result<ChangeId, StoreError> {
        self.check_available()?;
        let record = self.insert(change, self.clock.now());
        Ok(record.id)
    }
}
