//! Change dispatch queue.
//!
//! Holds the tracker's high-water mark and the FIFO of fetched-but-undelivered
//! change records. Both live behind one mutex so that advancing the cursor and
//! enqueueing the records it covers happen atomically.

use std::collections::VecDeque;
use std::sync::Mutex;

use metrics::{counter, gauge};
use tracing::debug;

use crate::domain::changes::{ChangeId, ChangeRecord};

use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";
const METRIC_QUEUE_LEN: &str = "sitecache_dispatch_queue_len";
const METRIC_FETCHED: &str = "sitecache_changes_fetched_total";

#[derive(Debug, Default)]
struct QueueState {
    cursor: Option<ChangeId>,
    pending: VecDeque<ChangeRecord>,
}

/// Cursor plus FIFO of change records awaiting delivery.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    state: Mutex<QueueState>,
}

impl DispatchQueue {
    /// An empty queue with no known high-water mark.
    pub fn new() -> Self {
        Self::default()
    }

    /// The highest change id fetched so far.
    pub fn cursor(&self) -> Option<ChangeId> {
        mutex_lock(&self.state, SOURCE, "cursor").cursor
    }

    /// Set the starting high-water mark if none is known yet.
    ///
    /// Returns `true` when the baseline was applied.
    pub fn prime(&self, baseline: ChangeId) -> bool {
        let mut state = mutex_lock(&self.state, SOURCE, "prime");
        if state.cursor.is_some() {
            return false;
        }
        state.cursor = Some(baseline);
        true
    }

    /// Append records newer than the cursor, in ascending id order, and
    /// advance the cursor past them.
    ///
    /// Records at or below the cursor were already fetched and are skipped.
    pub fn enqueue(&self, mut records: Vec<ChangeRecord>) -> usize {
        records.sort_unstable_by_key(|record| record.id);

        let mut state = mutex_lock(&self.state, SOURCE, "enqueue");
        let mut accepted = 0usize;
        for record in records {
            if state.cursor.is_some_and(|cursor| record.id <= cursor) {
                continue;
            }
            state.cursor = Some(record.id);
            state.pending.push_back(record);
            accepted += 1;
        }

        if accepted > 0 {
            debug!(
                accepted,
                cursor = state.cursor,
                pending = state.pending.len(),
                "Change records enqueued"
            );
            counter!(METRIC_FETCHED).increment(accepted as u64);
        }
        gauge!(METRIC_QUEUE_LEN).set(state.pending.len() as f64);
        accepted
    }

    /// Remove and return every pending record in FIFO order.
    pub fn drain(&self) -> Vec<ChangeRecord> {
        let mut state = mutex_lock(&self.state, SOURCE, "drain");
        let drained: Vec<ChangeRecord> = state.pending.drain(..).collect();
        gauge!(METRIC_QUEUE_LEN).set(0.0);
        drained
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use time::OffsetDateTime;

    use super::*;
    use crate::domain::changes::{ChangeType, CollectionId, NewChange};

    fn record(id: ChangeId) -> ChangeRecord {
        NewChange::new(id * 10, CollectionId(1), ChangeType::Updated)
            .into_record(id, OffsetDateTime::UNIX_EPOCH)
    }

    #[test]
    fn enqueue_orders_and_advances_cursor() {
        let queue = DispatchQueue::new();
        queue.prime(0);

        let accepted = queue.enqueue(vec![record(3), record(1), record(2)]);
        assert_eq!(accepted, 3);
        assert_eq!(queue.cursor(), Some(3));

        let ids: Vec<ChangeId> = queue.drain().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn enqueue_skips_already_fetched_records() {
        let queue = DispatchQueue::new();
        queue.prime(5);

        assert_eq!(queue.enqueue(vec![record(4), record(5), record(6)]), 1);
        assert_eq!(queue.enqueue(vec![record(6)]), 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.cursor(), Some(6));
    }

    #[test]
    fn prime_only_applies_once() {
        let queue = DispatchQueue::new();
        assert!(queue.prime(10));
        assert!(!queue.prime(2));
        assert_eq!(queue.cursor(), Some(10));
    }

    #[test]
    fn drain_preserves_fifo_across_batches() {
        let queue = DispatchQueue::new();
        queue.prime(0);
        queue.enqueue(vec![record(1), record(2)]);
        queue.enqueue(vec![record(3)]);

        let ids: Vec<ChangeId> = queue.drain().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn dispatch_queue_recovers_from_poisoned_lock() {
        let queue = DispatchQueue::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = queue.state.lock().expect("queue lock should be acquired");
            panic!("poison queue lock");
        }));

        queue.prime(0);
        queue.enqueue(vec![record(1)]);
        assert_eq!(queue.len(), 1);
    }
}
