//! Change tracker.
//!
//! The single point through which store mutations become visible to cache
//! subscribers, whether they were detected by push notification or by polling.
//!
//! The tracker does no background work until the first subscriber arrives.
//! Starting is idempotent and race-safe: concurrent first subscribers all wait
//! on the same start sequence, which
//!
//! 1. establishes the high-water mark without replaying history,
//! 2. opens the store's push channel if enabled and supported, otherwise
//!    spawns the fallback poll timer,
//! 3. spawns the drain timer that delivers queued records to subscribers.
//!
//! Subscribers observe records in ascending id order. A failing or panicking
//! subscriber is logged and skipped; it never blocks delivery to the others.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::sync::{Mutex as AsyncMutex, OnceCell, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::application::repos::{ChangeQuery, ChangeSignal, ChangeWriter, StoreError};
use crate::domain::changes::{ChangeId, ChangeRecord, NewChange};

use super::config::TrackerConfig;
use super::events::DispatchQueue;
use super::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "cache::tracker";
const METRIC_DISPATCHED: &str = "sitecache_changes_dispatched_total";
const METRIC_SUBSCRIBER_FAILURES: &str = "sitecache_subscriber_failures_total";
const METRIC_POLL_MS: &str = "sitecache_poll_ms";

/// Error a subscriber may return; logged by the tracker, never retried.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives every change record, once, in ascending id order.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn on_change(&self, change: &ChangeRecord) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> ChangeHandler for FnHandler<F>
where
    F: Fn(&ChangeRecord) -> Result<(), HandlerError> + Send + Sync,
{
    async fn on_change(&self, change: &ChangeRecord) -> Result<(), HandlerError> {
        (self.0)(change)
    }
}

/// Wrap a synchronous closure as a change handler.
pub fn handler_fn<F>(handler: F) -> Arc<dyn ChangeHandler>
where
    F: Fn(&ChangeRecord) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(handler))
}

/// Token identifying one registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

impl Subscription {
    /// Token for a custom [`ChangeSource`] implementation.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Anything change handlers can subscribe to.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Register `handler`; the first subscription starts change tracking.
    async fn subscribe(&self, handler: Arc<dyn ChangeHandler>) -> Subscription;

    /// Returns `false` when the subscription was not registered.
    fn unsubscribe(&self, subscription: Subscription) -> bool;
}

/// How the tracker currently learns about new records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerMode {
    /// Not started: no subscriber has registered yet.
    Idle,
    /// Woken by store notifications.
    Push,
    /// Fixed-interval polling; `reason` records why push is not in use.
    Polling { reason: Option<String> },
}

/// Change tracker over a change store.
pub struct ChangeTracker<S: ChangeWriter> {
    inner: Arc<TrackerInner<S>>,
}

impl<S: ChangeWriter> Clone for ChangeTracker<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct TrackerInner<S: ChangeWriter> {
    store: Arc<S>,
    config: TrackerConfig,
    queue: DispatchQueue,
    subscribers: RwLock<Vec<(Subscription, Arc<dyn ChangeHandler>)>>,
    next_subscription: AtomicU64,
    started: OnceCell<()>,
    mode: Mutex<TrackerMode>,
    poll_gate: AsyncMutex<()>,
    drain_gate: AsyncMutex<()>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: ChangeWriter> ChangeTracker<S> {
    /// A tracker that establishes its high-water mark on first subscription.
    pub fn new(store: Arc<S>, config: TrackerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackerInner {
                store,
                config,
                queue: DispatchQueue::new(),
                subscribers: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                started: OnceCell::new(),
                mode: Mutex::new(TrackerMode::Idle),
                poll_gate: AsyncMutex::new(()),
                drain_gate: AsyncMutex::new(()),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A tracker whose high-water mark is read now, so records appended
    /// between construction and the first subscription are still delivered.
    ///
    /// A failed read is logged; the mark is then established lazily.
    pub async fn connect(store: Arc<S>, config: TrackerConfig) -> Self {
        let tracker = Self::new(store, config);
        tracker.inner.prime_baseline().await;
        tracker
    }

    /// Append a change record inside the caller's transaction.
    ///
    /// Failures propagate so the caller's transaction fails with it.
    pub async fn add_change(
        &self,
        tx: &mut S::Tx,
        change: NewChange,
    ) -> Result<ChangeId, StoreError> {
        let entity_id = change.entity_id;
        let collection_id = change.collection_id;
        let id = self.inner.store.append(tx, change).await?;
        debug!(
            change_id = id,
            entity_id,
            collection_id = collection_id.0,
            "Change record appended"
        );
        Ok(id)
    }

    /// Poll the store and deliver everything fetched before returning.
    ///
    /// Returns the number of records delivered. Queued records are still
    /// delivered when the poll itself fails.
    pub async fn invalidate_now(&self) -> Result<usize, StoreError> {
        let polled = self.inner.poll().await;
        let delivered = self.inner.drain().await;
        polled.map(|_| delivered)
    }

    pub fn mode(&self) -> TrackerMode {
        mutex_lock(&self.inner.mode, SOURCE, "mode").clone()
    }

    pub fn subscriber_count(&self) -> usize {
        rw_read(&self.inner.subscribers, SOURCE, "subscriber_count").len()
    }

    /// The highest change id fetched so far.
    pub fn cursor(&self) -> Option<ChangeId> {
        self.inner.queue.cursor()
    }

    /// Number of fetched records not yet delivered.
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Stop both timers and wait for them to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> =
            mutex_lock(&self.inner.tasks, SOURCE, "shutdown").drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await
                && !err.is_cancelled()
            {
                error!(error = %err, "Change tracker task ended abnormally");
            }
        }
        info!("Change tracker stopped");
    }
}

#[async_trait]
impl<S: ChangeWriter> ChangeSource for ChangeTracker<S> {
    async fn subscribe(&self, handler: Arc<dyn ChangeHandler>) -> Subscription {
        let subscription = Subscription(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst));
        let subscribers = {
            let mut subscribers = rw_write(&self.inner.subscribers, SOURCE, "subscribe");
            subscribers.push((subscription, handler));
            subscribers.len()
        };
        debug!(
            subscription = subscription.0,
            subscribers, "Change subscriber registered"
        );

        self.inner.ensure_started().await;
        subscription
    }

    fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut subscribers = rw_write(&self.inner.subscribers, SOURCE, "unsubscribe");
        let before = subscribers.len();
        subscribers.retain(|(registered, _)| *registered != subscription);
        let removed = subscribers.len() < before;
        if removed {
            debug!(
                subscription = subscription.0,
                subscribers = subscribers.len(),
                "Change subscriber removed"
            );
        }
        removed
    }
}

impl<S: ChangeWriter> TrackerInner<S> {
    async fn ensure_started(self: &Arc<Self>) {
        self.started.get_or_init(|| self.start()).await;
    }

    async fn start(self: &Arc<Self>) {
        self.prime_baseline().await;

        let mode = if self.config.push_enabled {
            match self.store.listen().await {
                Ok(Some(signal)) => {
                    let shutdown = self.shutdown.subscribe();
                    self.spawn(Arc::clone(self).push_loop(signal, shutdown));
                    TrackerMode::Push
                }
                Ok(None) => {
                    self.spawn_poll_loop();
                    TrackerMode::Polling {
                        reason: Some("store does not support change notification".to_string()),
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Change notification setup failed; falling back to polling");
                    self.spawn_poll_loop();
                    TrackerMode::Polling {
                        reason: Some(err.to_string()),
                    }
                }
            }
        } else {
            self.spawn_poll_loop();
            TrackerMode::Polling { reason: None }
        };

        let shutdown = self.shutdown.subscribe();
        self.spawn(Arc::clone(self).drain_loop(shutdown));

        info!(
            mode = ?mode,
            cursor = self.queue.cursor(),
            "Change tracker started"
        );
        *mutex_lock(&self.mode, SOURCE, "start") = mode;
    }

    async fn prime_baseline(&self) {
        match self.store.latest_id().await {
            Ok(latest) => {
                let baseline = latest.unwrap_or(0);
                if self.queue.prime(baseline) {
                    info!(baseline, "Change tracker high-water mark established");
                }
            }
            Err(err) => {
                warn!(
                    error = %err,
                    "Failed to read change high-water mark; retrying on next poll"
                );
            }
        }
    }

    #[instrument(skip(self))]
    async fn poll(&self) -> Result<usize, StoreError> {
        let _gate = self.poll_gate.lock().await;
        let started_at = Instant::now();

        let Some(cursor) = self.queue.cursor() else {
            // No mark yet: establish one rather than replaying history.
            let latest = self.store.latest_id().await?;
            self.queue.prime(latest.unwrap_or(0));
            return Ok(0);
        };

        let records = self.store.query(&ChangeQuery::since(cursor)).await?;
        let accepted = self.queue.enqueue(records);

        histogram!(METRIC_POLL_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        Ok(accepted)
    }

    #[instrument(skip(self))]
    async fn drain(&self) -> usize {
        let _gate = self.drain_gate.lock().await;
        let batch = self.queue.drain();
        if batch.is_empty() {
            return 0;
        }

        let handlers = rw_read(&self.subscribers, SOURCE, "drain").clone();
        for record in &batch {
            for (subscription, handler) in &handlers {
                Self::deliver(*subscription, handler.as_ref(), record).await;
            }
        }

        counter!(METRIC_DISPATCHED).increment(batch.len() as u64);
        debug!(
            delivered = batch.len(),
            subscribers = handlers.len(),
            "Change records dispatched"
        );
        batch.len()
    }

    async fn deliver(subscription: Subscription, handler: &dyn ChangeHandler, record: &ChangeRecord) {
        match AssertUnwindSafe(handler.on_change(record))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                counter!(METRIC_SUBSCRIBER_FAILURES).increment(1);
                warn!(
                    subscription = subscription.0,
                    change_id = record.id,
                    error = %err,
                    "Change subscriber failed"
                );
            }
            Err(_) => {
                counter!(METRIC_SUBSCRIBER_FAILURES).increment(1);
                error!(
                    subscription = subscription.0,
                    change_id = record.id,
                    "Change subscriber panicked"
                );
            }
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if *self.shutdown.borrow() {
            return;
        }
        let handle = tokio::spawn(task);
        mutex_lock(&self.tasks, SOURCE, "spawn").push(handle);
    }

    fn spawn_poll_loop(self: &Arc<Self>) {
        let shutdown = self.shutdown.subscribe();
        self.spawn(Arc::clone(self).poll_loop(shutdown));
    }

    async fn poll_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.poll_interval();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
            if let Err(err) = self.poll().await {
                warn!(error = %err, "Change poll failed; retrying on next tick");
            }
        }
        debug!("Change poll timer stopped");
    }

    async fn push_loop(self: Arc<Self>, mut signal: ChangeSignal, mut shutdown: watch::Receiver<bool>) {
        // Catch records appended between the baseline read and `listen`.
        if let Err(err) = self.poll().await {
            warn!(error = %err, "Initial change poll failed");
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                received = signal.recv() => match received {
                    Some(()) => {
                        if let Err(err) = self.poll().await {
                            warn!(error = %err, "Change poll after notification failed");
                        }
                    }
                    None => {
                        warn!("Change notification channel closed; falling back to polling");
                        *mutex_lock(&self.mode, SOURCE, "push_loop") = TrackerMode::Polling {
                            reason: Some("change notification channel closed".to_string()),
                        };
                        self.spawn_poll_loop();
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Change notification listener stopped");
    }

    async fn drain_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.drain_interval();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
            self.drain().await;
        }
        debug!("Change drain timer stopped");
    }
}
