//! Cache configuration.
//!
//! Statically typed runtime knobs for the change tracker, the object cache and
//! the changes window, resolved from `sitecache.toml` via [`crate::config`].

use std::time::Duration;

pub(crate) const DEFAULT_POLL_INTERVAL_MS: u64 = 300;
pub(crate) const DEFAULT_DRAIN_INTERVAL_MS: u64 = 300;
pub(crate) const DEFAULT_RETENTION_SECS: u64 = 24 * 60 * 60;
pub(crate) const DEFAULT_REFRESH_INTERVAL_MS: u64 = 500;
pub(crate) const DEFAULT_UNIQUE_ID_ATTEMPTS: u32 = 64;

/// Change tracker timers and notification strategy.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Fallback poll cadence (ms), used when push notification is unavailable.
    pub poll_interval_ms: u64,
    /// Dispatch-queue drain cadence (ms).
    pub drain_interval_ms: u64,
    /// Try the store's push notification before falling back to polling.
    pub push_enabled: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            drain_interval_ms: DEFAULT_DRAIN_INTERVAL_MS,
            push_enabled: true,
        }
    }
}

impl TrackerConfig {
    /// Poll interval, clamped to at least one millisecond.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Drain interval, clamped to at least one millisecond.
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }
}

/// Rolling change window used for incremental sync queries.
#[derive(Debug, Clone)]
pub struct ChangesConfig {
    /// How far back records are retained (seconds).
    pub retention_secs: u64,
    /// Minimum time between store refreshes (ms).
    pub refresh_interval_ms: u64,
}

impl Default for ChangesConfig {
    fn default() -> Self {
        Self {
            retention_secs: DEFAULT_RETENTION_SECS,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
        }
    }
}

impl ChangesConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// Top-level cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub tracker: TrackerConfig,
    pub changes: ChangesConfig,
    /// Cap on random draws in `create_with_unique_id` before giving up.
    pub unique_id_attempts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            changes: ChangesConfig::default(),
            unique_id_attempts: DEFAULT_UNIQUE_ID_ATTEMPTS,
        }
    }
}

impl CacheConfig {
    /// Unique-id attempts, at least one.
    pub fn unique_id_attempts(&self) -> u32 {
        self.unique_id_attempts.max(1)
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            tracker: TrackerConfig {
                poll_interval_ms: settings.tracker.poll_interval.as_millis() as u64,
                drain_interval_ms: settings.tracker.drain_interval.as_millis() as u64,
                push_enabled: settings.tracker.push_enabled,
            },
            changes: ChangesConfig {
                retention_secs: settings.changes.retention.as_secs(),
                refresh_interval_ms: settings.changes.refresh_interval.as_millis() as u64,
            },
            unique_id_attempts: settings.cache.unique_id_attempts.get(),
        }
    }
}
