//! Site cache system.
//!
//! Keeps lazily built, per-tenant objects coherent with the change log:
//!
//! - **ChangeTracker**: turns appended change records into an ordered stream
//!   for subscribers, by push notification or by polling
//! - **DataCache**: typed, at-most-once construction of cached objects per
//!   tenant, evicted when a relevant change arrives
//! - **ChangesCache**: rolling per-tenant window of recent changes for
//!   incremental sync queries
//!
//! ## Configuration
//!
//! Runtime knobs come from `sitecache.toml` (or `SITECACHE__*` variables):
//!
//! ```toml
//! [tracker]
//! poll_interval_ms = 300
//! drain_interval_ms = 300
//! push_enabled = true
//!
//! [changes]
//! retention_secs = 86400
//! refresh_interval_ms = 500
//! ```

mod cacheable;
mod changes;
mod clock;
pub(crate) mod config;
mod error;
mod events;
pub(crate) mod lock;
mod registry;
mod router;
mod tracker;

pub use cacheable::{CacheFactories, CachePolicy, Cacheable, Keying};
pub use changes::{ChangeFilter, ChangesCache, ChangesCaches};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, ChangesConfig, TrackerConfig};
pub use error::{BuildError, CacheError};
pub use registry::SiteDataCache;
pub use router::DataCache;
pub use tracker::{
    ChangeHandler, ChangeSource, ChangeTracker, HandlerError, Subscription, TrackerMode, handler_fn,
};
