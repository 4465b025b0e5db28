use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing::Subscriber;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the global tracing subscriber and describe the crate's metrics.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer(logging.format))
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("tracing subscriber already set: {err}")))
}

fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
    }
}

/// Register descriptions for every metric the crate emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "sitecache_changes_fetched_total",
            Unit::Count,
            "Total number of change records fetched by the tracker."
        );
        describe_counter!(
            "sitecache_changes_dispatched_total",
            Unit::Count,
            "Total number of change records delivered to subscribers."
        );
        describe_counter!(
            "sitecache_subscriber_failures_total",
            Unit::Count,
            "Total number of subscriber errors and panics during dispatch."
        );
        describe_gauge!(
            "sitecache_dispatch_queue_len",
            Unit::Count,
            "Change records fetched but not yet delivered."
        );
        describe_histogram!(
            "sitecache_poll_ms",
            Unit::Milliseconds,
            "Change poll latency in milliseconds."
        );
        describe_counter!(
            "sitecache_entry_hit_total",
            Unit::Count,
            "Total number of cache entry hits."
        );
        describe_counter!(
            "sitecache_entry_miss_total",
            Unit::Count,
            "Total number of cache entry misses."
        );
        describe_counter!(
            "sitecache_entry_built_total",
            Unit::Count,
            "Total number of cache entries constructed."
        );
        describe_counter!(
            "sitecache_entry_evicted_total",
            Unit::Count,
            "Total number of cache entries evicted, labelled by reason."
        );
        describe_histogram!(
            "sitecache_changes_refresh_ms",
            Unit::Milliseconds,
            "Change window refresh latency in milliseconds."
        );
    });
}
