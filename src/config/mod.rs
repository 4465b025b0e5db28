//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{
    ChangesArgs, CliArgs, Command, DatabaseOverride, MigrateArgs, RuntimeOverrides, TailArgs,
};

use std::{num::NonZeroU32, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::config::{
    DEFAULT_DRAIN_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_REFRESH_INTERVAL_MS,
    DEFAULT_RETENTION_SECS, DEFAULT_UNIQUE_ID_ATTEMPTS,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "sitecache";
const ENV_PREFIX: &str = "SITECACHE";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub tracker: TrackerSettings,
    pub cache: CacheSettings,
    pub changes: ChangesSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub poll_interval: Duration,
    pub drain_interval: Duration,
    pub push_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub unique_id_attempts: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct ChangesSettings {
    pub retention: Duration,
    pub refresh_interval: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match &cli.command {
        Command::Tail(args) => raw.apply_runtime_overrides(&args.overrides),
        Command::Changes(args) => raw.apply_runtime_overrides(&args.overrides),
        Command::Migrate(args) => raw.apply_database_override(&args.database),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    tracker: RawTrackerSettings,
    cache: RawCacheSettings,
    changes: RawChangesSettings,
}

impl RawSettings {
    fn apply_runtime_overrides(&mut self, overrides: &RuntimeOverrides) {
        self.apply_database_override(&overrides.database);
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(interval) = overrides.tracker_poll_interval_ms {
            self.tracker.poll_interval_ms = Some(interval);
        }
        if let Some(push) = overrides.tracker_push {
            self.tracker.push_enabled = Some(push);
        }
        if let Some(retention) = overrides.changes_retention_secs {
            self.changes.retention_secs = Some(retention);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            tracker,
            cache,
            changes,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            tracker: build_tracker_settings(tracker)?,
            cache: build_cache_settings(cache)?,
            changes: build_changes_settings(changes)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_tracker_settings(tracker: RawTrackerSettings) -> Result<TrackerSettings, LoadError> {
    let poll_interval = positive_millis(
        tracker.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        "tracker.poll_interval_ms",
    )?;
    let drain_interval = positive_millis(
        tracker.drain_interval_ms.unwrap_or(DEFAULT_DRAIN_INTERVAL_MS),
        "tracker.drain_interval_ms",
    )?;

    Ok(TrackerSettings {
        poll_interval,
        drain_interval,
        push_enabled: tracker.push_enabled.unwrap_or(true),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let unique_id_attempts = non_zero_u32(
        cache
            .unique_id_attempts
            .unwrap_or(u64::from(DEFAULT_UNIQUE_ID_ATTEMPTS)),
        "cache.unique_id_attempts",
    )?;
    Ok(CacheSettings { unique_id_attempts })
}

fn build_changes_settings(changes: RawChangesSettings) -> Result<ChangesSettings, LoadError> {
    let retention_secs = changes.retention_secs.unwrap_or(DEFAULT_RETENTION_SECS);
    if retention_secs == 0 {
        return Err(LoadError::invalid(
            "changes.retention_secs",
            "must be greater than zero",
        ));
    }
    let refresh_interval = Duration::from_millis(
        changes
            .refresh_interval_ms
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_MS),
    );

    Ok(ChangesSettings {
        retention: Duration::from_secs(retention_secs),
        refresh_interval,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTrackerSettings {
    poll_interval_ms: Option<u64>,
    drain_interval_ms: Option<u64>,
    push_enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    unique_id_attempts: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawChangesSettings {
    retention_secs: Option<u64>,
    refresh_interval_ms: Option<u64>,
}

fn positive_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
