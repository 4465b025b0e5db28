use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the sitecache binary.
#[derive(Debug, Parser)]
#[command(name = "sitecache", version, about = "Change-log tools for the site cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SITECACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Follow the change log and print each record as a JSON line.
    Tail(TailArgs),
    /// Print the retained change window of one collection.
    Changes(ChangesArgs),
    /// Apply pending database migrations.
    Migrate(MigrateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct TailArgs {
    #[command(flatten)]
    pub overrides: RuntimeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct ChangesArgs {
    #[command(flatten)]
    pub overrides: RuntimeOverrides,

    /// Collection whose changes are listed.
    #[arg(long, value_name = "ID")]
    pub collection: i32,

    /// Tenant to inspect; omitted means tenant-less records.
    #[arg(long, value_name = "ID")]
    pub site: Option<i64>,

    /// Only list changes with an id greater than this one.
    #[arg(long, value_name = "ID")]
    pub since: Option<i64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RuntimeOverrides {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the fallback poll interval.
    #[arg(long = "tracker-poll-interval-ms", value_name = "MILLIS")]
    pub tracker_poll_interval_ms: Option<u64>,

    /// Toggle push notification; polling is used when disabled.
    #[arg(
        long = "tracker-push",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub tracker_push: Option<bool>,

    /// Override the change window retention.
    #[arg(long = "changes-retention-secs", value_name = "SECONDS")]
    pub changes_retention_secs: Option<u64>,
}
