use super::*;
use crate::cache::CacheConfig;

#[test]
fn defaults_resolve_without_any_source() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert!(settings.database.url.is_none());
    assert_eq!(settings.tracker.poll_interval, Duration::from_millis(300));
    assert_eq!(settings.tracker.drain_interval, Duration::from_millis(300));
    assert!(settings.tracker.push_enabled);
    assert_eq!(settings.cache.unique_id_attempts.get(), 64);
    assert_eq!(settings.changes.retention, Duration::from_secs(86_400));
    assert_eq!(settings.changes.refresh_interval, Duration::from_millis(500));
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.tracker.poll_interval_ms = Some(1_000);
    raw.logging.level = Some("info".to_string());

    let overrides = RuntimeOverrides {
        tracker_poll_interval_ms: Some(50),
        tracker_push: Some(false),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_runtime_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.tracker.poll_interval, Duration::from_millis(50));
    assert!(!settings.tracker.push_enabled);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn blank_database_url_is_ignored() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.database.url.is_none());
}

#[test]
fn zero_intervals_are_rejected() {
    let mut raw = RawSettings::default();
    raw.tracker.drain_interval_ms = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero drain interval");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "tracker.drain_interval_ms",
            ..
        }
    ));
}

#[test]
fn zero_unique_id_attempts_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.unique_id_attempts = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn unparsable_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    let err = Settings::from_raw(raw).expect_err("bad level");
    assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
}

#[test]
fn cache_config_mirrors_settings() {
    let mut raw = RawSettings::default();
    raw.tracker.poll_interval_ms = Some(120);
    raw.changes.retention_secs = Some(3_600);
    let settings = Settings::from_raw(raw).expect("valid settings");

    let config = CacheConfig::from(&settings);
    assert_eq!(config.tracker.poll_interval_ms, 120);
    assert_eq!(config.changes.retention_secs, 3_600);
    assert_eq!(config.unique_id_attempts(), 64);
}

#[test]
fn parse_tail_arguments() {
    let args = CliArgs::parse_from(["sitecache", "tail", "--log-json", "true", "--tracker-push", "no"]);

    match args.command {
        Command::Tail(tail) => {
            assert_eq!(tail.overrides.log_json, Some(true));
            assert_eq!(tail.overrides.tracker_push, Some(false));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn parse_changes_arguments() {
    let args = CliArgs::parse_from([
        "sitecache",
        "--config-file",
        "/etc/sitecache.toml",
        "changes",
        "--collection",
        "4",
        "--site",
        "12",
        "--since",
        "900",
        "--database-url",
        "postgres://localhost/sites",
    ]);

    assert_eq!(
        args.config_file.as_deref(),
        Some(std::path::Path::new("/etc/sitecache.toml"))
    );
    match args.command {
        Command::Changes(changes) => {
            assert_eq!(changes.collection, 4);
            assert_eq!(changes.site, Some(12));
            assert_eq!(changes.since, Some(900));
            assert_eq!(
                changes.overrides.database.database_url.as_deref(),
                Some("postgres://localhost/sites")
            );
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn parse_migrate_arguments() {
    let args = CliArgs::parse_from(["sitecache", "migrate", "--database-url", "postgres://db"]);
    match args.command {
        Command::Migrate(migrate) => {
            assert_eq!(migrate.database.database_url.as_deref(), Some("postgres://db"));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn resolved_defaults_match_cache_defaults() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let resolved = CacheConfig::from(&settings);
    let defaults = CacheConfig::default();

    assert_eq!(resolved.tracker.poll_interval_ms, defaults.tracker.poll_interval_ms);
    assert_eq!(resolved.tracker.drain_interval_ms, defaults.tracker.drain_interval_ms);
    assert_eq!(resolved.tracker.push_enabled, defaults.tracker.push_enabled);
    assert_eq!(resolved.changes.retention_secs, defaults.changes.retention_secs);
    assert_eq!(
        resolved.changes.refresh_interval_ms,
        defaults.changes.refresh_interval_ms
    );
    assert_eq!(resolved.unique_id_attempts, defaults.unique_id_attempts);
}
