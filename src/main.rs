use std::{process, sync::Arc};

use sitecache::{
    application::{error::AppError, repos::ChangeReader},
    cache::{CacheConfig, ChangeSource, ChangeTracker, ChangesCaches, handler_fn},
    config,
    domain::changes::{ChangeRecord, CollectionId, SiteId},
    infra::{db::PostgresChangeStore, error::InfraError, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::validation(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        config::Command::Tail(_) => run_tail(settings).await,
        config::Command::Changes(args) => run_changes(settings, args).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn run_tail(settings: config::Settings) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(&settings);
    let store = Arc::new(connect_store(&settings).await?);

    let tracker = ChangeTracker::connect(store, cache_config.tracker.clone()).await;
    tracker
        .subscribe(handler_fn(|record: &ChangeRecord| {
            println!("{}", serde_json::to_string(record)?);
            Ok(())
        }))
        .await;
    info!(mode = ?tracker.mode(), cursor = tracker.cursor(), "Tailing change log");

    tokio::signal::ctrl_c().await.map_err(InfraError::from)?;
    tracker.shutdown().await;
    Ok(())
}

async fn run_changes(settings: config::Settings, args: config::ChangesArgs) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(&settings);
    let store: Arc<dyn ChangeReader> = Arc::new(connect_store(&settings).await?);

    let caches = ChangesCaches::new(store, cache_config.changes.clone());
    let window = caches.for_site(args.site.map(SiteId));
    let collection = CollectionId(args.collection);

    let Some(mut changes) = window
        .get_collection_changes(collection, args.since, None, None)
        .await
    else {
        info!(collection_id = args.collection, site_id = ?args.site, "No retained changes");
        return Ok(());
    };

    changes.sort_unstable_by_key(|record| record.id);
    for record in &changes {
        let line = serde_json::to_string(record)
            .map_err(|err| AppError::unexpected(format!("failed to encode change: {err}")))?;
        println!("{line}");
    }
    info!(
        collection_id = args.collection,
        listed = changes.len(),
        last_change_id = window.last_change_id().await,
        "Listed retained changes"
    );
    Ok(())
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let store = connect_store(&settings).await?;
    PostgresChangeStore::run_migrations(store.pool())
        .await
        .map_err(InfraError::from)?;
    info!("Database migrations applied");
    Ok(())
}

async fn connect_store(settings: &config::Settings) -> Result<PostgresChangeStore, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let pool = PostgresChangeStore::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(InfraError::from)?;

    Ok(PostgresChangeStore::new(pool))
}
