//! callsync-ingest - Call Recording Ingestion Service
//!
//! Pulls call recordings and metadata from the Biztel API, stages them in
//! object storage, tracks per-call state in SQLite and hands staged calls
//! to the analysis worker pool. Runs are triggered over HTTP by an external
//! scheduler (`POST /api/batch/daily`, `POST /api/batch/recovery`).

use anyhow::{Context, Result};
use callsync_common::api::TokenVerifier;
use callsync_common::config::{
    default_config_path, load_toml_config, LogFormat, LoggingConfig, RootFolderInitializer,
    RootFolderResolver,
};
use callsync_common::events::EventBus;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use callsync_ingest::config::{IngestConfig, SCHEDULER_TOKEN_ENV};
use callsync_ingest::db::{self, batch_runs};
use callsync_ingest::services::{
    Alerter, BatchOrchestrator, BiztelClient, HttpAnalysisDispatcher, LocalObjectStager,
    ObjectStager, RecoverySweeper, SilenceWatchdog,
};
use callsync_ingest::AppState;

const MODULE_NAME: &str = "callsync-ingest";

/// Command-line arguments for callsync-ingest
#[derive(Parser, Debug)]
#[command(name = "callsync-ingest")]
#[command(about = "Call recording ingestion and recovery service")]
#[command(version)]
struct Args {
    /// TOML config file
    #[arg(short, long, env = "CALLSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder holding the database and staged objects
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Listen address, overrides `server.bind`
    #[arg(short, long, env = "CALLSYNC_BIND")]
    bind: Option<String>,

    /// Log filter, overrides `logging.level` (RUST_LOG still wins)
    #[arg(long, env = "CALLSYNC_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .or_else(|| default_config_path(MODULE_NAME))
        .unwrap_or_else(|| PathBuf::from(format!("{}.toml", MODULE_NAME)));
    let mut config: IngestConfig = load_toml_config(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    init_tracing(&config.logging);

    info!(
        "Starting {} v{} (git {}, built {}, {})",
        MODULE_NAME,
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE"),
    );
    info!("Config file: {}", config_path.display());

    config.apply_env_overrides();
    config.validate()?;

    // Root folder: CLI → env → TOML → OS default
    let root_folder = RootFolderResolver::new(MODULE_NAME)
        .with_cli_arg(args.root_folder.clone())
        .with_toml_value(config.root_folder.clone())
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .map_err(|e| anyhow::anyhow!("Failed to initialize root folder: {}", e))?;

    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = db::init_database_pool(&db_path).await?;

    let interrupted = batch_runs::cleanup_stale_runs(&db_pool).await?;
    if interrupted > 0 {
        warn!(count = interrupted, "Marked runs interrupted by restart as FAILURE");
    }

    let event_bus = EventBus::new(256);
    let alerter = Alerter::new(event_bus.clone(), config.alerting.failure_ratio_threshold);

    let provider = BiztelClient::new(config.biztel_settings()?, config.retry_policy())
        .context("Failed to build Biztel client")?;
    if let Err(e) = provider.test_connection().await {
        warn!(error = %e, "Biztel API not reachable at startup; runs will retry");
    }

    let objects_root = config
        .storage
        .path
        .clone()
        .unwrap_or_else(|| initializer.objects_path());
    info!("Object storage: {}", objects_root.display());
    let stager = Arc::new(LocalObjectStager::new(
        objects_root,
        chrono::Duration::days(config.storage.ttl_days),
        config.retry_policy(),
    ));

    let dispatcher = HttpAnalysisDispatcher::new(
        config.analysis.endpoint.clone(),
        Duration::from_secs(config.analysis.timeout_secs),
    )
    .context("Failed to build analysis dispatcher")?;
    info!("Analysis endpoint: {}", config.analysis.endpoint);

    let orchestrator = Arc::new(BatchOrchestrator::new(
        db_pool.clone(),
        Arc::new(provider),
        stager.clone(),
        Arc::new(dispatcher),
        event_bus.clone(),
        alerter.clone(),
        config.batch_settings(),
    ));
    let sweeper = Arc::new(RecoverySweeper::new(
        orchestrator.clone(),
        config.batch.recovery_days_back,
    ));

    let token_verifier = TokenVerifier::new(config.auth.scheduler_token.as_deref());
    if !token_verifier.is_enabled() {
        anyhow::bail!(
            "No scheduler token configured; set {} or [auth] scheduler_token",
            SCHEDULER_TOKEN_ENV
        );
    }

    let shutdown = CancellationToken::new();
    let startup_time = Utc::now();

    let watchdog = SilenceWatchdog::new(
        db_pool.clone(),
        alerter,
        chrono::Duration::hours(config.alerting.silence_threshold_hours),
        Duration::from_secs(config.alerting.check_interval_secs),
        startup_time,
    );
    let watchdog_handle = watchdog.spawn(shutdown.clone());

    let cleanup_handle = spawn_storage_cleanup(
        stager,
        Duration::from_secs(config.storage.cleanup_interval_hours * 3600),
        shutdown.clone(),
    );

    let state = AppState::new(db_pool, event_bus, orchestrator, sweeper, token_verifier)
        .with_sync_wait(Duration::from_secs(config.server.sync_wait_secs));
    let app = callsync_ingest::build_router(state);

    let bind = args.bind.unwrap_or(config.server.bind);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = watchdog_handle.await;
    if let Some(handle) = cleanup_handle {
        let _ = handle.await;
    }

    info!("{} stopped", MODULE_NAME);
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info", logging.level)));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }
}

/// Periodically delete staged objects past their TTL; `None` when disabled
fn spawn_storage_cleanup(
    stager: Arc<LocalObjectStager>,
    interval: Duration,
    cancel: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval.is_zero() {
        info!("Periodic storage cleanup disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match stager.cleanup_expired(Utc::now()).await {
                        Ok(deleted) if deleted > 0 => {
                            info!(event = "storage_cleanup", deleted_count = deleted, "Expired staged objects removed");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Storage cleanup failed"),
                    }
                }
            }
        }
    }))
}
