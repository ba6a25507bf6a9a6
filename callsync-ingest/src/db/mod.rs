//! SQLite persistence for callsync-ingest
//!
//! Two tables: `call_records` (one row per provider call) and `batch_runs`.

pub mod batch_runs;
pub mod call_records;

pub use call_records::CallRecordStore;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

/// Connections in the shared pool
const MAX_CONNECTIONS: u32 = 8;

/// Open (creating if needed) the database and ensure tables exist
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::debug!(path = %db_path.display(), "Connecting to database");

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create tables and indexes if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS call_records (
            external_call_id TEXT PRIMARY KEY,
            occurred_at TEXT NOT NULL,
            status TEXT NOT NULL,
            failure_reason TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            storage_ref TEXT,
            metadata TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            claimed_by TEXT,
            claim_expires_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_call_records_status_occurred \
         ON call_records (status, occurred_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batch_runs (
            run_id TEXT PRIMARY KEY,
            trigger TEXT NOT NULL,
            phase TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            outcome TEXT,
            discovered_count INTEGER NOT NULL DEFAULT 0,
            new_record_count INTEGER NOT NULL DEFAULT 0,
            processed_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            skipped_count INTEGER NOT NULL DEFAULT 0,
            dispatched_count INTEGER NOT NULL DEFAULT 0,
            dispatch_rejected_count INTEGER NOT NULL DEFAULT 0,
            deadline_exceeded INTEGER NOT NULL DEFAULT 0,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_batch_runs_trigger_started \
         ON batch_runs (trigger, started_at)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized (call_records, batch_runs)");

    Ok(())
}
