//! Batch run persistence
//!
//! Runs are written on every phase transition and on close, so an operator
//! can follow a run that outlived the HTTP request that started it.

use callsync_common::events::{RunOutcome, RunTrigger};
use callsync_common::time::{format_timestamp, parse_timestamp};
use callsync_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{BatchRun, RunPhase};
use crate::utils::retry_on_lock;

const MAX_LOCK_WAIT_MS: u64 = 5000;

const SELECT_COLUMNS: &str = "run_id, trigger, phase, window_start, window_end, started_at, \
     finished_at, outcome, discovered_count, new_record_count, processed_count, failed_count, \
     skipped_count, dispatched_count, dispatch_rejected_count, deadline_exceeded, error";

/// Insert or update a batch run
pub async fn save_run(pool: &SqlitePool, run: &BatchRun) -> Result<()> {
    let run_id = run.run_id.to_string();
    let window_start = format_timestamp(&run.window_start);
    let window_end = format_timestamp(&run.window_end);
    let started_at = format_timestamp(&run.started_at);
    let finished_at = run.finished_at.as_ref().map(format_timestamp);
    let outcome = run.outcome.map(|o| o.as_str());

    retry_on_lock("save_batch_run", MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO batch_runs (
                run_id, trigger, phase, window_start, window_end, started_at,
                finished_at, outcome, discovered_count, new_record_count, processed_count,
                failed_count, skipped_count, dispatched_count, dispatch_rejected_count,
                deadline_exceeded, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                phase = excluded.phase,
                finished_at = excluded.finished_at,
                outcome = excluded.outcome,
                discovered_count = excluded.discovered_count,
                new_record_count = excluded.new_record_count,
                processed_count = excluded.processed_count,
                failed_count = excluded.failed_count,
                skipped_count = excluded.skipped_count,
                dispatched_count = excluded.dispatched_count,
                dispatch_rejected_count = excluded.dispatch_rejected_count,
                deadline_exceeded = excluded.deadline_exceeded,
                error = excluded.error
            "#,
        )
        .bind(&run_id)
        .bind(run.trigger.as_str())
        .bind(run.phase.as_str())
        .bind(&window_start)
        .bind(&window_end)
        .bind(&started_at)
        .bind(&finished_at)
        .bind(outcome)
        .bind(run.discovered_count as i64)
        .bind(run.new_record_count as i64)
        .bind(run.processed_count as i64)
        .bind(run.failed_count as i64)
        .bind(run.skipped_count as i64)
        .bind(run.dispatched_count as i64)
        .bind(run.dispatch_rejected_count as i64)
        .bind(run.deadline_exceeded)
        .bind(&run.error)
        .execute(pool)
        .await?;

        Ok(())
    })
    .await
}

/// Load a batch run by ID
pub async fn load_run(pool: &SqlitePool, run_id: Uuid) -> Result<Option<BatchRun>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM batch_runs WHERE run_id = ?",
        SELECT_COLUMNS
    ))
    .bind(run_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(run_from_row).transpose()
}

/// Most recently started runs, newest first
pub async fn list_recent_runs(pool: &SqlitePool, limit: u32) -> Result<Vec<BatchRun>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM batch_runs ORDER BY started_at DESC LIMIT ?",
        SELECT_COLUMNS
    ))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.iter().map(run_from_row).collect()
}

/// Start time of the latest run with `trigger`
pub async fn last_started_at(pool: &SqlitePool, trigger: RunTrigger) -> Result<Option<DateTime<Utc>>> {
    let latest: Option<String> =
        sqlx::query_scalar("SELECT MAX(started_at) FROM batch_runs WHERE trigger = ?")
            .bind(trigger.as_str())
            .fetch_one(pool)
            .await?;

    latest.as_deref().map(parse_timestamp).transpose()
}

/// Close runs left open by a previous process
///
/// A run lives inside a background task of the process that started it. Any
/// run still open at startup will never finish, so it is closed as FAILURE.
pub async fn cleanup_stale_runs(pool: &SqlitePool) -> Result<usize> {
    let result = sqlx::query(
        r#"
        UPDATE batch_runs
        SET phase = 'FINISHED',
            outcome = 'FAILURE',
            finished_at = ?,
            error = COALESCE(error, 'Interrupted by service restart')
        WHERE phase != 'FINISHED'
        "#,
    )
    .bind(format_timestamp(&Utc::now()))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() as usize)
}

fn run_from_row(row: &SqliteRow) -> Result<BatchRun> {
    let run_id: String = row.get("run_id");
    let run_id = Uuid::parse_str(&run_id)
        .map_err(|e| Error::Internal(format!("Failed to parse run_id: {}", e)))?;

    let trigger = row
        .get::<String, _>("trigger")
        .parse::<RunTrigger>()
        .map_err(Error::Internal)?;
    let phase = row
        .get::<String, _>("phase")
        .parse::<RunPhase>()
        .map_err(Error::Internal)?;
    let outcome = row
        .get::<Option<String>, _>("outcome")
        .map(|o| o.parse::<RunOutcome>().map_err(Error::Internal))
        .transpose()?;
    let finished_at = row
        .get::<Option<String>, _>("finished_at")
        .as_deref()
        .map(parse_timestamp)
        .transpose()?;

    let count = |column: &str| row.get::<i64, _>(column).max(0) as usize;

    Ok(BatchRun {
        run_id,
        trigger,
        phase,
        window_start: parse_timestamp(&row.get::<String, _>("window_start"))?,
        window_end: parse_timestamp(&row.get::<String, _>("window_end"))?,
        started_at: parse_timestamp(&row.get::<String, _>("started_at"))?,
        finished_at,
        outcome,
        discovered_count: count("discovered_count"),
        new_record_count: count("new_record_count"),
        processed_count: count("processed_count"),
        failed_count: count("failed_count"),
        skipped_count: count("skipped_count"),
        dispatched_count: count("dispatched_count"),
        dispatch_rejected_count: count("dispatch_rejected_count"),
        deadline_exceeded: row.get("deadline_exceeded"),
        error: row.get("error"),
    })
}
