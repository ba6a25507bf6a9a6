//! Batch trigger API handlers
//!
//! POST /api/batch/daily, POST /api/batch/recovery, GET /api/batch/runs

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use callsync_common::events::RunTrigger;
use chrono::{Duration, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    db::batch_runs,
    error::{ApiError, ApiResult},
    models::BatchRun,
    AppState,
};

const DEFAULT_RUN_LIST_LIMIT: u32 = 20;
const MAX_RUN_LIST_LIMIT: u32 = 200;

/// POST /api/batch/daily request
#[derive(Debug, Default, Deserialize)]
pub struct DailyBatchRequest {
    /// `scheduled` (default) or `manual`
    #[serde(default)]
    pub trigger: Option<RunTrigger>,
    /// UTC date to ingest; yesterday when omitted
    #[serde(default)]
    pub date: Option<NaiveDate>,
}

/// POST /api/batch/recovery request
#[derive(Debug, Default, Deserialize)]
pub struct RecoveryBatchRequest {
    /// Accepted for symmetry with the daily route; sweeps always record `recovery`
    #[serde(default)]
    pub trigger: Option<RunTrigger>,
    #[serde(default)]
    pub days_back: Option<u32>,
}

/// Response of both trigger routes
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub run_id: Uuid,
    /// `completed` (200) or `accepted` (202)
    pub status: &'static str,
    /// Final run summary when the run finished inside the wait window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<BatchRun>,
}

#[derive(Debug, Deserialize)]
pub struct RunListQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct RunListResponse {
    pub runs: Vec<BatchRun>,
}

/// POST /api/batch/daily
///
/// Runs ingestion for one UTC day. Answers 200 with the run summary when the
/// run completes within the configured wait, otherwise 202 with the run ID.
pub async fn trigger_daily(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    let request: DailyBatchRequest = parse_optional_body(&body)?;

    let trigger = request.trigger.unwrap_or(RunTrigger::Scheduled);
    if trigger == RunTrigger::Recovery {
        return Err(ApiError::BadRequest(
            "trigger 'recovery' is only valid on /api/batch/recovery".to_string(),
        ));
    }

    let now = Utc::now();
    let date = request
        .date
        .unwrap_or_else(|| (now - Duration::days(1)).date_naive());
    let (start, end) = state.orchestrator.daily_window(date, now)?;

    let run = state.orchestrator.begin(trigger, start, end).await?;
    tracing::info!(run_id = %run.run_id, date = %date, trigger = %trigger, "Daily batch triggered");

    spawn_and_wait(&state, run).await
}

/// POST /api/batch/recovery
///
/// Sweeps the trailing `days_back` days (clamped to provider retention).
pub async fn trigger_recovery(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    let request: RecoveryBatchRequest = parse_optional_body(&body)?;

    if let Some(trigger) = request.trigger.filter(|t| *t != RunTrigger::Recovery) {
        tracing::debug!(requested = %trigger, "Recovery sweep ignores requested trigger");
    }

    let run = state.sweeper.begin(request.days_back).await?;
    tracing::info!(run_id = %run.run_id, days_back = ?request.days_back, "Recovery sweep triggered");

    spawn_and_wait(&state, run).await
}

/// GET /api/batch/runs/:run_id
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<BatchRun>> {
    let run = batch_runs::load_run(&state.db, run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Batch run not found: {}", run_id)))?;
    Ok(Json(run))
}

/// GET /api/batch/runs?limit=
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunListQuery>,
) -> ApiResult<Json<RunListResponse>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUN_LIST_LIMIT)
        .clamp(1, MAX_RUN_LIST_LIMIT);
    let runs = batch_runs::list_recent_runs(&state.db, limit).await?;
    Ok(Json(RunListResponse { runs }))
}

/// Empty body means "all defaults"
fn parse_optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}

/// Execute `run` in the background and wait up to `state.sync_wait` for it
async fn spawn_and_wait(
    state: &AppState,
    run: BatchRun,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    let run_id = run.run_id;
    let mut handle = spawn_run(state, run);

    match tokio::time::timeout(state.sync_wait, &mut handle).await {
        Ok(Ok(Ok(finished))) => Ok((
            StatusCode::OK,
            Json(TriggerResponse {
                run_id,
                status: "completed",
                run: Some(finished),
            }),
        )),
        Ok(Ok(Err(e))) => Err(ApiError::from(e)),
        Ok(Err(join_error)) => Err(ApiError::Internal(format!(
            "Batch run {} task failed: {}",
            run_id, join_error
        ))),
        Err(_) => {
            tracing::info!(run_id = %run_id, "Batch run still in progress; answering 202");
            Ok((
                StatusCode::ACCEPTED,
                Json(TriggerResponse {
                    run_id,
                    status: "accepted",
                    run: None,
                }),
            ))
        }
    }
}

fn spawn_run(state: &AppState, run: BatchRun) -> JoinHandle<callsync_common::Result<BatchRun>> {
    let orchestrator = state.orchestrator.clone();
    let last_error = state.last_error.clone();
    let run_id = run.run_id;

    tokio::spawn(async move {
        let result = orchestrator.execute(run).await;

        let failure = match &result {
            Ok(finished) => finished.error.clone(),
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Batch run could not be persisted");
                Some(e.to_string())
            }
        };
        if let Some(message) = failure {
            *last_error.write().await = Some(format!("run {}: {}", run_id, message));
        }

        result
    })
}

/// Build batch routes
pub fn batch_routes() -> Router<AppState> {
    Router::new()
        .route("/api/batch/daily", post(trigger_daily))
        .route("/api/batch/recovery", post(trigger_recovery))
        .route("/api/batch/runs", get(list_runs))
        .route("/api/batch/runs/:run_id", get(get_run))
}
