//! Staged object maintenance
//!
//! POST /api/storage/cleanup deletes staged objects past their TTL. The same
//! sweep also runs periodically from `main`.

use axum::{extract::State, routing::post, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::{ApiError, ApiResult},
    AppState,
};

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub deleted_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// POST /api/storage/cleanup
pub async fn cleanup_storage(State(state): State<AppState>) -> ApiResult<Json<CleanupResponse>> {
    let now = Utc::now();
    let deleted_count = state
        .orchestrator
        .stager()
        .cleanup_expired(now)
        .await
        .map_err(|e| ApiError::Internal(format!("Storage cleanup failed: {}", e)))?;

    tracing::info!(
        event = "storage_cleanup",
        deleted_count,
        "Expired staged objects removed"
    );

    Ok(Json(CleanupResponse {
        deleted_count,
        timestamp: now,
    }))
}

pub fn storage_routes() -> Router<AppState> {
    Router::new().route("/api/storage/cleanup", post(cleanup_storage))
}
