//! Call record lookup
//!
//! GET /api/calls/:external_call_id

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use crate::{
    error::{ApiError, ApiResult},
    models::CallRecord,
    AppState,
};

/// GET /api/calls/:external_call_id
pub async fn get_call(
    State(state): State<AppState>,
    Path(external_call_id): Path<String>,
) -> ApiResult<Json<CallRecord>> {
    let record = state
        .orchestrator
        .store()
        .get(&external_call_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Call not found: {}", external_call_id)))?;
    Ok(Json(record))
}

pub fn call_routes() -> Router<AppState> {
    Router::new().route("/api/calls/:external_call_id", get(get_call))
}
