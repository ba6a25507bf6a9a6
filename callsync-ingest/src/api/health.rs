//! Health check endpoint
//!
//! Unauthenticated; used by the hosting platform's liveness probe.

use axum::{extract::State, routing::get, Json, Router};
use callsync_common::events::RunTrigger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::{db::batch_runs, AppState};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the database could not be queried
    pub status: String,
    /// Module name ("callsync-ingest")
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
    /// Last error message if any (for diagnostics)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Start of the most recent scheduled daily run
    pub last_scheduled_run_at: Option<DateTime<Utc>>,
    /// Call records per status
    pub record_counts: BTreeMap<String, i64>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let mut last_error = state.last_error.read().await.clone();
    let mut status = "ok";

    let last_scheduled_run_at =
        match batch_runs::last_started_at(&state.db, RunTrigger::Scheduled).await {
            Ok(ts) => ts,
            Err(e) => {
                status = "degraded";
                last_error = Some(e.to_string());
                None
            }
        };

    let record_counts = match state.orchestrator.store().status_counts().await {
        Ok(counts) => counts,
        Err(e) => {
            status = "degraded";
            last_error = Some(e.to_string());
            BTreeMap::new()
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        module: "callsync-ingest".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        last_error,
        last_scheduled_run_at,
        record_counts,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
