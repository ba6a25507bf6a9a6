//! callsync-ingest library interface
//!
//! Exposes the ingestion pipeline and HTTP router for the binary and for
//! integration testing.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use callsync_common::api::TokenVerifier;
use callsync_common::events::EventBus;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use crate::services::{BatchOrchestrator, RecoverySweeper};

/// Default time a trigger request waits for its run before answering 202
const DEFAULT_SYNC_WAIT: Duration = Duration::from_secs(30);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub sweeper: Arc<RecoverySweeper>,
    /// Scheduler bearer-token check for `/api` routes
    pub token_verifier: TokenVerifier,
    pub sync_wait: Duration,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        orchestrator: Arc<BatchOrchestrator>,
        sweeper: Arc<RecoverySweeper>,
        token_verifier: TokenVerifier,
    ) -> Self {
        Self {
            db,
            event_bus,
            orchestrator,
            sweeper,
            token_verifier,
            sync_wait: DEFAULT_SYNC_WAIT,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_sync_wait(mut self, sync_wait: Duration) -> Self {
        self.sync_wait = sync_wait;
        self
    }
}

/// Build application router
///
/// `/health` is public; every `/api` route requires the scheduler token.
pub fn build_router(state: AppState) -> Router {
    use axum::middleware;

    let protected = Router::new()
        .merge(api::batch_routes())
        .merge(api::call_routes())
        .merge(api::storage_routes())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::auth_middleware,
        ));

    Router::new()
        .merge(protected)
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
