//! Bearer-token middleware for scheduler-facing routes
//!
//! Applied to everything under `/api`. `/health` is mounted outside it.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::{ApiError, AppState};

/// Reject requests that do not carry the scheduler's bearer token
///
/// Missing or malformed header → 401, unknown token → 403. No handler
/// runs for a rejected request.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if let Err(e) = state.token_verifier.verify_header(header) {
        warn!(
            method = %request.method(),
            path = %request.uri().path(),
            reason = %e,
            "Rejected unauthenticated trigger request"
        );
        return Err(if e.is_unauthenticated() {
            ApiError::Unauthorized(e.to_string())
        } else {
            ApiError::Forbidden(e.to_string())
        });
    }

    Ok(next.run(request).await)
}
