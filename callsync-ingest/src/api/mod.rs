//! HTTP API handlers for callsync-ingest
//!
//! Everything under `/api` sits behind [`auth::auth_middleware`];
//! `/health` does not.

pub mod auth;
pub mod batch;
pub mod calls;
pub mod health;
pub mod storage;

pub use auth::auth_middleware;
pub use batch::batch_routes;
pub use calls::call_routes;
pub use health::health_routes;
pub use storage::storage_routes;
