//! API module for shared HTTP API functionality
//!
//! # Design Principle
//!
//! This module contains ONLY pure functions and shared types.
//! Each service wraps these with framework-specific middleware (Axum, etc.).

pub mod auth;

pub use auth::{parse_bearer, ApiAuthError, TokenVerifier};
