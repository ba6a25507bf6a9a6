//! # callsync Common Library
//!
//! Shared code for the callsync services:
//! - Error type used by the record store and service layers
//! - Bootstrap configuration (TOML files, root folder resolution)
//! - Ingestion event types and the EventBus
//! - Scheduler bearer-token validation
//! - Timestamp formatting shared by every persisted table

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
