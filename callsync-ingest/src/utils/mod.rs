//! Utility modules for callsync-ingest

pub mod db_retry;

pub use db_retry::retry_on_lock;
