//! Data models for callsync-ingest

pub mod batch_run;
pub mod call_metadata;
pub mod call_record;

pub use batch_run::{BatchRun, RunPhase, RunTally};
pub use call_metadata::CallMetadata;
pub use call_record::{CallRecord, CallStatus, StorageRef};
