//! Service modules for call ingestion
//!
//! - `biztel_client`: provider listing and recording download
//! - `object_stager`: durable staging of recordings
//! - `analysis_dispatcher`: hand-off to the analysis worker pool
//! - `batch_orchestrator`: one batch run over a window
//! - `recovery_sweeper`: trailing-window recovery runs
//! - `alerting`: operator alerts and the scheduler silence watchdog

pub mod alerting;
pub mod analysis_dispatcher;
pub mod batch_orchestrator;
pub mod biztel_client;
pub mod object_stager;
pub mod recovery_sweeper;
pub mod retry_policy;

pub use alerting::{Alerter, SilenceWatchdog};
pub use analysis_dispatcher::{
    AnalysisDispatcher, AnalysisJob, ChannelDispatcher, DispatchError, DispatchOutcome,
    HttpAnalysisDispatcher,
};
pub use batch_orchestrator::{BatchOrchestrator, BatchSettings};
pub use biztel_client::{
    BiztelClient, BiztelSettings, CallProvider, ProviderError, Recording, RecordingChannel,
};
pub use object_stager::{LocalObjectStager, ObjectManifest, ObjectStager, StorageError};
pub use recovery_sweeper::{RecoverySweeper, SweepPlan};
pub use retry_policy::{RetryPolicy, Retryable};
