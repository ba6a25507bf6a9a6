//! Recovery sweeper
//!
//! Re-runs the batch path over a trailing window so that missed schedules,
//! partial failures and rejected dispatches converge. The window is
//! `[now - lookback, now]` with the lookback clamped to provider retention.
//!
//! The unresolved set is:
//! - local records in DISCOVERED, FETCHED or FAILED inside the window
//! - calls the provider lists that have no local record yet
//!
//! STAGED records in the window are offered to analysis again. ANALYZED
//! records are never claimed, so the sweep cannot touch them.
//!
//! Before the window is processed, DISCOVERED and FETCHED records older
//! than provider retention are marked FAILED (`RETENTION_EXPIRED`). No run
//! can fetch them any more.

use callsync_common::events::RunTrigger;
use callsync_common::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::batch_orchestrator::BatchOrchestrator;
use crate::models::{BatchRun, CallStatus};

/// Resolved window of one sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPlan {
    pub lookback_days: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// The requested lookback exceeded retention and was shortened
    pub clamped: bool,
}

pub struct RecoverySweeper {
    orchestrator: Arc<BatchOrchestrator>,
    default_days_back: u32,
}

impl RecoverySweeper {
    pub fn new(orchestrator: Arc<BatchOrchestrator>, default_days_back: u32) -> Self {
        Self {
            orchestrator,
            default_days_back,
        }
    }

    /// Compute the sweep window for `days_back` (default when `None`)
    pub fn plan(&self, days_back: Option<u32>, now: DateTime<Utc>) -> Result<SweepPlan> {
        let requested = days_back.unwrap_or(self.default_days_back);
        if requested == 0 {
            return Err(Error::InvalidInput("days_back must be at least 1".to_string()));
        }

        let retention = self.orchestrator.settings().retention;
        let retention_days = retention.num_days().max(1) as u32;
        let clamped = requested > retention_days;
        let lookback_days = requested.min(retention_days);

        let lookback = chrono::Duration::days(lookback_days as i64).min(retention);

        Ok(SweepPlan {
            lookback_days,
            window_start: now - lookback,
            window_end: now,
            clamped,
        })
    }

    /// Plan the sweep and create its run without executing it
    pub async fn begin(&self, days_back: Option<u32>) -> Result<BatchRun> {
        let plan = self.plan(days_back, Utc::now())?;
        if plan.clamped {
            tracing::warn!(
                requested = days_back.unwrap_or(self.default_days_back),
                lookback_days = plan.lookback_days,
                "Recovery lookback clamped to provider retention"
            );
        }

        let store = self.orchestrator.store();
        let unresolved = store
            .find_by_statuses_and_window(&CallStatus::unresolved(), plan.window_start, plan.window_end)
            .await?;
        let staged = store
            .find_by_status_and_window(CallStatus::Staged, plan.window_start, plan.window_end)
            .await?;
        let failed = unresolved
            .iter()
            .filter(|r| r.status == CallStatus::Failed)
            .count();

        tracing::info!(
            lookback_days = plan.lookback_days,
            window_start = %plan.window_start,
            window_end = %plan.window_end,
            unresolved = unresolved.len(),
            failed,
            staged_awaiting_dispatch = staged.len(),
            "Recovery sweep planned"
        );

        let run = self
            .orchestrator
            .begin(RunTrigger::Recovery, plan.window_start, plan.window_end)
            .await?;
        if let Err(e) = self.orchestrator.expire_beyond_retention(run.run_id).await {
            tracing::error!(run_id = %run.run_id, error = %e, "Failed to expire calls past retention");
        }
        Ok(run)
    }

    /// Plan and execute a sweep
    pub async fn sweep(&self, days_back: Option<u32>) -> Result<BatchRun> {
        let run = self.begin(days_back).await?;
        self.orchestrator.execute(run).await
    }

    pub fn orchestrator(&self) -> &Arc<BatchOrchestrator> {
        &self.orchestrator
    }
}
