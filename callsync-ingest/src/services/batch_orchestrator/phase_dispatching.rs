//! DISPATCHING: offer STAGED calls in the window to the analysis pool

use callsync_common::{Error, Result};
use tokio::time::Instant;
use uuid::Uuid;

use super::BatchOrchestrator;
use crate::db::batch_runs;
use crate::models::{BatchRun, CallRecord, CallStatus, RunPhase};
use crate::services::analysis_dispatcher::DispatchOutcome;

enum Dispatched {
    Accepted,
    Rejected,
    Skipped,
}

impl BatchOrchestrator {
    /// Enqueue STAGED records oldest first; accepted ones become ANALYZED
    ///
    /// Rejections leave the record STAGED so a later run offers it again.
    pub(super) async fn phase_dispatching(&self, run: &mut BatchRun, deadline: Instant) -> Result<()> {
        run.transition_to(RunPhase::Dispatching);
        batch_runs::save_run(&self.db, run).await?;

        let staged = self
            .store
            .find_by_status_and_window(CallStatus::Staged, run.window_start, run.window_end)
            .await?;
        let total = staged.len();

        for (index, record) in staged.into_iter().enumerate() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    run_id = %run.run_id,
                    remaining = total - index,
                    "Deadline reached; staged calls left for the next run"
                );
                break;
            }

            let id = record.external_call_id.clone();
            match self.dispatch_one(run.run_id, record).await {
                Ok(Dispatched::Accepted) => run.dispatched_count += 1,
                Ok(Dispatched::Rejected) => run.dispatch_rejected_count += 1,
                Ok(Dispatched::Skipped) => {}
                Err(e) => {
                    tracing::warn!(external_call_id = %id, error = %e, "Dispatch bookkeeping failed");
                }
            }
        }

        tracing::info!(
            run_id = %run.run_id,
            staged = total,
            dispatched = run.dispatched_count,
            rejected = run.dispatch_rejected_count,
            "Dispatch phase complete"
        );

        batch_runs::save_run(&self.db, run).await?;
        Ok(())
    }

    async fn dispatch_one(&self, run_id: Uuid, record: CallRecord) -> Result<Dispatched> {
        let id = record.external_call_id;
        if !self.store.try_claim(&id, run_id, self.settings.claim_lease).await? {
            return Ok(Dispatched::Skipped);
        }

        let result = self.dispatch_claimed(&id).await;

        if let Err(e) = self.store.release_claim(&id, run_id).await {
            tracing::warn!(external_call_id = %id, error = %e, "Failed to release call claim");
        }

        match result {
            Err(Error::Conflict(msg)) => {
                tracing::warn!(external_call_id = %id, error = %msg, "Concurrent update during dispatch");
                Ok(Dispatched::Skipped)
            }
            other => other,
        }
    }

    async fn dispatch_claimed(&self, id: &str) -> Result<Dispatched> {
        let Some(mut record) = self.store.get(id).await? else {
            return Ok(Dispatched::Skipped);
        };
        if record.status != CallStatus::Staged {
            return Ok(Dispatched::Skipped);
        }
        let Some(storage_ref) = record.storage_ref.clone() else {
            tracing::warn!(external_call_id = %id, "STAGED record without storage reference");
            return Ok(Dispatched::Skipped);
        };

        match self.stager.exists(&storage_ref).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(external_call_id = %id, storage_ref = %storage_ref, "Staged object missing, not dispatching");
                return Ok(Dispatched::Rejected);
            }
            Err(e) => {
                tracing::warn!(external_call_id = %id, error = %e, "Could not verify staged object");
                return Ok(Dispatched::Rejected);
            }
        }

        match self.dispatcher.enqueue(id, &storage_ref).await {
            Ok(DispatchOutcome::Accepted) => {
                record.mark_analyzed();
                self.store.upsert(&record).await?;
                tracing::debug!(external_call_id = %id, "Call handed to analysis");
                Ok(Dispatched::Accepted)
            }
            Ok(DispatchOutcome::Rejected(reason)) => {
                tracing::warn!(external_call_id = %id, reason = %reason, "Analysis pool rejected call");
                Ok(Dispatched::Rejected)
            }
            Err(e) => {
                tracing::warn!(external_call_id = %id, error = %e, "Analysis dispatch failed");
                Ok(Dispatched::Rejected)
            }
        }
    }
}
