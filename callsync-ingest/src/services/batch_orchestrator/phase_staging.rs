//! STAGING: download and stage every unresolved call in the window

use callsync_common::events::IngestEvent;
use callsync_common::{Error, Result};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use uuid::Uuid;

use super::{BatchOrchestrator, CallOutcome};
use crate::db::batch_runs;
use crate::models::{BatchRun, CallRecord, CallStatus, RunPhase, RunTally};
use crate::services::biztel_client::ProviderError;

impl BatchOrchestrator {
    /// Process DISCOVERED, FETCHED and FAILED records, oldest first
    ///
    /// At most `concurrency` calls are in flight. New calls stop starting
    /// when the deadline passes or the provider rejects our credentials;
    /// calls already started always run to completion.
    pub(super) async fn phase_staging(
        &self,
        run: &mut BatchRun,
        tally: &mut RunTally,
        deadline: Instant,
    ) -> Result<()> {
        run.transition_to(RunPhase::Staging);
        batch_runs::save_run(&self.db, run).await?;

        let floor = run.window_start.max(self.retention_floor());
        let work = self
            .store
            .find_by_statuses_and_window(&CallStatus::unresolved(), floor, run.window_end)
            .await?;

        let concurrency = self.settings.concurrency.max(1);
        tracing::info!(
            run_id = %run.run_id,
            pending = work.len(),
            concurrency,
            "Staging unresolved calls"
        );

        let run_id = run.run_id;
        let mut queue = work.into_iter().peekable();
        let mut tasks = FuturesUnordered::new();
        let mut fatal: Option<String> = None;

        loop {
            while tasks.len() < concurrency && fatal.is_none() && queue.peek().is_some() {
                if Instant::now() >= deadline {
                    run.deadline_exceeded = true;
                    break;
                }
                if let Some(record) = queue.next() {
                    tasks.push(self.process_call(run_id, record));
                }
            }

            match tasks.next().await {
                Some(CallOutcome::Staged) => run.processed_count += 1,
                Some(CallOutcome::Failed) => {
                    run.processed_count += 1;
                    run.failed_count += 1;
                }
                Some(CallOutcome::Skipped) => run.skipped_count += 1,
                Some(CallOutcome::Fatal(msg)) => {
                    if fatal.is_none() {
                        tracing::error!(run_id = %run_id, error = %msg, "Provider rejected credentials; no new calls will start");
                        fatal = Some(msg);
                    }
                }
                None => break,
            }
        }

        if run.deadline_exceeded {
            tracing::warn!(
                run_id = %run_id,
                processed = run.processed_count,
                remaining = queue.len(),
                "Deadline reached; remaining calls left for the next run"
            );
        }

        if let Some(msg) = fatal {
            run.error = Some(format!("Provider authentication failed: {}", msg));
            tally.fatal = true;
        }

        batch_runs::save_run(&self.db, run).await?;
        Ok(())
    }

    /// Fail DISCOVERED and FETCHED records the provider no longer serves
    ///
    /// Such records fall below every run's staging floor, so without this
    /// they would stay unresolved forever. Each one is claimed and written
    /// through the compare-and-set path like any other failure. Returns how
    /// many records were expired.
    pub async fn expire_beyond_retention(&self, run_id: Uuid) -> Result<usize> {
        let floor = self.retention_floor();
        let stale = self
            .store
            .find_by_statuses_before(&[CallStatus::Discovered, CallStatus::Fetched], floor)
            .await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let reason = format!(
            "RETENTION_EXPIRED: recording older than {} days is no longer served by the provider",
            self.settings.retention.num_days()
        );
        let mut expired = 0;

        for record in stale {
            let id = record.external_call_id;
            match self.store.try_claim(&id, run_id, self.settings.claim_lease).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(external_call_id = %id, "Expired call claimed elsewhere, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(external_call_id = %id, error = %e, "Could not claim expired call");
                    continue;
                }
            }

            let result = match self.store.get(&id).await {
                Ok(Some(current))
                    if matches!(current.status, CallStatus::Discovered | CallStatus::Fetched)
                        && current.occurred_at < floor =>
                {
                    self.fail_call(run_id, current, reason.clone()).await.map(Some)
                }
                Ok(_) => Ok(None),
                Err(e) => Err(e),
            };

            match result {
                Ok(Some(_)) => expired += 1,
                Ok(None) => {}
                Err(Error::Conflict(msg)) => {
                    tracing::warn!(external_call_id = %id, error = %msg, "Concurrent update, not expiring call");
                }
                Err(e) => {
                    tracing::error!(external_call_id = %id, error = %e, "Record store failure while expiring call");
                }
            }

            if let Err(e) = self.store.release_claim(&id, run_id).await {
                tracing::warn!(external_call_id = %id, error = %e, "Failed to release call claim");
            }
        }

        tracing::info!(
            event = "calls_expired",
            run_id = %run_id,
            count = expired,
            retention_floor = %floor,
            "Unresolved calls past provider retention marked FAILED"
        );

        Ok(expired)
    }

    /// Claim, stage and release one call; never returns an error
    async fn process_call(&self, run_id: Uuid, record: CallRecord) -> CallOutcome {
        let id = record.external_call_id;

        match self.store.try_claim(&id, run_id, self.settings.claim_lease).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(external_call_id = %id, "Call claimed elsewhere or already analyzed");
                return CallOutcome::Skipped;
            }
            Err(e) => {
                tracing::warn!(external_call_id = %id, error = %e, "Could not claim call");
                return CallOutcome::Skipped;
            }
        }

        let outcome = match self.stage_claimed(run_id, &id).await {
            Ok(outcome) => outcome,
            Err(Error::Conflict(msg)) => {
                tracing::warn!(external_call_id = %id, error = %msg, "Concurrent update, skipping call");
                CallOutcome::Skipped
            }
            Err(e) => {
                // Record stays DISCOVERED/FETCHED and is retried by the next run
                tracing::error!(external_call_id = %id, error = %e, "Record store failure while staging call");
                CallOutcome::Failed
            }
        };

        if let Err(e) = self.store.release_claim(&id, run_id).await {
            tracing::warn!(external_call_id = %id, error = %e, "Failed to release call claim");
        }

        outcome
    }

    async fn stage_claimed(&self, run_id: Uuid, id: &str) -> Result<CallOutcome> {
        let Some(mut record) = self.store.get(id).await? else {
            return Ok(CallOutcome::Skipped);
        };

        match record.status {
            CallStatus::Staged | CallStatus::Analyzed => return Ok(CallOutcome::Skipped),
            CallStatus::Failed => {
                record.reset_for_retry();
                record = self.store.upsert(&record).await?;
            }
            CallStatus::Discovered | CallStatus::Fetched => {}
        }

        let metadata = record.metadata_or_minimal();

        let recording = match self.provider.download_recording(id).await {
            Ok(recording) => recording,
            Err(ProviderError::Auth(msg)) => return Ok(CallOutcome::Fatal(msg)),
            Err(e) => {
                return self
                    .fail_call(run_id, record, format!("{}: {}", e.code(), e))
                    .await
            }
        };

        record.mark_fetched();
        record = self.store.upsert(&record).await?;

        let storage_ref = match self.stager.stage(id, &recording, &metadata).await {
            Ok(storage_ref) => storage_ref,
            Err(e) => {
                return self
                    .fail_call(run_id, record, format!("STORAGE_ERROR: {}", e))
                    .await
            }
        };

        record.mark_staged(storage_ref);
        self.store.upsert(&record).await?;

        Ok(CallOutcome::Staged)
    }

    pub(super) async fn fail_call(&self, run_id: Uuid, mut record: CallRecord, reason: String) -> Result<CallOutcome> {
        record.mark_failed(reason.clone());
        let saved = self.store.upsert(&record).await?;

        tracing::warn!(
            event = "call_failed",
            run_id = %run_id,
            external_call_id = %saved.external_call_id,
            attempts = saved.attempts,
            reason = %reason,
            "Call failed"
        );

        self.event_bus.emit_lossy(IngestEvent::CallFailed {
            run_id,
            external_call_id: saved.external_call_id,
            reason,
            attempts: saved.attempts,
            timestamp: Utc::now(),
        });

        Ok(CallOutcome::Failed)
    }
}
