//! FETCHING: list provider calls and record new ones

use callsync_common::{Error, Result};
use futures::StreamExt;
use tokio::time::Instant;

use super::BatchOrchestrator;
use crate::db::batch_runs;
use crate::models::{BatchRun, RunPhase, RunTally};
use crate::services::biztel_client::ProviderError;

enum ListingError {
    Provider(ProviderError),
    Store(Error),
}

impl BatchOrchestrator {
    /// Stream the provider listing into the record store
    ///
    /// Sets `tally.listing_complete` only if the listing ran to the end. An
    /// authentication failure marks the run fatal. Other provider errors
    /// leave the listing incomplete but let the run continue with the calls
    /// already known locally.
    pub(super) async fn phase_fetching(
        &self,
        run: &mut BatchRun,
        tally: &mut RunTally,
        deadline: Instant,
    ) -> Result<()> {
        run.transition_to(RunPhase::Fetching);
        batch_runs::save_run(&self.db, run).await?;

        let (run_id, window_start, window_end) = (run.run_id, run.window_start, run.window_end);
        let retention_floor = self.retention_floor();
        let mut discovered = 0usize;
        let mut new_records = 0usize;
        let mut without_recording = 0usize;
        let mut expired = 0usize;

        let listing = async {
            let mut calls = self.provider.list_calls(window_start, window_end);
            while let Some(item) = calls.next().await {
                let call = item.map_err(ListingError::Provider)?;
                if !call.has_recording {
                    without_recording += 1;
                    continue;
                }
                if call.start_time < retention_floor {
                    tracing::debug!(
                        run_id = %run_id,
                        request_id = %call.request_id,
                        start_time = %call.start_time,
                        retention_floor = %retention_floor,
                        "Listed call is past retention, skipping"
                    );
                    expired += 1;
                    continue;
                }
                discovered += 1;
                if self
                    .store
                    .insert_discovered(&call)
                    .await
                    .map_err(ListingError::Store)?
                {
                    new_records += 1;
                }
            }
            Ok::<(), ListingError>(())
        };

        let result = tokio::time::timeout_at(deadline, listing).await;

        run.discovered_count = discovered;
        run.new_record_count = new_records;

        match result {
            Ok(Ok(())) => {
                tally.listing_complete = true;
                tracing::info!(
                    run_id = %run.run_id,
                    discovered,
                    new_records,
                    without_recording,
                    expired,
                    "Provider listing complete"
                );
            }
            Ok(Err(ListingError::Provider(ProviderError::Auth(msg)))) => {
                tracing::error!(run_id = %run.run_id, error = %msg, "Provider rejected credentials during listing");
                run.error = Some(format!("Provider authentication failed: {}", msg));
                tally.fatal = true;
            }
            Ok(Err(ListingError::Provider(e))) => {
                tracing::error!(
                    run_id = %run.run_id,
                    discovered,
                    error = %e,
                    "Provider listing failed; continuing with known calls"
                );
                run.error = Some(format!("Listing incomplete: {}", e));
            }
            Ok(Err(ListingError::Store(e))) => return Err(e),
            Err(_elapsed) => {
                tracing::warn!(run_id = %run.run_id, discovered, "Deadline reached during provider listing");
                run.deadline_exceeded = true;
                run.error = Some("Deadline reached before listing completed".to_string());
            }
        }

        batch_runs::save_run(&self.db, run).await?;
        Ok(())
    }
}
