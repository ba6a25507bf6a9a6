//! Batch orchestrator
//!
//! Drives one batch run over a time window:
//!
//! STARTED → FETCHING → STAGING → DISPATCHING → FINISHED(outcome)
//!
//! - **FETCHING** (`phase_fetching.rs`): list provider calls, record new ones as DISCOVERED
//! - **STAGING** (`phase_staging.rs`): download + stage unresolved calls with bounded parallelism
//! - **DISPATCHING** (`phase_dispatching.rs`): offer STAGED calls to the analysis pool
//!
//! Per-call failures never abort a run. A provider authentication failure
//! or an incomplete listing fails the run as a whole. Every run carries a
//! deadline; once it passes no new call is started and in-flight calls are
//! allowed to finish.

mod phase_dispatching;
mod phase_fetching;
mod phase_staging;

use callsync_common::events::{EventBus, IngestEvent, RunOutcome, RunTrigger};
use callsync_common::time::start_of_day;
use callsync_common::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::alerting::Alerter;
use super::analysis_dispatcher::AnalysisDispatcher;
use super::biztel_client::CallProvider;
use super::object_stager::ObjectStager;
use crate::db::{batch_runs, CallRecordStore};
use crate::models::{BatchRun, RunTally};

/// Tunables for batch runs
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Calls processed in parallel during STAGING
    pub concurrency: usize,
    /// Provider retention horizon; older calls cannot be fetched
    pub retention: chrono::Duration,
    pub daily_deadline: Duration,
    pub recovery_deadline: Duration,
    /// How long a per-call claim stays valid without release
    pub claim_lease: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retention: chrono::Duration::days(7),
            daily_deadline: Duration::from_secs(1800),
            recovery_deadline: Duration::from_secs(3600),
            claim_lease: Duration::from_secs(900),
        }
    }
}

/// Per-call result inside the STAGING phase
#[derive(Debug)]
enum CallOutcome {
    Staged,
    Failed,
    /// Claimed elsewhere, already done, or lost a concurrent update
    Skipped,
    /// Provider rejected our credentials; stop the run
    Fatal(String),
}

/// Runs the ingestion pipeline over time windows
pub struct BatchOrchestrator {
    db: SqlitePool,
    store: CallRecordStore,
    provider: Arc<dyn CallProvider>,
    stager: Arc<dyn ObjectStager>,
    dispatcher: Arc<dyn AnalysisDispatcher>,
    event_bus: EventBus,
    alerter: Alerter,
    settings: BatchSettings,
}

impl BatchOrchestrator {
    pub fn new(
        db: SqlitePool,
        provider: Arc<dyn CallProvider>,
        stager: Arc<dyn ObjectStager>,
        dispatcher: Arc<dyn AnalysisDispatcher>,
        event_bus: EventBus,
        alerter: Alerter,
        settings: BatchSettings,
    ) -> Self {
        Self {
            store: CallRecordStore::new(db.clone()),
            db,
            provider,
            stager,
            dispatcher,
            event_bus,
            alerter,
            settings,
        }
    }

    pub fn store(&self) -> &CallRecordStore {
        &self.store
    }

    pub fn stager(&self) -> &Arc<dyn ObjectStager> {
        &self.stager
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// `[date 00:00 UTC, +1 day)`, rejected when entirely outside retention or in the future
    pub fn daily_window(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let start = start_of_day(date);
        let end = start + chrono::Duration::days(1);

        if start > now {
            return Err(Error::InvalidInput(format!("Date {} is in the future", date)));
        }
        if end <= now - self.settings.retention {
            return Err(Error::InvalidInput(format!(
                "Date {} is outside the {}-day provider retention window",
                date,
                self.settings.retention.num_days()
            )));
        }
        Ok((start, end))
    }

    /// Create and persist a run without executing it
    pub async fn begin(
        &self,
        trigger: RunTrigger,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<BatchRun> {
        if window_end <= window_start {
            return Err(Error::InvalidInput(format!(
                "Empty window: {} .. {}",
                window_start, window_end
            )));
        }

        let run = BatchRun::new(trigger, window_start, window_end);
        batch_runs::save_run(&self.db, &run).await?;

        tracing::info!(
            event = "batch_started",
            run_id = %run.run_id,
            trigger = %trigger,
            window_start = %window_start,
            window_end = %window_end,
            "Batch run started"
        );

        self.event_bus.emit_lossy(IngestEvent::RunStarted {
            run_id: run.run_id,
            trigger,
            window_start,
            window_end,
            timestamp: Utc::now(),
        });

        Ok(run)
    }

    /// Run the daily ingestion for `date`
    pub async fn run_daily(&self, date: NaiveDate, trigger: RunTrigger) -> Result<BatchRun> {
        let (start, end) = self.daily_window(date, Utc::now())?;
        self.run_window(trigger, start, end).await
    }

    /// Create a run for `[start, end)` and execute it
    pub async fn run_window(
        &self,
        trigger: RunTrigger,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BatchRun> {
        let run = self.begin(trigger, start, end).await?;
        self.execute(run).await
    }

    /// Execute a run created by [`begin`](Self::begin) through to FINISHED
    ///
    /// Returns `Err` only when the run itself could not be persisted.
    pub async fn execute(&self, mut run: BatchRun) -> Result<BatchRun> {
        let started = std::time::Instant::now();
        let deadline = Instant::now() + self.deadline_for(run.trigger);
        let mut tally = RunTally::default();

        if let Err(e) = self.run_phases(&mut run, &mut tally, deadline).await {
            tracing::error!(run_id = %run.run_id, error = %e, "Batch run aborted");
            run.error.get_or_insert_with(|| e.to_string());
            tally.fatal = true;
        }

        tally.processed = run.processed_count;
        tally.failed = run.failed_count;
        tally.deadline_exceeded = run.deadline_exceeded;

        self.close(run, tally.outcome(), started).await
    }

    fn deadline_for(&self, trigger: RunTrigger) -> Duration {
        match trigger {
            RunTrigger::Recovery => self.settings.recovery_deadline,
            RunTrigger::Scheduled | RunTrigger::Manual => self.settings.daily_deadline,
        }
    }

    async fn run_phases(&self, run: &mut BatchRun, tally: &mut RunTally, deadline: Instant) -> Result<()> {
        self.phase_fetching(run, tally, deadline).await?;
        if tally.fatal || run.deadline_exceeded {
            return Ok(());
        }

        self.phase_staging(run, tally, deadline).await?;
        if tally.fatal {
            return Ok(());
        }

        self.phase_dispatching(run, deadline).await
    }

    async fn close(&self, mut run: BatchRun, outcome: RunOutcome, started: std::time::Instant) -> Result<BatchRun> {
        run.finish(outcome);
        batch_runs::save_run(&self.db, &run).await?;

        tracing::info!(
            event = "batch_completed",
            run_id = %run.run_id,
            trigger = %run.trigger,
            outcome = %outcome,
            discovered = run.discovered_count,
            new_records = run.new_record_count,
            processed = run.processed_count,
            failed = run.failed_count,
            skipped = run.skipped_count,
            dispatched = run.dispatched_count,
            dispatch_rejected = run.dispatch_rejected_count,
            deadline_exceeded = run.deadline_exceeded,
            duration_ms = started.elapsed().as_millis() as u64,
            "Batch run finished"
        );

        self.event_bus.emit_lossy(IngestEvent::RunFinished {
            run_id: run.run_id,
            trigger: run.trigger,
            outcome,
            processed_count: run.processed_count,
            failed_count: run.failed_count,
            deadline_exceeded: run.deadline_exceeded,
            timestamp: Utc::now(),
        });

        self.alerter.run_closed(&run);

        Ok(run)
    }

    /// Oldest call time the provider can still serve
    fn retention_floor(&self) -> DateTime<Utc> {
        Utc::now() - self.settings.retention
    }
}
