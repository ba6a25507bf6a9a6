//! Batch run lifecycle
//!
//! STARTED → FETCHING → STAGING → DISPATCHING → FINISHED(outcome).
//! Only the orchestrator that created a run mutates it.

use callsync_common::events::{RunOutcome, RunTrigger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Run phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunPhase {
    Started,
    /// Listing calls from the provider
    Fetching,
    /// Downloading and staging recordings
    Staging,
    /// Handing staged calls to analysis
    Dispatching,
    Finished,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Started => "STARTED",
            RunPhase::Fetching => "FETCHING",
            RunPhase::Staging => "STAGING",
            RunPhase::Dispatching => "DISPATCHING",
            RunPhase::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTED" => Ok(RunPhase::Started),
            "FETCHING" => Ok(RunPhase::Fetching),
            "STAGING" => Ok(RunPhase::Staging),
            "DISPATCHING" => Ok(RunPhase::Dispatching),
            "FINISHED" => Ok(RunPhase::Finished),
            other => Err(format!("Unknown run phase: {}", other)),
        }
    }
}

/// One execution of the ingestion pipeline over a time window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRun {
    pub run_id: Uuid,
    pub trigger: RunTrigger,
    pub phase: RunPhase,
    /// Inclusive window start
    pub window_start: DateTime<Utc>,
    /// Exclusive window end
    pub window_end: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `None` while the run is in progress
    pub outcome: Option<RunOutcome>,
    /// Calls with a recording returned by the provider listing
    pub discovered_count: usize,
    /// Listed calls that had no local record before this run
    pub new_record_count: usize,
    /// Calls that reached a terminal per-run result (staged or failed)
    pub processed_count: usize,
    pub failed_count: usize,
    /// Calls skipped because another run held them or they were already done
    pub skipped_count: usize,
    pub dispatched_count: usize,
    pub dispatch_rejected_count: usize,
    /// Calls left untouched because the deadline passed
    pub deadline_exceeded: bool,
    /// Run-level error (auth failure, listing failure)
    pub error: Option<String>,
}

impl BatchRun {
    pub fn new(trigger: RunTrigger, window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            trigger,
            phase: RunPhase::Started,
            window_start,
            window_end,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            discovered_count: 0,
            new_record_count: 0,
            processed_count: 0,
            failed_count: 0,
            skipped_count: 0,
            dispatched_count: 0,
            dispatch_rejected_count: 0,
            deadline_exceeded: false,
            error: None,
        }
    }

    pub fn transition_to(&mut self, phase: RunPhase) {
        tracing::debug!(
            run_id = %self.run_id,
            from = %self.phase,
            to = %phase,
            "Batch run phase transition"
        );
        self.phase = phase;
    }

    /// Close the run with its outcome
    pub fn finish(&mut self, outcome: RunOutcome) {
        self.phase = RunPhase::Finished;
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
    }

    pub fn is_finished(&self) -> bool {
        self.phase == RunPhase::Finished
    }

    /// Share of processed calls that failed (0.0 when nothing was processed)
    pub fn failure_ratio(&self) -> f64 {
        if self.processed_count == 0 {
            0.0
        } else {
            self.failed_count as f64 / self.processed_count as f64
        }
    }
}

/// What happened during a run, before it is reduced to an outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTally {
    /// Provider listing ran to completion
    pub listing_complete: bool,
    /// Run-level fatal error (authentication)
    pub fatal: bool,
    pub deadline_exceeded: bool,
    pub processed: usize,
    pub failed: usize,
}

impl RunTally {
    /// Reduce the tally to SUCCESS / PARTIAL_FAILURE / FAILURE
    pub fn outcome(&self) -> RunOutcome {
        if self.fatal || !self.listing_complete {
            return RunOutcome::Failure;
        }
        if self.deadline_exceeded {
            return if self.processed == 0 {
                RunOutcome::Failure
            } else {
                RunOutcome::PartialFailure
            };
        }
        if self.processed == 0 || self.failed == 0 {
            RunOutcome::Success
        } else if self.failed >= self.processed {
            RunOutcome::Failure
        } else {
            RunOutcome::PartialFailure
        }
    }
}
