//! Batch run type definitions
//!
//! Shared by the ingestion service (persistence) and event consumers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What started a batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    /// Daily run invoked by the external scheduler
    Scheduled,
    /// Trailing recovery sweep
    Recovery,
    /// Operator-initiated run
    Manual,
}

/// Final outcome of a batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Success,
    PartialFailure,
    Failure,
}

/// Operator alert categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A run closed with `Failure`
    BatchFailed,
    /// A `PartialFailure` run exceeded the tolerated failure ratio
    FailureRatioExceeded,
    /// No scheduled daily run started within the expected interval
    SchedulerSilence,
}

impl AlertKind {
    /// Stable name used in the `event` field of structured logs
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::BatchFailed => "batch_failed",
            AlertKind::FailureRatioExceeded => "batch_failure_ratio_exceeded",
            AlertKind::SchedulerSilence => "scheduler_silence",
        }
    }
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Recovery => "recovery",
            RunTrigger::Manual => "manual",
        }
    }
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "SUCCESS",
            RunOutcome::PartialFailure => "PARTIAL_FAILURE",
            RunOutcome::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(RunTrigger::Scheduled),
            "recovery" => Ok(RunTrigger::Recovery),
            "manual" => Ok(RunTrigger::Manual),
            other => Err(format!("Unknown run trigger: {}", other)),
        }
    }
}

impl FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(RunOutcome::Success),
            "PARTIAL_FAILURE" => Ok(RunOutcome::PartialFailure),
            "FAILURE" => Ok(RunOutcome::Failure),
            other => Err(format!("Unknown run outcome: {}", other)),
        }
    }
}
