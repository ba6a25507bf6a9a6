//! Operator alerts
//!
//! Alerts go two ways: a structured log line whose `event` field is stable
//! enough for log-based alert policies, and an `IngestEvent::Alert` on the
//! event bus for in-process subscribers.

use callsync_common::events::{AlertKind, EventBus, IngestEvent, RunOutcome, RunTrigger};
use callsync_common::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::batch_runs;
use crate::models::BatchRun;

/// Raises alerts for closed runs and scheduler silence
#[derive(Clone)]
pub struct Alerter {
    event_bus: EventBus,
    failure_ratio_threshold: f64,
}

impl Alerter {
    pub fn new(event_bus: EventBus, failure_ratio_threshold: f64) -> Self {
        Self {
            event_bus,
            failure_ratio_threshold,
        }
    }

    /// Alert on a closed run if its outcome warrants it
    pub fn run_closed(&self, run: &BatchRun) -> Option<AlertKind> {
        match run.outcome {
            Some(RunOutcome::Failure) => {
                let message = format!(
                    "{} batch run failed: {} processed, {} failed{}",
                    run.trigger,
                    run.processed_count,
                    run.failed_count,
                    run.error
                        .as_deref()
                        .map(|e| format!(" ({})", e))
                        .unwrap_or_default()
                );
                self.raise(AlertKind::BatchFailed, Some(run.run_id), message);
                Some(AlertKind::BatchFailed)
            }
            Some(RunOutcome::PartialFailure) if run.failure_ratio() > self.failure_ratio_threshold => {
                let message = format!(
                    "{} of {} calls failed ({:.0}%), above the {:.0}% threshold",
                    run.failed_count,
                    run.processed_count,
                    run.failure_ratio() * 100.0,
                    self.failure_ratio_threshold * 100.0
                );
                self.raise(AlertKind::FailureRatioExceeded, Some(run.run_id), message);
                Some(AlertKind::FailureRatioExceeded)
            }
            _ => None,
        }
    }

    /// No scheduled run has started for `silent_for`
    pub fn scheduler_silence(&self, last_started: Option<DateTime<Utc>>, silent_for: chrono::Duration) {
        let message = match last_started {
            Some(ts) => format!(
                "No scheduled batch run for {}h (last started {})",
                silent_for.num_hours(),
                ts.to_rfc3339()
            ),
            None => format!(
                "No scheduled batch run recorded in {}h since startup",
                silent_for.num_hours()
            ),
        };
        self.raise(AlertKind::SchedulerSilence, None, message);
    }

    fn raise(&self, kind: AlertKind, run_id: Option<Uuid>, message: String) {
        let run_field = run_id.map(|id| id.to_string()).unwrap_or_default();
        match kind {
            AlertKind::FailureRatioExceeded => {
                tracing::warn!(event = kind.as_str(), run_id = %run_field, "{}", message)
            }
            _ => tracing::error!(event = kind.as_str(), run_id = %run_field, "{}", message),
        }

        self.event_bus.emit_lossy(IngestEvent::Alert {
            kind,
            run_id,
            message,
            timestamp: Utc::now(),
        });
    }
}

/// Watches for a scheduler that stopped calling the daily trigger
pub struct SilenceWatchdog {
    db: SqlitePool,
    alerter: Alerter,
    threshold: chrono::Duration,
    check_interval: Duration,
    /// Reference point when no scheduled run exists yet
    baseline: DateTime<Utc>,
    /// Reference time already alerted on, so one silence raises one alert
    alerted_for: Mutex<Option<DateTime<Utc>>>,
}

impl SilenceWatchdog {
    pub fn new(
        db: SqlitePool,
        alerter: Alerter,
        threshold: chrono::Duration,
        check_interval: Duration,
        baseline: DateTime<Utc>,
    ) -> Self {
        Self {
            db,
            alerter,
            threshold,
            check_interval,
            baseline,
            alerted_for: Mutex::new(None),
        }
    }

    /// Check once; returns `true` when a new alert was raised
    pub async fn check(&self, now: DateTime<Utc>) -> Result<bool> {
        let last_started = batch_runs::last_started_at(&self.db, RunTrigger::Scheduled).await?;
        let reference = last_started.map_or(self.baseline, |ts| ts.max(self.baseline));
        let silent_for = now - reference;

        if silent_for <= self.threshold {
            return Ok(false);
        }

        {
            let mut alerted = self
                .alerted_for
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *alerted == Some(reference) {
                return Ok(false);
            }
            *alerted = Some(reference);
        }

        self.alerter.scheduler_silence(last_started, silent_for);
        Ok(true)
    }

    /// Run checks every `check_interval` until cancelled
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Scheduler silence watchdog stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.check(Utc::now()).await {
                            tracing::warn!(error = %e, "Scheduler silence check failed");
                        }
                    }
                }
            }
        })
    }
}
