//! Batch orchestrator integration tests
//!
//! Daily runs against a scripted provider and a temp-dir database.

mod helpers;

use callsync_common::events::{AlertKind, IngestEvent, RunOutcome, RunTrigger};
use callsync_ingest::db::batch_runs;
use callsync_ingest::models::{CallStatus, RunPhase};
use callsync_ingest::services::{BatchSettings, ProviderError};
use helpers::{call_at, calls_on, day_start, yesterday, FakeProvider, RejectingDispatcher, TestEnv};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn test_missing_recordings_yield_partial_failure() {
    let date = yesterday();
    let provider = FakeProvider::with_calls(calls_on(date, "call", 10));
    provider.fail_download("call-03", ProviderError::NotFound("gone".to_string()));
    provider.fail_download("call-07", ProviderError::NotFound("gone".to_string()));
    let mut env = TestEnv::new(provider).await;

    let run = env
        .orchestrator
        .run_daily(date, RunTrigger::Scheduled)
        .await
        .unwrap();

    assert_eq!(run.phase, RunPhase::Finished);
    assert_eq!(run.outcome, Some(RunOutcome::PartialFailure));
    assert_eq!(run.discovered_count, 10);
    assert_eq!(run.new_record_count, 10);
    assert_eq!(run.processed_count, 10);
    assert_eq!(run.failed_count, 2);
    assert_eq!(run.dispatched_count, 8);
    assert!(!run.deadline_exceeded);

    let store = env.orchestrator.store();
    for id in ["call-03", "call-07"] {
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Failed);
        assert_eq!(record.attempts, 1);
        assert!(record.failure_reason.unwrap().starts_with("NOT_FOUND"));
        assert!(record.storage_ref.is_none());
    }

    let analyzed = store.get("call-00").await.unwrap().unwrap();
    assert_eq!(analyzed.status, CallStatus::Analyzed);
    assert!(analyzed.storage_ref.is_some());

    let jobs = env.jobs.as_mut().unwrap();
    let mut dispatched = Vec::new();
    while let Ok(job) = jobs.try_recv() {
        dispatched.push(job.external_call_id);
    }
    assert_eq!(dispatched.len(), 8);
    assert!(!dispatched.contains(&"call-03".to_string()));

    let persisted = batch_runs::load_run(&env.db, run.run_id).await.unwrap().unwrap();
    assert_eq!(persisted.phase, RunPhase::Finished);
    assert_eq!(persisted.outcome, Some(RunOutcome::PartialFailure));
    assert_eq!(persisted.failed_count, 2);
    assert!(persisted.finished_at.is_some());
}

#[tokio::test]
async fn test_missing_recordings_without_analysis_capacity_leave_eight_staged() {
    let date = yesterday();
    let provider = FakeProvider::with_calls(calls_on(date, "call", 10));
    provider.fail_download("call-00", ProviderError::NotFound("gone".to_string()));
    provider.fail_download("call-09", ProviderError::NotFound("gone".to_string()));
    let env = TestEnv::with_dispatcher(provider, Arc::new(RejectingDispatcher::new())).await;

    let run = env
        .orchestrator
        .run_daily(date, RunTrigger::Scheduled)
        .await
        .unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::PartialFailure));
    assert_eq!((run.processed_count, run.failed_count), (10, 2));

    let counts = env.orchestrator.store().status_counts().await.unwrap();
    assert_eq!(counts.get("STAGED"), Some(&8));
    assert_eq!(counts.get("FAILED"), Some(&2));
}

#[tokio::test]
async fn test_every_listed_call_ends_in_a_terminal_status() {
    let date = yesterday();
    let provider = FakeProvider::with_calls(calls_on(date, "call", 6));
    provider.fail_download("call-01", ProviderError::Transient("HTTP 503".to_string()));
    let env = TestEnv::new(provider).await;

    env.orchestrator
        .run_daily(date, RunTrigger::Scheduled)
        .await
        .unwrap();

    for i in 0..6 {
        let record = env
            .orchestrator
            .store()
            .get(&format!("call-{:02}", i))
            .await
            .unwrap()
            .unwrap();
        assert!(
            matches!(
                record.status,
                CallStatus::Staged | CallStatus::Analyzed | CallStatus::Failed
            ),
            "call-{:02} left in {}",
            i,
            record.status
        );
    }
}

#[tokio::test]
async fn test_listing_auth_error_fails_run_without_records() {
    let provider = FakeProvider::new();
    provider.fail_listing(ProviderError::Auth("token revoked".to_string()));
    let env = TestEnv::new(provider).await;
    let mut events = env.event_bus.subscribe();

    let run = env
        .orchestrator
        .run_daily(yesterday(), RunTrigger::Scheduled)
        .await
        .unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Failure));
    assert!(run.error.as_deref().unwrap().contains("authentication"));
    assert_eq!(run.processed_count, 0);
    assert!(env.orchestrator.store().status_counts().await.unwrap().is_empty());
    assert_eq!(env.provider.download_count(), 0);

    let mut alert = None;
    while let Ok(event) = events.try_recv() {
        if let IngestEvent::Alert { kind, run_id, .. } = event {
            alert = Some((kind, run_id));
        }
    }
    assert_eq!(alert, Some((AlertKind::BatchFailed, Some(run.run_id))));
}

#[tokio::test]
async fn test_auth_error_on_download_stops_new_calls() {
    let date = yesterday();
    let provider = FakeProvider::with_calls(calls_on(date, "call", 5));
    provider.fail_download("call-00", ProviderError::Auth("expired".to_string()));
    let settings = BatchSettings {
        concurrency: 1,
        ..BatchSettings::default()
    };
    let env = TestEnv::with_settings(provider, settings).await;

    let run = env
        .orchestrator
        .run_daily(date, RunTrigger::Scheduled)
        .await
        .unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Failure));
    assert_eq!(env.provider.download_count(), 1);
    let untouched = env.orchestrator.store().get("call-04").await.unwrap().unwrap();
    assert_eq!(untouched.status, CallStatus::Discovered);
}

#[tokio::test]
async fn test_incomplete_listing_still_processes_known_calls() {
    let date = yesterday();
    let provider = FakeProvider::with_calls(calls_on(date, "call", 3));
    provider.fail_listing(ProviderError::Transient("connection reset".to_string()));
    let env = TestEnv::new(provider).await;

    let run = env
        .orchestrator
        .run_daily(date, RunTrigger::Scheduled)
        .await
        .unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Failure));
    assert_eq!(run.processed_count, 3);
    assert!(run.error.as_deref().unwrap().starts_with("Listing incomplete"));
}

#[tokio::test]
async fn test_deadline_leaves_remaining_calls_for_next_run() {
    let date = yesterday();
    let provider = FakeProvider::with_calls(calls_on(date, "call", 20));
    provider.set_download_delay(Duration::from_millis(200));
    let settings = BatchSettings {
        concurrency: 1,
        daily_deadline: Duration::from_millis(600),
        ..BatchSettings::default()
    };
    let env = TestEnv::with_settings(provider, settings).await;

    let run = env
        .orchestrator
        .run_daily(date, RunTrigger::Scheduled)
        .await
        .unwrap();

    assert!(run.deadline_exceeded);
    assert!(run.processed_count > 0 && run.processed_count < 20);
    assert_eq!(run.outcome, Some(RunOutcome::PartialFailure));

    let counts = env.orchestrator.store().status_counts().await.unwrap();
    let discovered = counts.get("DISCOVERED").copied().unwrap_or(0) as usize;
    assert_eq!(discovered, 20 - run.processed_count);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let date = yesterday();
    let provider = FakeProvider::with_calls(calls_on(date, "call", 4));
    provider.fail_download("call-02", ProviderError::NotFound("gone".to_string()));
    let env = TestEnv::new(provider).await;

    let first = env
        .orchestrator
        .run_daily(date, RunTrigger::Scheduled)
        .await
        .unwrap();
    let analyzed_before = env.orchestrator.store().get("call-00").await.unwrap().unwrap();

    let second = env
        .orchestrator
        .run_daily(date, RunTrigger::Manual)
        .await
        .unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.new_record_count, 0);
    // Only the failed call is downloaded again
    assert_eq!(env.provider.download_count(), 4 + 1);

    let counts = env.orchestrator.store().status_counts().await.unwrap();
    assert_eq!(counts.values().sum::<i64>(), 4);
    assert_eq!(counts.get("ANALYZED"), Some(&3));

    let analyzed_after = env.orchestrator.store().get("call-00").await.unwrap().unwrap();
    assert_eq!(analyzed_after, analyzed_before);

    let failed = env.orchestrator.store().get("call-02").await.unwrap().unwrap();
    assert_eq!(failed.status, CallStatus::Failed);
    assert_eq!(failed.attempts, 2);
}

#[tokio::test]
async fn test_rejected_dispatch_keeps_calls_staged() {
    let date = yesterday();
    let dispatcher = Arc::new(RejectingDispatcher::new());
    let env = TestEnv::with_dispatcher(
        FakeProvider::with_calls(calls_on(date, "call", 3)),
        dispatcher.clone(),
    )
    .await;

    let run = env
        .orchestrator
        .run_daily(date, RunTrigger::Scheduled)
        .await
        .unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Success));
    assert_eq!(run.dispatched_count, 0);
    assert_eq!(run.dispatch_rejected_count, 3);
    assert_eq!(dispatcher.offered.load(Ordering::SeqCst), 3);

    let record = env.orchestrator.store().get("call-01").await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Staged);
    let storage_ref = record.storage_ref.unwrap();
    let manifest = env.stager.read_manifest(&storage_ref).await.unwrap();
    assert_eq!(manifest.external_call_id, "call-01");
}

#[tokio::test]
async fn test_concurrent_runs_process_each_call_once() {
    let date = yesterday();
    let provider = FakeProvider::with_calls(calls_on(date, "call", 12));
    provider.set_download_delay(Duration::from_millis(20));
    let env = TestEnv::new(provider).await;

    let a = env.orchestrator.clone();
    let b = env.orchestrator.clone();
    let (first, second) = tokio::join!(
        a.run_daily(date, RunTrigger::Scheduled),
        b.run_daily(date, RunTrigger::Manual),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.failed_count + second.failed_count, 0);
    assert_eq!(env.provider.download_count(), first.processed_count + second.processed_count);

    let counts = env.orchestrator.store().status_counts().await.unwrap();
    assert_eq!(counts.values().sum::<i64>(), 12);
    assert_eq!(counts.get("ANALYZED"), Some(&12));
}

#[tokio::test]
async fn test_future_and_expired_dates_rejected() {
    let env = TestEnv::new(FakeProvider::new()).await;
    let today = chrono::Utc::now().date_naive();

    let future = env
        .orchestrator
        .run_daily(today + chrono::Duration::days(2), RunTrigger::Scheduled)
        .await;
    assert!(matches!(future, Err(callsync_common::Error::InvalidInput(_))));

    let expired = env
        .orchestrator
        .run_daily(today - chrono::Duration::days(30), RunTrigger::Scheduled)
        .await;
    assert!(matches!(expired, Err(callsync_common::Error::InvalidInput(_))));

    assert!(batch_runs::list_recent_runs(&env.db, 10).await.unwrap().is_empty());
}

/// Collects formatted log output for assertions
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_listed_calls_past_retention_are_logged_and_skipped() {
    // The oldest day still partly inside the 7-day retention window
    let date = (chrono::Utc::now() - chrono::Duration::days(7)).date_naive();
    let provider = FakeProvider::with_calls(vec![call_at("edge-old", day_start(date))]);
    let env = TestEnv::new(provider).await;

    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let run = env
        .orchestrator
        .run_daily(date, RunTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(run.discovered_count, 0);
    assert!(env.orchestrator.store().get("edge-old").await.unwrap().is_none());
    assert_eq!(env.provider.download_count(), 0);

    let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    let line = output
        .lines()
        .find(|l| l.contains("past retention"))
        .expect("no log line for the skipped call");
    assert!(line.contains("request_id=edge-old"), "{}", line);
    assert!(line.contains(&run.run_id.to_string()), "{}", line);
}
