//! Recovery sweeper integration tests

mod helpers;

use callsync_common::events::{IngestEvent, RunOutcome, RunTrigger};
use callsync_ingest::models::{CallRecord, CallStatus};
use callsync_ingest::services::{ChannelDispatcher, ProviderError, RecoverySweeper};
use chrono::{Duration as ChronoDuration, Utc};
use helpers::{call_at, calls_on, yesterday, FakeProvider, RejectingDispatcher, TestEnv};
use std::sync::Arc;

fn sweeper(env: &TestEnv) -> RecoverySweeper {
    RecoverySweeper::new(env.orchestrator.clone(), 7)
}

#[tokio::test]
async fn test_sweep_retries_failed_calls_without_resetting_attempts() {
    let date = yesterday();
    let provider = FakeProvider::with_calls(calls_on(date, "call", 10));
    provider.fail_download("call-03", ProviderError::NotFound("gone".to_string()));
    provider.fail_download("call-07", ProviderError::Transient("HTTP 503".to_string()));
    let env = TestEnv::new(provider).await;

    env.orchestrator
        .run_daily(date, RunTrigger::Scheduled)
        .await
        .unwrap();
    let analyzed_before = env.orchestrator.store().get("call-00").await.unwrap().unwrap();

    // call-07 recovers, call-03 is still missing
    env.provider.clear_failures();
    env.provider
        .fail_download("call-03", ProviderError::NotFound("gone".to_string()));

    let run = sweeper(&env).sweep(None).await.unwrap();

    assert_eq!(run.trigger, RunTrigger::Recovery);
    assert_eq!(run.processed_count, 2);
    assert_eq!(run.failed_count, 1);
    assert_eq!(run.outcome, Some(RunOutcome::PartialFailure));
    assert_eq!(env.provider.download_count(), 10 + 2);

    let store = env.orchestrator.store();
    let recovered = store.get("call-07").await.unwrap().unwrap();
    assert_eq!(recovered.status, CallStatus::Analyzed);
    assert_eq!(recovered.attempts, 1);
    assert!(recovered.failure_reason.is_none());

    let still_failed = store.get("call-03").await.unwrap().unwrap();
    assert_eq!(still_failed.status, CallStatus::Failed);
    assert_eq!(still_failed.attempts, 2);

    let analyzed_after = store.get("call-00").await.unwrap().unwrap();
    assert_eq!(analyzed_after, analyzed_before);
}

#[tokio::test]
async fn test_sweep_discovers_calls_from_missed_schedule() {
    let three_days_ago = (Utc::now() - ChronoDuration::days(3)).date_naive();
    let env = TestEnv::new(FakeProvider::with_calls(calls_on(three_days_ago, "missed", 5))).await;

    let run = sweeper(&env).sweep(Some(7)).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Success));
    assert_eq!(run.new_record_count, 5);
    assert_eq!(run.processed_count, 5);

    let counts = env.orchestrator.store().status_counts().await.unwrap();
    assert_eq!(counts.get("ANALYZED"), Some(&5));
}

#[tokio::test]
async fn test_sweep_expires_unresolved_records_beyond_retention() {
    let env = TestEnv::new(FakeProvider::new()).await;
    let store = env.orchestrator.store();
    let mut events = env.event_bus.subscribe();

    let discovered = call_at("stale-01", Utc::now() - ChronoDuration::days(8));
    assert!(store.insert_discovered(&discovered).await.unwrap());
    let mut fetched = CallRecord::discovered(call_at("stale-03", Utc::now() - ChronoDuration::days(10)));
    fetched.mark_fetched();
    store.upsert(&fetched).await.unwrap();
    let mut failed = CallRecord::discovered(call_at("stale-02", Utc::now() - ChronoDuration::days(9)));
    failed.mark_failed("NOT_FOUND: gone");
    store.upsert(&failed).await.unwrap();
    let failed_before = store.get("stale-02").await.unwrap().unwrap();

    let run = sweeper(&env).sweep(Some(30)).await.unwrap();

    assert_eq!(run.processed_count, 0);
    assert_eq!(env.provider.download_count(), 0);

    for id in ["stale-01", "stale-03"] {
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Failed, "{}", id);
        assert_eq!(record.attempts, 1);
        assert!(record.failure_reason.unwrap().starts_with("RETENTION_EXPIRED"));
    }
    // Already FAILED records beyond retention stay as they were
    assert_eq!(store.get("stale-02").await.unwrap().unwrap(), failed_before);

    let mut expired_events = 0;
    while let Ok(event) = events.try_recv() {
        if let IngestEvent::CallFailed { run_id, reason, .. } = event {
            assert_eq!(run_id, run.run_id);
            assert!(reason.starts_with("RETENTION_EXPIRED"));
            expired_events += 1;
        }
    }
    assert_eq!(expired_events, 2);

    // A second sweep does not count the same expiry again
    sweeper(&env).sweep(None).await.unwrap();
    assert_eq!(store.get("stale-01").await.unwrap().unwrap().attempts, 1);
}

#[tokio::test]
async fn test_expiry_leaves_records_inside_retention_and_claimed_records() {
    let env = TestEnv::new(FakeProvider::new()).await;
    let store = env.orchestrator.store();

    let stale = call_at("stale-01", Utc::now() - ChronoDuration::days(8));
    assert!(store.insert_discovered(&stale).await.unwrap());
    let recent = call_at("recent-01", Utc::now() - ChronoDuration::days(6));
    assert!(store.insert_discovered(&recent).await.unwrap());

    let other_run = uuid::Uuid::new_v4();
    assert!(store
        .try_claim("stale-01", other_run, std::time::Duration::from_secs(60))
        .await
        .unwrap());

    let expired = env
        .orchestrator
        .expire_beyond_retention(uuid::Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(expired, 0);
    assert_eq!(store.get("stale-01").await.unwrap().unwrap().status, CallStatus::Discovered);
    assert_eq!(store.get("recent-01").await.unwrap().unwrap().status, CallStatus::Discovered);

    store.release_claim("stale-01", other_run).await.unwrap();
    let expired = env
        .orchestrator
        .expire_beyond_retention(uuid::Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(expired, 1);
    assert_eq!(store.get("stale-01").await.unwrap().unwrap().status, CallStatus::Failed);
}

#[tokio::test]
async fn test_sweep_redispatches_staged_calls() {
    let date = yesterday();
    let env = TestEnv::with_dispatcher(
        FakeProvider::with_calls(calls_on(date, "call", 4)),
        Arc::new(RejectingDispatcher::new()),
    )
    .await;

    env.orchestrator
        .run_daily(date, RunTrigger::Scheduled)
        .await
        .unwrap();
    let counts = env.orchestrator.store().status_counts().await.unwrap();
    assert_eq!(counts.get("STAGED"), Some(&4));

    let (dispatcher, mut jobs) = ChannelDispatcher::new(16);
    let recovering = RecoverySweeper::new(env.orchestrator_with(Arc::new(dispatcher)), 7);
    let run = recovering.sweep(None).await.unwrap();

    assert_eq!(run.dispatched_count, 4);
    // Staged calls are not downloaded again
    assert_eq!(env.provider.download_count(), 4);

    let counts = env.orchestrator.store().status_counts().await.unwrap();
    assert_eq!(counts.get("ANALYZED"), Some(&4));

    let mut received = 0;
    while jobs.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, 4);
}

#[tokio::test]
async fn test_plan_clamps_lookback_to_retention() {
    let env = TestEnv::new(FakeProvider::new()).await;
    let sweeper = sweeper(&env);
    let now = Utc::now();

    let plan = sweeper.plan(Some(30), now).unwrap();
    assert!(plan.clamped);
    assert_eq!(plan.lookback_days, 7);
    assert_eq!(plan.window_end, now);
    assert_eq!(plan.window_start, now - ChronoDuration::days(7));

    let plan = sweeper.plan(Some(2), now).unwrap();
    assert!(!plan.clamped);
    assert_eq!(plan.window_start, now - ChronoDuration::days(2));

    let plan = sweeper.plan(None, now).unwrap();
    assert_eq!(plan.lookback_days, 7);

    assert!(matches!(
        sweeper.plan(Some(0), now),
        Err(callsync_common::Error::InvalidInput(_))
    ));
}
