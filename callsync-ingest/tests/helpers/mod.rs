//! Test Helper Utilities
//!
//! Shared fixtures for callsync-ingest integration tests: a scripted call
//! provider, a temp-dir database and object store, and dispatchers.

#![allow(dead_code)]

use async_trait::async_trait;
use callsync_common::events::EventBus;
use callsync_ingest::db::init_database_pool;
use callsync_ingest::models::{CallMetadata, StorageRef};
use callsync_ingest::services::{
    Alerter, AnalysisDispatcher, AnalysisJob, BatchOrchestrator, BatchSettings, CallProvider,
    ChannelDispatcher, DispatchError, DispatchOutcome, LocalObjectStager, ProviderError,
    Recording, RetryPolicy,
};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

// ============================================================================
// Fake provider
// ============================================================================

/// In-memory provider with scriptable failures
#[derive(Default)]
pub struct FakeProvider {
    calls: Mutex<Vec<CallMetadata>>,
    list_error: Mutex<Option<ProviderError>>,
    download_errors: Mutex<HashMap<String, ProviderError>>,
    download_delay: Mutex<Duration>,
    downloads: AtomicUsize,
    listings: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_calls(calls: Vec<CallMetadata>) -> Self {
        let provider = Self::new();
        *provider.calls.lock().unwrap() = calls;
        provider
    }

    pub fn add_call(&self, call: CallMetadata) {
        self.calls.lock().unwrap().push(call);
    }

    /// Listing yields every call, then this error
    pub fn fail_listing(&self, error: ProviderError) {
        *self.list_error.lock().unwrap() = Some(error);
    }

    pub fn fail_download(&self, external_call_id: &str, error: ProviderError) {
        self.download_errors
            .lock()
            .unwrap()
            .insert(external_call_id.to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.download_errors.lock().unwrap().clear();
        *self.list_error.lock().unwrap() = None;
    }

    pub fn set_download_delay(&self, delay: Duration) {
        *self.download_delay.lock().unwrap() = delay;
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn listing_count(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallProvider for FakeProvider {
    fn list_calls(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BoxStream<'_, Result<CallMetadata, ProviderError>> {
        self.listings.fetch_add(1, Ordering::SeqCst);

        let mut items: Vec<Result<CallMetadata, ProviderError>> = self
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.start_time >= start && c.start_time < end)
            .cloned()
            .map(Ok)
            .collect();
        if let Some(error) = self.list_error.lock().unwrap().clone() {
            items.push(Err(error));
        }

        stream::iter(items).boxed()
    }

    async fn download_recording(&self, external_call_id: &str) -> Result<Recording, ProviderError> {
        let delay = *self.download_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.downloads.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.download_errors.lock().unwrap().get(external_call_id) {
            return Err(error.clone());
        }

        Ok(Recording {
            audio: format!("RIFF-{}", external_call_id).into_bytes(),
            content_type: "audio/wav".to_string(),
        })
    }
}

// ============================================================================
// Dispatchers
// ============================================================================

/// Dispatcher whose queue is always full
pub struct RejectingDispatcher {
    pub offered: AtomicUsize,
}

impl RejectingDispatcher {
    pub fn new() -> Self {
        Self {
            offered: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AnalysisDispatcher for RejectingDispatcher {
    async fn enqueue(
        &self,
        _external_call_id: &str,
        _storage_ref: &StorageRef,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.offered.fetch_add(1, Ordering::SeqCst);
        Ok(DispatchOutcome::Rejected("analysis pool saturated".to_string()))
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Database, object store and orchestrator rooted in one temp dir
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub db: SqlitePool,
    pub provider: Arc<FakeProvider>,
    pub stager: Arc<LocalObjectStager>,
    pub event_bus: EventBus,
    pub settings: BatchSettings,
    pub orchestrator: Arc<BatchOrchestrator>,
    /// Receiving end of the default channel dispatcher
    pub jobs: Option<mpsc::Receiver<AnalysisJob>>,
}

impl TestEnv {
    pub async fn new(provider: FakeProvider) -> Self {
        Self::with_settings(provider, BatchSettings::default()).await
    }

    pub async fn with_settings(provider: FakeProvider, settings: BatchSettings) -> Self {
        let (dispatcher, jobs) = ChannelDispatcher::new(1000);
        let mut env = Self::build(provider, settings, Arc::new(dispatcher)).await;
        env.jobs = Some(jobs);
        env
    }

    pub async fn with_dispatcher(
        provider: FakeProvider,
        dispatcher: Arc<dyn AnalysisDispatcher>,
    ) -> Self {
        Self::build(provider, BatchSettings::default(), dispatcher).await
    }

    async fn build(
        provider: FakeProvider,
        settings: BatchSettings,
        dispatcher: Arc<dyn AnalysisDispatcher>,
    ) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db = init_database_pool(&temp_dir.path().join("callsync.db"))
            .await
            .unwrap();
        let provider = Arc::new(provider);
        let stager = Arc::new(LocalObjectStager::new(
            temp_dir.path().join("objects"),
            ChronoDuration::days(7),
            RetryPolicy::no_retry(),
        ));
        let event_bus = EventBus::new(1000);

        let orchestrator = Arc::new(BatchOrchestrator::new(
            db.clone(),
            provider.clone(),
            stager.clone(),
            dispatcher,
            event_bus.clone(),
            Alerter::new(event_bus.clone(), 0.2),
            settings.clone(),
        ));

        Self {
            temp_dir,
            db,
            provider,
            stager,
            event_bus,
            settings,
            orchestrator,
            jobs: None,
        }
    }

    /// Second orchestrator over the same database, provider and objects
    pub fn orchestrator_with(&self, dispatcher: Arc<dyn AnalysisDispatcher>) -> Arc<BatchOrchestrator> {
        Arc::new(BatchOrchestrator::new(
            self.db.clone(),
            self.provider.clone(),
            self.stager.clone(),
            dispatcher,
            self.event_bus.clone(),
            Alerter::new(self.event_bus.clone(), 0.2),
            self.settings.clone(),
        ))
    }
}

// ============================================================================
// Call fixtures
// ============================================================================

pub fn yesterday() -> NaiveDate {
    (Utc::now() - ChronoDuration::days(1)).date_naive()
}

/// Midnight UTC of `date`
pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).unwrap().and_utc()
}

/// A call with a recording
pub fn call_at(id: &str, start_time: DateTime<Utc>) -> CallMetadata {
    let mut call = CallMetadata::minimal(id, start_time);
    call.caller_id = Some("0312345678".to_string());
    call.event = Some("COMPLETECALLER".to_string());
    call
}

/// `count` calls spread one minute apart from 01:00 on `date`, IDs `<prefix>-NN`
pub fn calls_on(date: NaiveDate, prefix: &str, count: usize) -> Vec<CallMetadata> {
    let base = day_start(date) + ChronoDuration::hours(1);
    (0..count)
        .map(|i| {
            call_at(
                &format!("{}-{:02}", prefix, i),
                base + ChronoDuration::minutes(i as i64),
            )
        })
        .collect()
}
