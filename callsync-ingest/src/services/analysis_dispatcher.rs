//! Hand-off of staged calls to the analysis worker pool
//!
//! A dispatch is fire-and-forget: `Accepted` means the pool took the job,
//! not that analysis finished. `Rejected` leaves the call STAGED for the
//! next run to offer again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use super::retry_policy::Retryable;
use crate::models::StorageRef;

/// Result of offering a call to the analysis pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Accepted,
    /// Pool declined (backpressure or unavailable); reason for logs
    Rejected(String),
}

/// Dispatcher-side failures that are not a pool decision
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Analysis dispatcher misconfigured: {0}")]
    Configuration(String),

    #[error("Failed to encode analysis job: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Retryable for DispatchError {
    fn is_retryable(&self) -> bool {
        false
    }
}

/// Analysis job payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub external_call_id: String,
    pub storage_ref: StorageRef,
    pub enqueued_at: DateTime<Utc>,
}

impl AnalysisJob {
    pub fn new(external_call_id: &str, storage_ref: &StorageRef) -> Self {
        Self {
            external_call_id: external_call_id.to_string(),
            storage_ref: storage_ref.clone(),
            enqueued_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AnalysisDispatcher: Send + Sync {
    async fn enqueue(
        &self,
        external_call_id: &str,
        storage_ref: &StorageRef,
    ) -> Result<DispatchOutcome, DispatchError>;
}

/// Posts jobs to the analysis service's HTTP intake
pub struct HttpAnalysisDispatcher {
    http: Client,
    endpoint: String,
}

impl HttpAnalysisDispatcher {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let endpoint = endpoint.into();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(DispatchError::Configuration(format!(
                "endpoint must be an http(s) URL: {}",
                endpoint
            )));
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Configuration(e.to_string()))?;

        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl AnalysisDispatcher for HttpAnalysisDispatcher {
    async fn enqueue(
        &self,
        external_call_id: &str,
        storage_ref: &StorageRef,
    ) -> Result<DispatchOutcome, DispatchError> {
        let job = AnalysisJob::new(external_call_id, storage_ref);

        let response = match self.http.post(&self.endpoint).json(&job).send().await {
            Ok(response) => response,
            Err(e) => return Ok(DispatchOutcome::Rejected(format!("transport error: {}", e))),
        };

        let status = response.status();
        if status.is_success() {
            Ok(DispatchOutcome::Accepted)
        } else {
            Ok(DispatchOutcome::Rejected(format!("HTTP {}", status.as_u16())))
        }
    }
}

/// Bounded in-process queue; the receiver side is the worker pool
pub struct ChannelDispatcher {
    tx: mpsc::Sender<AnalysisJob>,
}

impl ChannelDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AnalysisJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AnalysisDispatcher for ChannelDispatcher {
    async fn enqueue(
        &self,
        external_call_id: &str,
        storage_ref: &StorageRef,
    ) -> Result<DispatchOutcome, DispatchError> {
        let job = AnalysisJob::new(external_call_id, storage_ref);
        match self.tx.try_send(job) {
            Ok(()) => Ok(DispatchOutcome::Accepted),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Ok(DispatchOutcome::Rejected("analysis queue is full".to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Ok(DispatchOutcome::Rejected("analysis queue is closed".to_string()))
            }
        }
    }
}
