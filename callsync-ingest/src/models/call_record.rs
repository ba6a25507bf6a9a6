//! Per-call ingestion state
//!
//! Status machine:
//! DISCOVERED → FETCHED → STAGED → ANALYZED, with DISCOVERED/FETCHED → FAILED
//! and FAILED → DISCOVERED when a retry starts. ANALYZED is final.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::CallMetadata;

/// Ingestion status of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallStatus {
    /// Listed by the provider, nothing fetched yet
    Discovered,
    /// Recording downloaded, not yet durable
    Fetched,
    /// Recording and metadata in object storage
    Staged,
    /// Handed to the analysis worker pool
    Analyzed,
    /// Last attempt failed; see `failure_reason`
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Discovered => "DISCOVERED",
            CallStatus::Fetched => "FETCHED",
            CallStatus::Staged => "STAGED",
            CallStatus::Analyzed => "ANALYZED",
            CallStatus::Failed => "FAILED",
        }
    }

    /// Position along the forward path (FAILED sits outside it)
    fn rank(&self) -> Option<u8> {
        match self {
            CallStatus::Discovered => Some(0),
            CallStatus::Fetched => Some(1),
            CallStatus::Staged => Some(2),
            CallStatus::Analyzed => Some(3),
            CallStatus::Failed => None,
        }
    }

    /// Whether a stored record in `self` may be rewritten with status `next`
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        use CallStatus::*;
        match (*self, next) {
            (Analyzed, Analyzed) => true,
            (Analyzed, _) => false,
            (Failed, Failed) | (Failed, Discovered) => true,
            (Failed, _) => false,
            (Discovered, Failed) | (Fetched, Failed) => true,
            (_, Failed) => false,
            (from, to) => match (from.rank(), to.rank()) {
                (Some(a), Some(b)) => b >= a,
                _ => false,
            },
        }
    }

    /// Statuses a batch run still has work to do for
    pub fn unresolved() -> [CallStatus; 3] {
        [CallStatus::Discovered, CallStatus::Fetched, CallStatus::Failed]
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISCOVERED" => Ok(CallStatus::Discovered),
            "FETCHED" => Ok(CallStatus::Fetched),
            "STAGED" => Ok(CallStatus::Staged),
            "ANALYZED" => Ok(CallStatus::Analyzed),
            "FAILED" => Ok(CallStatus::Failed),
            other => Err(format!("Unknown call status: {}", other)),
        }
    }
}

/// Opaque handle to a staged object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageRef(String);

impl StorageRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable ingestion state of one provider call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Provider call ID; primary key
    pub external_call_id: String,
    /// Immutable once written
    pub occurred_at: DateTime<Utc>,
    pub status: CallStatus,
    /// Set only while FAILED
    pub failure_reason: Option<String>,
    /// Failed attempts so far; never decreases
    pub attempts: u32,
    pub storage_ref: Option<StorageRef>,
    pub metadata: Option<CallMetadata>,
    /// Compare-and-set token; 0 for a record not yet persisted
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    /// New DISCOVERED record for a listed call
    pub fn discovered(metadata: CallMetadata) -> Self {
        let now = Utc::now();
        Self {
            external_call_id: metadata.request_id.clone(),
            occurred_at: metadata.start_time,
            status: CallStatus::Discovered,
            failure_reason: None,
            attempts: 0,
            storage_ref: None,
            metadata: Some(metadata),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_fetched(&mut self) {
        self.status = CallStatus::Fetched;
        self.failure_reason = None;
    }

    pub fn mark_staged(&mut self, storage_ref: StorageRef) {
        self.status = CallStatus::Staged;
        self.storage_ref = Some(storage_ref);
        self.failure_reason = None;
    }

    pub fn mark_analyzed(&mut self) {
        self.status = CallStatus::Analyzed;
    }

    /// Record a failed attempt
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = CallStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.attempts = self.attempts.saturating_add(1);
    }

    /// FAILED → DISCOVERED at the start of a retry; attempts are kept
    pub fn reset_for_retry(&mut self) {
        self.status = CallStatus::Discovered;
        self.failure_reason = None;
    }

    /// Listing metadata, or a minimal stand-in built from the record itself
    pub fn metadata_or_minimal(&self) -> CallMetadata {
        self.metadata
            .clone()
            .unwrap_or_else(|| CallMetadata::minimal(&self.external_call_id, self.occurred_at))
    }
}
