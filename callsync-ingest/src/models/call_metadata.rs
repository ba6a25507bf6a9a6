//! Listing metadata for one provider call
//!
//! Captured when a call is first listed and stored alongside the record so a
//! later recovery run can stage the call without depending on the listing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider-side description of a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMetadata {
    /// Provider call identifier (Biztel `request_id`)
    pub request_id: String,
    /// When the call started
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub called_id: Option<String>,
    /// Seconds in queue before pickup
    #[serde(default)]
    pub hold_time: Option<i64>,
    /// Talk time in seconds
    #[serde(default)]
    pub call_time: Option<i64>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(default)]
    pub queue_id: Option<i64>,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub queue_exten: Option<String>,
    #[serde(default)]
    pub business_name: Option<String>,
    /// Queue log event that produced the entry (e.g. `COMPLETECALLER`)
    #[serde(default)]
    pub event: Option<String>,
    /// Whether the provider holds a recording for this call
    pub has_recording: bool,
}

impl CallMetadata {
    /// Metadata carrying only the identity fields
    ///
    /// Used when a record predates metadata capture.
    pub fn minimal(request_id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            request_id: request_id.into(),
            start_time,
            caller_id: None,
            called_id: None,
            hold_time: None,
            call_time: None,
            account_id: None,
            account_name: None,
            queue_id: None,
            queue_name: None,
            queue_exten: None,
            business_name: None,
            event: None,
            has_recording: true,
        }
    }
}
