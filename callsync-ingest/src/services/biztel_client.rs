//! Biztel call center API client
//!
//! Lists completed queue calls for a time window and downloads their
//! recordings.
//!
//! - `GET /public/api/v1/queue_log`: paged listing
//! - `GET /public/api/v1/monitor/{request_id}`: recording download
//!
//! Requests carry `Authorization: Token <api key>` and pass through a
//! `governor` rate limiter. Transient failures (429, 5xx, timeouts) are
//! retried with the configured [`RetryPolicy`] before surfacing.

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use futures::stream::{BoxStream, StreamExt};
use governor::{Quota, RateLimiter};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

use super::retry_policy::{RetryPolicy, Retryable};
use crate::models::CallMetadata;

const QUEUE_LOG_PATH: &str = "/public/api/v1/queue_log";
const MONITOR_PATH: &str = "/public/api/v1/monitor";
const PROVIDER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Largest page the queue log endpoint accepts
pub const MAX_PAGE_SIZE: usize = 10_000;

/// Provider errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Credentials rejected; fatal for the whole run
    #[error("Biztel authentication failed: {0}")]
    Auth(String),

    /// Call or recording no longer available
    #[error("Not found at Biztel: {0}")]
    NotFound(String),

    /// Rate limit, server error or network failure
    #[error("Transient Biztel error: {0}")]
    Transient(String),

    #[error("Requested window of {requested_hours}h exceeds Biztel retention of {retention_hours}h")]
    WindowTooWide {
        requested_hours: i64,
        retention_hours: i64,
    },

    #[error("Biztel API error {0}: {1}")]
    Api(u16, String),

    #[error("Failed to parse Biztel response: {0}")]
    Parse(String),

    #[error("Biztel client misconfigured: {0}")]
    Configuration(String),
}

impl ProviderError {
    /// Short code recorded in `failure_reason`
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Auth(_) => "AUTH",
            ProviderError::NotFound(_) => "NOT_FOUND",
            ProviderError::Transient(_) => "TRANSIENT",
            ProviderError::WindowTooWide { .. } => "WINDOW_TOO_WIDE",
            ProviderError::Api(_, _) => "API_ERROR",
            ProviderError::Parse(_) => "PARSE_ERROR",
            ProviderError::Configuration(_) => "CONFIGURATION",
        }
    }
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Downloaded audio for one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub audio: Vec<u8>,
    pub content_type: String,
}

/// Source of call listings and recordings
#[async_trait]
pub trait CallProvider: Send + Sync {
    /// Calls that started in `[start, end)`, lazily paged
    ///
    /// The stream ends after the first error.
    fn list_calls(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BoxStream<'_, Result<CallMetadata, ProviderError>>;

    async fn download_recording(&self, external_call_id: &str) -> Result<Recording, ProviderError>;
}

/// Which side of the call to download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingChannel {
    /// Both parties mixed down
    #[default]
    Monaural,
    Left,
    Right,
}

impl RecordingChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingChannel::Monaural => "monaural",
            RecordingChannel::Left => "left",
            RecordingChannel::Right => "right",
        }
    }
}

/// Connection settings for [`BiztelClient`]
#[derive(Debug, Clone)]
pub struct BiztelSettings {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub requests_per_second: u32,
    pub page_size: usize,
    pub channel: RecordingChannel,
    /// Queue log events to list (`COMPLETECALLER`, `COMPLETEAGENT`)
    pub events: Vec<String>,
    pub queue_id: Option<i64>,
    /// Offset of the provider's naive timestamps from UTC
    pub utc_offset: FixedOffset,
    /// How far back the provider keeps calls
    pub retention: chrono::Duration,
}

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// HTTP client for the Biztel API
pub struct BiztelClient {
    http: Client,
    settings: BiztelSettings,
    retry: RetryPolicy,
    rate_limiter: DirectRateLimiter,
}

impl BiztelClient {
    pub fn new(settings: BiztelSettings, retry: RetryPolicy) -> Result<Self, ProviderError> {
        if settings.api_key.trim().is_empty() {
            return Err(ProviderError::Configuration("API key is empty".to_string()));
        }

        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ProviderError::Configuration(e.to_string()))?;

        let per_second = NonZeroU32::new(settings.requests_per_second).ok_or_else(|| {
            ProviderError::Configuration("requests_per_second must be at least 1".to_string())
        })?;
        let rate_limiter = RateLimiter::direct(Quota::per_second(per_second));

        Ok(Self {
            http,
            settings,
            retry,
            rate_limiter,
        })
    }

    /// List at most one call from the last day to confirm connectivity and credentials
    pub async fn test_connection(&self) -> Result<(), ProviderError> {
        let end = Utc::now();
        let start = end - chrono::Duration::days(1);
        let mut calls = self.list_calls(start, end);
        match calls.next().await {
            Some(Err(e)) => Err(e),
            _ => Ok(()),
        }
    }

    fn check_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), ProviderError> {
        if end - start > self.settings.retention {
            return Err(ProviderError::WindowTooWide {
                requested_hours: (end - start).num_hours(),
                retention_hours: self.settings.retention.num_hours(),
            });
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn format_provider_time(&self, ts: DateTime<Utc>) -> String {
        ts.with_timezone(&self.settings.utc_offset)
            .format(PROVIDER_TIME_FORMAT)
            .to_string()
    }

    /// One rate-limited GET, status mapped to [`ProviderError`]
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response, ProviderError> {
        self.rate_limiter.until_ready().await;

        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, format!("Token {}", self.settings.api_key))
            .query(query)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, url, body))
    }

    async fn fetch_page(
        &self,
        cursor: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<QueueLogEntry>, ProviderError> {
        let url = self.url(QUEUE_LOG_PATH);
        let mut query = vec![
            ("created_at_start", self.format_provider_time(cursor)),
            ("created_at_end", self.format_provider_time(end)),
            ("limit", self.settings.page_size.min(MAX_PAGE_SIZE).to_string()),
        ];
        if !self.settings.events.is_empty() {
            query.push(("event", self.settings.events.join(",")));
        }
        if let Some(queue_id) = self.settings.queue_id {
            query.push(("queue_id", queue_id.to_string()));
        }

        self.retry
            .run("biztel_queue_log", || async {
                let response = self.get(&url, &query).await?;
                let page: QueueLogResponse = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::Parse(e.to_string()))?;
                Ok(page.into_entries())
            })
            .await
    }
}

#[async_trait]
impl CallProvider for BiztelClient {
    fn list_calls(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BoxStream<'_, Result<CallMetadata, ProviderError>> {
        Box::pin(try_stream! {
            self.check_window(start, end)?;

            let page_size = self.settings.page_size.min(MAX_PAGE_SIZE);
            let mut cursor = start;
            let mut seen: HashSet<String> = HashSet::new();

            while cursor < end {
                let page = self.fetch_page(cursor, end).await?;
                let full_page = page.len() >= page_size;
                let mut fresh = 0usize;

                for entry in page {
                    let call = match entry.into_metadata(self.settings.utc_offset) {
                        Some(call) => call,
                        None => continue,
                    };
                    if call.start_time > cursor {
                        cursor = call.start_time;
                    }
                    if call.start_time < start || call.start_time >= end {
                        continue;
                    }
                    if !seen.insert(call.request_id.clone()) {
                        continue;
                    }
                    fresh += 1;
                    yield call;
                }

                // The next page restarts at the latest timestamp seen; entries
                // sharing that second are filtered by `seen`.
                if !full_page || fresh == 0 {
                    break;
                }
                tracing::debug!(cursor = %cursor, listed = seen.len(), "Fetching next queue log page");
            }
        })
    }

    async fn download_recording(&self, external_call_id: &str) -> Result<Recording, ProviderError> {
        let url = self.url(&format!("{}/{}", MONITOR_PATH, external_call_id));
        let query = [("content_type", self.settings.channel.as_str().to_string())];

        self.retry
            .run("biztel_monitor", || async {
                let response = self.get(&url, &query).await?;
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let audio = response
                    .bytes()
                    .await
                    .map_err(classify_transport_error)?
                    .to_vec();

                if audio.is_empty() {
                    return Err(ProviderError::NotFound(format!(
                        "empty recording for {}",
                        external_call_id
                    )));
                }

                Ok(Recording { audio, content_type })
            })
            .await
    }
}

fn classify_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_decode() {
        ProviderError::Parse(e.to_string())
    } else {
        ProviderError::Transient(e.to_string())
    }
}

fn classify_status(status: StatusCode, url: &str, body: String) -> ProviderError {
    let detail = if body.is_empty() {
        url.to_string()
    } else {
        format!("{} ({})", url, body.chars().take(200).collect::<String>())
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(detail),
        StatusCode::NOT_FOUND => ProviderError::NotFound(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            ProviderError::Transient(format!("HTTP {}: {}", status.as_u16(), detail))
        }
        s if s.is_server_error() => {
            ProviderError::Transient(format!("HTTP {}: {}", status.as_u16(), detail))
        }
        s => ProviderError::Api(s.as_u16(), detail),
    }
}

/// Queue log responses come either bare or wrapped in `results`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QueueLogResponse {
    Wrapped { results: Vec<QueueLogEntry> },
    Bare(Vec<QueueLogEntry>),
}

impl QueueLogResponse {
    fn into_entries(self) -> Vec<QueueLogEntry> {
        match self {
            QueueLogResponse::Wrapped { results } => results,
            QueueLogResponse::Bare(entries) => entries,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueueLogEntry {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    caller_id: Option<String>,
    #[serde(default)]
    called_id: Option<String>,
    #[serde(default)]
    hold_time: Option<i64>,
    #[serde(default)]
    call_time: Option<i64>,
    #[serde(default)]
    account_id: Option<serde_json::Value>,
    #[serde(default)]
    account_name: Option<String>,
    #[serde(default)]
    queue_id: Option<i64>,
    #[serde(default)]
    queue_name: Option<String>,
    #[serde(default)]
    queue_exten: Option<String>,
    #[serde(default)]
    business_name: Option<String>,
    #[serde(default)]
    event: Option<String>,
    /// 1 when a recording exists
    #[serde(default)]
    monitor_logs: i64,
}

impl QueueLogEntry {
    fn into_metadata(self, offset: FixedOffset) -> Option<CallMetadata> {
        let request_id = self.request_id.filter(|id| !id.trim().is_empty())?;
        let Some(start_time) = self
            .start_time
            .as_deref()
            .and_then(|s| parse_provider_time(s, offset))
        else {
            tracing::warn!(request_id = %request_id, raw = ?self.start_time, "Skipping queue log entry without usable start_time");
            return None;
        };

        let account_id = match self.account_id {
            Some(serde_json::Value::String(s)) => Some(s),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Some(CallMetadata {
            request_id,
            start_time,
            caller_id: self.caller_id,
            called_id: self.called_id,
            hold_time: self.hold_time,
            call_time: self.call_time,
            account_id,
            account_name: self.account_name,
            queue_id: self.queue_id,
            queue_name: self.queue_name,
            queue_exten: self.queue_exten,
            business_name: self.business_name,
            event: self.event,
            has_recording: self.monitor_logs == 1,
        })
    }
}

/// Parse a provider timestamp; naive forms are taken to be in `offset`
fn parse_provider_time(raw: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    [PROVIDER_TIME_FORMAT, "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(|naive| offset.from_local_datetime(&naive).single())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "u", String::new()),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "u", String::new()),
            ProviderError::NotFound(_)
        ));
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "u", String::new()).is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "u", String::new()).is_retryable());
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, "u", String::new()),
            ProviderError::Api(400, "u".to_string())
        );
    }

    #[test]
    fn test_naive_times_use_provider_offset() {
        let jst = FixedOffset::east_opt(9 * 3600).unwrap();
        let parsed = parse_provider_time("2026-10-18 09:00:00", jst).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap());

        let iso = parse_provider_time("2026-10-18T00:00:00Z", jst).unwrap();
        assert_eq!(iso, parsed);
        assert!(parse_provider_time("yesterday", jst).is_none());
    }

    #[test]
    fn test_entry_conversion() {
        let entry: QueueLogEntry = serde_json::from_value(serde_json::json!({
            "request_id": "req-1",
            "start_time": "2026-10-17 10:00:00",
            "account_id": 42,
            "queue_id": 7,
            "event": "COMPLETECALLER",
            "monitor_logs": 1
        }))
        .unwrap();

        let meta = entry.into_metadata(FixedOffset::east_opt(0).unwrap()).unwrap();
        assert_eq!(meta.request_id, "req-1");
        assert_eq!(meta.account_id.as_deref(), Some("42"));
        assert!(meta.has_recording);
    }

    #[test]
    fn test_entry_without_request_id_dropped() {
        let entry: QueueLogEntry = serde_json::from_value(serde_json::json!({
            "start_time": "2026-10-17 10:00:00",
            "monitor_logs": 1
        }))
        .unwrap();
        assert!(entry.into_metadata(FixedOffset::east_opt(0).unwrap()).is_none());
    }

    #[test]
    fn test_wrapped_and_bare_responses() {
        let wrapped: QueueLogResponse =
            serde_json::from_str(r#"{"results": [{"request_id": "a"}]}"#).unwrap();
        let bare: QueueLogResponse = serde_json::from_str(r#"[{"request_id": "b"}]"#).unwrap();
        assert_eq!(wrapped.into_entries().len(), 1);
        assert_eq!(bare.into_entries().len(), 1);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ProviderError::NotFound("x".into()).code(), "NOT_FOUND");
        assert!(!ProviderError::Auth("x".into()).is_retryable());
    }
}
