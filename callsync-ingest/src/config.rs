//! Service configuration for callsync-ingest
//!
//! Resolution priority: CLI → environment → TOML → built-in defaults.
//! The TOML file lives at `<config dir>/callsync/callsync-ingest.toml`
//! unless `--config` points elsewhere. Secrets are normally supplied via
//! `CALLSYNC_BIZTEL_API_KEY` and `CALLSYNC_SCHEDULER_TOKEN`.

use callsync_common::config::LoggingConfig;
use callsync_common::{Error, Result};
use chrono::FixedOffset;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::services::{BatchSettings, BiztelSettings, RecordingChannel, RetryPolicy};

pub const BIZTEL_API_KEY_ENV: &str = "CALLSYNC_BIZTEL_API_KEY";
pub const SCHEDULER_TOKEN_ENV: &str = "CALLSYNC_SCHEDULER_TOKEN";
pub const BIZTEL_BASE_URL_ENV: &str = "CALLSYNC_BIZTEL_BASE_URL";

/// Top-level TOML document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub root_folder: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub storage: StorageConfig,
    pub analysis: AnalysisConfig,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub auth: AuthConfig,
    pub alerting: AlertingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// How long a trigger request waits for its run before answering 202
    pub sync_wait_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5740".to_string(),
            sync_wait_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub requests_per_second: u32,
    pub page_size: usize,
    pub content_type: RecordingChannel,
    pub events: Vec<String>,
    pub queue_id: Option<i64>,
    /// Offset of the provider's local timestamps, e.g. 540 for JST
    pub utc_offset_minutes: i32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            timeout_secs: 30,
            requests_per_second: 10,
            page_size: 10_000,
            content_type: RecordingChannel::Monaural,
            events: vec!["COMPLETECALLER".to_string(), "COMPLETEAGENT".to_string()],
            queue_id: None,
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Object root; `<root folder>/objects` when unset
    pub path: Option<PathBuf>,
    /// Lifetime of staged objects before cleanup may delete them
    pub ttl_days: i64,
    /// Run expired-object cleanup this often (0 disables)
    pub cleanup_interval_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            ttl_days: 7,
            cleanup_interval_hours: 6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:5741/api/analysis/jobs".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub concurrency: usize,
    pub retention_days: i64,
    pub daily_deadline_secs: u64,
    pub recovery_deadline_secs: u64,
    pub recovery_days_back: u32,
    pub claim_lease_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retention_days: 7,
            daily_deadline_secs: 1800,
            recovery_deadline_secs: 3600,
            recovery_days_back: 7,
            claim_lease_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 60_000,
            max_delay_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub scheduler_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// PARTIAL_FAILURE runs above this failed/processed ratio raise an alert
    pub failure_ratio_threshold: f64,
    pub silence_threshold_hours: i64,
    pub check_interval_secs: u64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            failure_ratio_threshold: 0.2,
            silence_threshold_hours: 26,
            check_interval_secs: 900,
        }
    }
}

impl IngestConfig {
    /// Apply environment overrides for the provider URL and secrets
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(BIZTEL_BASE_URL_ENV) {
            if is_valid_key(&url) {
                info!("Biztel base URL loaded from environment variable");
                self.provider.base_url = url;
            }
        }
        self.provider.api_key = resolve_secret(
            "Biztel API key",
            BIZTEL_API_KEY_ENV,
            self.provider.api_key.take(),
        );
        self.auth.scheduler_token = resolve_secret(
            "Scheduler token",
            SCHEDULER_TOKEN_ENV,
            self.auth.scheduler_token.take(),
        );
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch.concurrency == 0 {
            return Err(Error::Config("batch.concurrency must be at least 1".to_string()));
        }
        if self.batch.retention_days < 1 {
            return Err(Error::Config("batch.retention_days must be at least 1".to_string()));
        }
        if self.provider.requests_per_second == 0 {
            return Err(Error::Config(
                "provider.requests_per_second must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.alerting.failure_ratio_threshold) {
            return Err(Error::Config(
                "alerting.failure_ratio_threshold must be between 0 and 1".to_string(),
            ));
        }
        if FixedOffset::east_opt(self.provider.utc_offset_minutes * 60).is_none() {
            return Err(Error::Config(format!(
                "provider.utc_offset_minutes out of range: {}",
                self.provider.utc_offset_minutes
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.batch.retention_days)
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            concurrency: self.batch.concurrency,
            retention: self.retention(),
            daily_deadline: Duration::from_secs(self.batch.daily_deadline_secs),
            recovery_deadline: Duration::from_secs(self.batch.recovery_deadline_secs),
            claim_lease: Duration::from_secs(self.batch.claim_lease_secs),
        }
    }

    /// Provider settings; fails when the base URL or API key is missing
    pub fn biztel_settings(&self) -> Result<BiztelSettings> {
        if !is_valid_key(&self.provider.base_url) {
            return Err(Error::Config(format!(
                "Biztel base URL not configured. Set provider.base_url in the TOML config \
                 or {}",
                BIZTEL_BASE_URL_ENV
            )));
        }

        let api_key = self
            .provider
            .api_key
            .clone()
            .filter(|k| is_valid_key(k))
            .ok_or_else(|| {
                Error::Config(format!(
                    "Biztel API key not configured. Please configure using one of:\n\
                     1. Environment: {}=your-key\n\
                     2. TOML config: [provider] api_key = \"your-key\"",
                    BIZTEL_API_KEY_ENV
                ))
            })?;

        let utc_offset = FixedOffset::east_opt(self.provider.utc_offset_minutes * 60)
            .ok_or_else(|| Error::Config("provider.utc_offset_minutes out of range".to_string()))?;

        Ok(BiztelSettings {
            base_url: self.provider.base_url.clone(),
            api_key,
            timeout: Duration::from_secs(self.provider.timeout_secs),
            requests_per_second: self.provider.requests_per_second,
            page_size: self.provider.page_size,
            channel: self.provider.content_type,
            events: self.provider.events.clone(),
            queue_id: self.provider.queue_id,
            utc_offset,
            retention: self.retention(),
        })
    }
}

/// Non-empty, non-whitespace
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Environment wins over TOML; warns when both are set
fn resolve_secret(label: &str, env_var: &str, toml_value: Option<String>) -> Option<String> {
    let env_value = std::env::var(env_var).ok().filter(|v| is_valid_key(v));
    let toml_value = toml_value.filter(|v| is_valid_key(v));

    match (env_value, toml_value) {
        (Some(env), Some(_)) => {
            warn!(
                "{} found in both {} and TOML config. Using environment (higher priority).",
                label, env_var
            );
            Some(env)
        }
        (Some(env), None) => {
            info!("{} loaded from environment variable", label);
            Some(env)
        }
        (None, Some(toml)) => {
            info!("{} loaded from TOML config", label);
            Some(toml)
        }
        (None, None) => None,
    }
}
