//! Service configuration tests
//!
//! Tests that set CALLSYNC_* variables are marked #[serial].

use callsync_common::config::load_toml_config;
use callsync_ingest::config::{
    IngestConfig, BIZTEL_API_KEY_ENV, BIZTEL_BASE_URL_ENV, SCHEDULER_TOKEN_ENV,
};
use callsync_ingest::services::RecordingChannel;
use serial_test::serial;
use std::env;
use std::time::Duration;
use tempfile::TempDir;

fn clear_env() {
    env::remove_var(BIZTEL_API_KEY_ENV);
    env::remove_var(BIZTEL_BASE_URL_ENV);
    env::remove_var(SCHEDULER_TOKEN_ENV);
}

fn load(content: &str) -> IngestConfig {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("callsync-ingest.toml");
    std::fs::write(&path, content).unwrap();
    load_toml_config(&path).unwrap()
}

#[test]
fn test_defaults() {
    let config = IngestConfig::default();
    assert_eq!(config.server.bind, "127.0.0.1:5740");
    assert_eq!(config.batch.concurrency, 4);
    assert_eq!(config.batch.retention_days, 7);
    assert_eq!(config.provider.page_size, 10_000);
    assert_eq!(config.provider.events, vec!["COMPLETECALLER", "COMPLETEAGENT"]);
    assert!(config.validate().is_ok());

    let settings = config.batch_settings();
    assert_eq!(settings.daily_deadline, Duration::from_secs(1800));
    assert_eq!(settings.recovery_deadline, Duration::from_secs(3600));
    assert_eq!(settings.retention, chrono::Duration::days(7));
}

#[test]
fn test_partial_toml_keeps_other_defaults() {
    let config = load(
        r#"
[provider]
base_url = "https://biztel.example.jp"
content_type = "right"
utc_offset_minutes = 540

[batch]
concurrency = 8

[retry]
max_attempts = 5
"#,
    );

    assert_eq!(config.provider.content_type, RecordingChannel::Right);
    assert_eq!(config.provider.timeout_secs, 30);
    assert_eq!(config.batch.concurrency, 8);
    assert_eq!(config.batch.claim_lease_secs, 900);
    assert_eq!(config.retry_policy().max_attempts, 5);
    assert_eq!(config.alerting.silence_threshold_hours, 26);
}

#[test]
fn test_validation_rejects_unusable_values() {
    let mut config = IngestConfig::default();
    config.batch.concurrency = 0;
    assert!(config.validate().is_err());

    let mut config = IngestConfig::default();
    config.alerting.failure_ratio_threshold = 1.5;
    assert!(config.validate().is_err());

    let mut config = IngestConfig::default();
    config.provider.utc_offset_minutes = 48 * 60;
    assert!(config.validate().is_err());
}

#[test]
#[serial]
fn test_biztel_settings_require_key_and_url() {
    clear_env();
    let mut config = IngestConfig::default();
    config.apply_env_overrides();

    let err = config.biztel_settings().unwrap_err().to_string();
    assert!(err.contains(BIZTEL_BASE_URL_ENV), "{}", err);

    config.provider.base_url = "https://biztel.example.jp".to_string();
    let err = config.biztel_settings().unwrap_err().to_string();
    assert!(err.contains(BIZTEL_API_KEY_ENV), "{}", err);

    config.provider.api_key = Some("toml-key".to_string());
    config.provider.utc_offset_minutes = 540;
    let settings = config.biztel_settings().unwrap();
    assert_eq!(settings.api_key, "toml-key");
    assert_eq!(settings.utc_offset.local_minus_utc(), 9 * 3600);
}

#[test]
#[serial]
fn test_environment_overrides_toml_secrets() {
    clear_env();
    env::set_var(BIZTEL_API_KEY_ENV, "env-key");
    env::set_var(SCHEDULER_TOKEN_ENV, "env-token");
    env::set_var(BIZTEL_BASE_URL_ENV, "https://env.example.jp");

    let mut config = load(
        r#"
[provider]
base_url = "https://toml.example.jp"
api_key = "toml-key"

[auth]
scheduler_token = "toml-token"
"#,
    );
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.provider.base_url, "https://env.example.jp");
    assert_eq!(config.provider.api_key.as_deref(), Some("env-key"));
    assert_eq!(config.auth.scheduler_token.as_deref(), Some("env-token"));
}

#[test]
#[serial]
fn test_blank_secrets_are_ignored() {
    clear_env();
    env::set_var(SCHEDULER_TOKEN_ENV, "   ");

    let mut config = IngestConfig::default();
    config.auth.scheduler_token = Some(String::new());
    config.apply_env_overrides();
    clear_env();

    assert!(config.auth.scheduler_token.is_none());
}
