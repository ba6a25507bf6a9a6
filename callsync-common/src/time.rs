//! Timestamp utilities
//!
//! Every timestamp persisted by callsync is stored as fixed-width RFC 3339
//! UTC text (`2026-10-18T03:00:00.000000Z`). Fixed width keeps SQLite's
//! lexicographic `TEXT` comparison identical to chronological order, which
//! the window queries and claim-expiry checks depend on.

use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};

use crate::{Error, Result};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp in the canonical storage form
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp (any RFC 3339 offset is accepted and normalized to UTC)
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse timestamp '{}': {}", s, e)))
}

/// Midnight UTC at the start of `date`
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}
