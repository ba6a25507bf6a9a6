//! Ingestion record store
//!
//! One row per provider call. Two mechanisms keep concurrent runs from
//! corrupting a record:
//!
//! - **Lease**: a run claims a row (`claimed_by`, `claim_expires_at`) with a
//!   single conditional `UPDATE` before working on the call. Only one owner
//!   holds an unexpired claim; ANALYZED rows are never claimable.
//! - **Compare-and-set**: every update carries the `version` it was read at
//!   and bumps it. A stale writer gets `Error::Conflict`.

use callsync_common::time::{format_timestamp, parse_timestamp};
use callsync_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{CallMetadata, CallRecord, CallStatus, StorageRef};
use crate::utils::retry_on_lock;

const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;

const SELECT_COLUMNS: &str = "external_call_id, occurred_at, status, failure_reason, attempts, \
     storage_ref, metadata, version, created_at, updated_at";

/// Durable per-call state keyed by external call ID
#[derive(Clone)]
pub struct CallRecordStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl CallRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
        }
    }

    pub fn with_max_lock_wait_ms(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or update a record, returning the persisted row
    ///
    /// Updates are validated against the stored row (status transition,
    /// immutable `occurred_at`, non-decreasing `attempts`) and applied only
    /// if the stored `version` still equals `record.version`.
    pub async fn upsert(&self, record: &CallRecord) -> Result<CallRecord> {
        match self.get(&record.external_call_id).await? {
            None => self.insert(record).await,
            Some(current) => {
                validate_update(&current, record)?;
                self.compare_and_set(record).await
            }
        }
    }

    async fn insert(&self, record: &CallRecord) -> Result<CallRecord> {
        let now = Utc::now();
        let metadata = encode_metadata(record.metadata.as_ref())?;
        let failure_reason = failure_reason_for(record);
        let storage_ref = record.storage_ref.as_ref().map(|r| r.as_str().to_string());
        let occurred_at = format_timestamp(&record.occurred_at);
        let now_str = format_timestamp(&now);

        let rows = retry_on_lock("call_record_insert", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                INSERT INTO call_records (
                    external_call_id, occurred_at, status, failure_reason, attempts,
                    storage_ref, metadata, version, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
                ON CONFLICT(external_call_id) DO NOTHING
                "#,
            )
            .bind(&record.external_call_id)
            .bind(&occurred_at)
            .bind(record.status.as_str())
            .bind(&failure_reason)
            .bind(record.attempts as i64)
            .bind(&storage_ref)
            .bind(&metadata)
            .bind(&now_str)
            .bind(&now_str)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if rows == 0 {
            return Err(Error::Conflict(format!(
                "Call record {} was created concurrently",
                record.external_call_id
            )));
        }

        self.require(&record.external_call_id).await
    }

    async fn compare_and_set(&self, record: &CallRecord) -> Result<CallRecord> {
        let metadata = encode_metadata(record.metadata.as_ref())?;
        let failure_reason = failure_reason_for(record);
        let storage_ref = record.storage_ref.as_ref().map(|r| r.as_str().to_string());
        let now_str = format_timestamp(&Utc::now());

        let rows = retry_on_lock("call_record_update", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE call_records SET
                    status = ?,
                    failure_reason = ?,
                    attempts = ?,
                    storage_ref = ?,
                    metadata = COALESCE(?, metadata),
                    version = version + 1,
                    updated_at = ?
                WHERE external_call_id = ? AND version = ?
                "#,
            )
            .bind(record.status.as_str())
            .bind(&failure_reason)
            .bind(record.attempts as i64)
            .bind(&storage_ref)
            .bind(&metadata)
            .bind(&now_str)
            .bind(&record.external_call_id)
            .bind(record.version)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if rows == 0 {
            return Err(Error::Conflict(format!(
                "Call record {} changed since version {}",
                record.external_call_id, record.version
            )));
        }

        self.require(&record.external_call_id).await
    }

    /// Create a DISCOVERED record unless one already exists
    ///
    /// Returns `true` when a new row was inserted.
    pub async fn insert_discovered(&self, metadata: &CallMetadata) -> Result<bool> {
        let now_str = format_timestamp(&Utc::now());
        let occurred_at = format_timestamp(&metadata.start_time);
        let encoded = encode_metadata(Some(metadata))?;

        retry_on_lock("call_record_discover", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                INSERT INTO call_records (
                    external_call_id, occurred_at, status, attempts, metadata,
                    version, created_at, updated_at
                ) VALUES (?, ?, 'DISCOVERED', 0, ?, 1, ?, ?)
                ON CONFLICT(external_call_id) DO NOTHING
                "#,
            )
            .bind(&metadata.request_id)
            .bind(&occurred_at)
            .bind(&encoded)
            .bind(&now_str)
            .bind(&now_str)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    pub async fn get(&self, external_call_id: &str) -> Result<Option<CallRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM call_records WHERE external_call_id = ?",
            SELECT_COLUMNS
        ))
        .bind(external_call_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn require(&self, external_call_id: &str) -> Result<CallRecord> {
        self.get(external_call_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Call record {}", external_call_id)))
    }

    /// Records in `status` with `start <= occurred_at < end`, oldest first
    pub async fn find_by_status_and_window(
        &self,
        status: CallStatus,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>> {
        self.find_by_statuses_and_window(&[status], start, end).await
    }

    /// Records in any of `statuses` with `start <= occurred_at < end`, oldest first
    pub async fn find_by_statuses_and_window(
        &self,
        statuses: &[CallStatus],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM call_records \
             WHERE status IN ({}) AND occurred_at >= ? AND occurred_at < ? \
             ORDER BY occurred_at ASC, external_call_id ASC",
            SELECT_COLUMNS, placeholders
        );

        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query
            .bind(format_timestamp(&start))
            .bind(format_timestamp(&end))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Records in any of `statuses` with `occurred_at < cutoff`, oldest first
    pub async fn find_by_statuses_before(
        &self,
        statuses: &[CallStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM call_records \
             WHERE status IN ({}) AND occurred_at < ? \
             ORDER BY occurred_at ASC, external_call_id ASC",
            SELECT_COLUMNS, placeholders
        );

        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query
            .bind(format_timestamp(&cutoff))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Try to take the per-call lease for `owner`
    ///
    /// Granted when the row is unclaimed, already held by `owner`, or the
    /// previous claim expired. Never granted for ANALYZED rows or missing IDs.
    pub async fn try_claim(&self, external_call_id: &str, owner: Uuid, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| Error::InvalidInput(format!("Invalid claim lease: {}", e)))?;
        let expires_at = format_timestamp(&(now + lease));
        let now_str = format_timestamp(&now);
        let owner = owner.to_string();

        retry_on_lock("call_record_claim", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE call_records
                SET claimed_by = ?, claim_expires_at = ?
                WHERE external_call_id = ?
                  AND status != 'ANALYZED'
                  AND (claimed_by IS NULL OR claimed_by = ? OR claim_expires_at < ?)
                "#,
            )
            .bind(&owner)
            .bind(&expires_at)
            .bind(external_call_id)
            .bind(&owner)
            .bind(&now_str)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    /// Drop the lease if `owner` still holds it
    pub async fn release_claim(&self, external_call_id: &str, owner: Uuid) -> Result<()> {
        let owner = owner.to_string();

        retry_on_lock("call_record_release", self.max_lock_wait_ms, || async {
            sqlx::query(
                "UPDATE call_records SET claimed_by = NULL, claim_expires_at = NULL \
                 WHERE external_call_id = ? AND claimed_by = ?",
            )
            .bind(external_call_id)
            .bind(&owner)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Number of records per status
    pub async fn status_counts(&self) -> Result<BTreeMap<String, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM call_records GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("n")))
            .collect())
    }
}

fn validate_update(current: &CallRecord, next: &CallRecord) -> Result<()> {
    if next.version != current.version {
        return Err(Error::Conflict(format!(
            "Call record {} is at version {}, update was based on {}",
            current.external_call_id, current.version, next.version
        )));
    }
    if !current.status.can_transition_to(next.status) {
        return Err(Error::InvalidInput(format!(
            "Call {}: illegal status transition {} -> {}",
            current.external_call_id, current.status, next.status
        )));
    }
    if format_timestamp(&current.occurred_at) != format_timestamp(&next.occurred_at) {
        return Err(Error::InvalidInput(format!(
            "Call {}: occurred_at is immutable",
            current.external_call_id
        )));
    }
    if next.attempts < current.attempts {
        return Err(Error::InvalidInput(format!(
            "Call {}: attempts cannot decrease ({} -> {})",
            current.external_call_id, current.attempts, next.attempts
        )));
    }
    Ok(())
}

/// Failure reasons are kept only while FAILED
fn failure_reason_for(record: &CallRecord) -> Option<String> {
    if record.status == CallStatus::Failed {
        record.failure_reason.clone()
    } else {
        None
    }
}

fn encode_metadata(metadata: Option<&CallMetadata>) -> Result<Option<String>> {
    metadata
        .map(|m| {
            serde_json::to_string(m)
                .map_err(|e| Error::Internal(format!("Failed to serialize call metadata: {}", e)))
        })
        .transpose()
}

fn record_from_row(row: &SqliteRow) -> Result<CallRecord> {
    let status: String = row.get("status");
    let status = status.parse::<CallStatus>().map_err(Error::Internal)?;

    let metadata: Option<String> = row.get("metadata");
    let metadata = metadata
        .map(|m| {
            serde_json::from_str::<CallMetadata>(&m)
                .map_err(|e| Error::Internal(format!("Failed to deserialize call metadata: {}", e)))
        })
        .transpose()?;

    let attempts: i64 = row.get("attempts");
    let storage_ref: Option<String> = row.get("storage_ref");

    Ok(CallRecord {
        external_call_id: row.get("external_call_id"),
        occurred_at: parse_timestamp(&row.get::<String, _>("occurred_at"))?,
        status,
        failure_reason: row.get("failure_reason"),
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        storage_ref: storage_ref.map(StorageRef::new),
        metadata,
        version: row.get("version"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}
