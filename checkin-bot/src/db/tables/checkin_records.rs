//! Check-in record database operations

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use std::str::FromStr;

use crate::error::StorageError;
use crate::models::{CheckInRecord, CheckinStatus, FailureKind};
use super::super::Database;

const RECORD_COLUMNS: &str = "target_key, period, status, attempt_count, failure_kind, message, credits_delta, credits_after, created_at, updated_at";

/// Row as stored, before the text columns are decoded
struct RawRecord {
    target_key: String,
    period: String,
    status: String,
    attempt_count: i64,
    failure_kind: Option<String>,
    message: Option<String>,
    credits_delta: Option<i64>,
    credits_after: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRecord {
            target_key: row.get(0)?,
            period: row.get(1)?,
            status: row.get(2)?,
            attempt_count: row.get(3)?,
            failure_kind: row.get(4)?,
            message: row.get(5)?,
            credits_delta: row.get(6)?,
            credits_after: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn decode(self) -> Result<CheckInRecord, StorageError> {
        let corrupt = |what: &str, value: &str| {
            StorageError::Corrupt(format!(
                "record ({}, {}) has invalid {}: '{}'",
                self.target_key, self.period, what, value
            ))
        };

        let status = CheckinStatus::from_str(&self.status)
            .map_err(|_| corrupt("status", &self.status))?;
        let failure = match self.failure_kind.as_deref() {
            Some(kind) => Some(FailureKind::from_str(kind).map_err(|_| corrupt("failure_kind", kind))?),
            None => None,
        };
        let attempt_count = u32::try_from(self.attempt_count)
            .map_err(|_| corrupt("attempt_count", &self.attempt_count.to_string()))?;
        let created_at = parse_timestamp(&self.created_at).ok_or_else(|| corrupt("created_at", &self.created_at))?;
        let updated_at = parse_timestamp(&self.updated_at).ok_or_else(|| corrupt("updated_at", &self.updated_at))?;

        Ok(CheckInRecord {
            target_key: self.target_key,
            period: self.period,
            status,
            attempt_count,
            failure,
            message: self.message,
            credits_delta: self.credits_delta,
            credits_after: self.credits_after,
            created_at,
            updated_at,
        })
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn decode_logged(raw: RawRecord) -> Result<CheckInRecord, StorageError> {
    raw.decode().map_err(|e| {
        log::error!("[STORE] {}", e);
        e
    })
}

impl Database {
    /// Get the record for a target in a period
    pub fn load_record(&self, target_key: &str, period: &str) -> Result<Option<CheckInRecord>, StorageError> {
        let conn = self.conn()?;

        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM checkin_records WHERE target_key = ?1 AND period = ?2",
                    RECORD_COLUMNS
                ),
                [target_key, period],
                RawRecord::from_row,
            )
            .optional()
            .map_err(|e| {
                let err = StorageError::from(e);
                log::error!("[STORE] Failed to load ({}, {}): {}", target_key, period, err);
                err
            })?;

        raw.map(decode_logged).transpose()
    }

    /// Insert or update a record, keyed by (target_key, period)
    ///
    /// Runs in its own transaction. A Success or Skipped row is never
    /// overwritten; returns false when the write was refused for that reason.
    pub fn save_record(&self, record: &CheckInRecord) -> Result<bool, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let rows_affected = tx.execute(
            "INSERT INTO checkin_records (target_key, period, status, attempt_count, failure_kind, message, credits_delta, credits_after, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(target_key, period) DO UPDATE SET
                status = excluded.status,
                attempt_count = excluded.attempt_count,
                failure_kind = excluded.failure_kind,
                message = excluded.message,
                credits_delta = excluded.credits_delta,
                credits_after = excluded.credits_after,
                updated_at = excluded.updated_at
             WHERE checkin_records.status NOT IN ('success', 'skipped')",
            rusqlite::params![
                &record.target_key,
                &record.period,
                record.status.as_ref(),
                record.attempt_count,
                record.failure.map(|k| k.as_ref().to_string()),
                &record.message,
                record.credits_delta,
                record.credits_after,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;

        tx.commit()?;

        if rows_affected == 0 {
            log::warn!(
                "[STORE] Refused to overwrite completed record ({}, {})",
                record.target_key,
                record.period
            );
        }
        Ok(rows_affected > 0)
    }

    /// All records of a period, ordered by target
    pub fn list_records_for_period(&self, period: &str) -> Result<Vec<CheckInRecord>, StorageError> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM checkin_records WHERE period = ?1 ORDER BY target_key",
            RECORD_COLUMNS
        ))?;

        let raws = stmt
            .query_map([period], RawRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raws.into_iter().map(decode_logged).collect()
    }

    /// Most recent records of a target, newest period first
    pub fn recent_records(&self, target_key: &str, limit: usize) -> Result<Vec<CheckInRecord>, StorageError> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM checkin_records WHERE target_key = ?1 ORDER BY period DESC LIMIT ?2",
            RECORD_COLUMNS
        ))?;

        let raws = stmt
            .query_map(rusqlite::params![target_key, limit as i64], RawRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raws.into_iter().map(decode_logged).collect()
    }
}
