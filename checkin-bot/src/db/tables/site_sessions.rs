//! Persisted site session operations
//!
//! Kept in a table of their own so cookies never mix with check-in records.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::error::StorageError;
use crate::models::{Session, SessionSource};
use super::super::Database;

fn parse_timestamp(target_key: &str, value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::Corrupt(format!("session '{}' has invalid timestamp '{}'", target_key, value)))
}

impl Database {
    /// Get the stored session for a target
    pub fn load_session(&self, target_key: &str) -> Result<Option<Session>, StorageError> {
        let conn = self.conn()?;

        let row = conn
            .query_row(
                "SELECT cookie, obtained_at, expires_at FROM site_sessions WHERE target_key = ?1",
                [target_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((cookie, obtained_at, expires_at)) = row else {
            return Ok(None);
        };

        let mut session = Session::new(
            target_key,
            cookie,
            parse_timestamp(target_key, &obtained_at)?,
            SessionSource::Persisted,
        );
        if let Some(expires_at) = expires_at {
            session = session.with_expiry(parse_timestamp(target_key, &expires_at)?);
        }
        Ok(Some(session))
    }

    /// Insert or replace the stored session for a target
    pub fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO site_sessions (target_key, cookie, obtained_at, expires_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(target_key) DO UPDATE SET
                cookie = excluded.cookie,
                obtained_at = excluded.obtained_at,
                expires_at = excluded.expires_at",
            rusqlite::params![
                &session.target_key,
                &session.cookie,
                session.obtained_at.to_rfc3339(),
                session.expires_at.map(|at| at.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Delete the stored session for a target
    pub fn delete_session(&self, target_key: &str) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let rows_affected = conn.execute("DELETE FROM site_sessions WHERE target_key = ?1", [target_key])?;
        Ok(rows_affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_session_round_trip_and_delete() {
        let db = Database::in_memory().unwrap();
        let obtained = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let session = Session::new("nodeseek-alice", "session=abc; cf=1", obtained, SessionSource::Login)
            .with_expiry(obtained + Duration::days(7));

        db.save_session(&session).unwrap();
        let loaded = db.load_session("nodeseek-alice").unwrap().unwrap();
        assert_eq!(loaded.cookie, "session=abc; cf=1");
        assert_eq!(loaded.expires_at, session.expires_at);
        assert_eq!(loaded.source, SessionSource::Persisted);

        assert!(db.delete_session("nodeseek-alice").unwrap());
        assert!(db.load_session("nodeseek-alice").unwrap().is_none());
        assert!(!db.delete_session("nodeseek-alice").unwrap());
    }

    #[test]
    fn test_sessions_do_not_touch_records() {
        let db = Database::in_memory().unwrap();
        let session = Session::new("k", "a=b", Utc::now(), SessionSource::Login);
        db.save_session(&session).unwrap();

        assert!(db.list_records_for_period("2024-06-01").unwrap().is_empty());
    }
}
