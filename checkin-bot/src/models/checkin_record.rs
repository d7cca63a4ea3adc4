use chrono::{DateTime, Utc};
use strum::{AsRefStr, Display, EnumString};

/// Persisted status of a (target, period) record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum CheckinStatus {
    Success,
    Failed,
    /// The site reported the check-in as already done for the period
    Skipped,
}

impl CheckinStatus {
    /// Success and Skipped both close the period; nothing is re-submitted
    pub fn is_done(self) -> bool {
        matches!(self, CheckinStatus::Success | CheckinStatus::Skipped)
    }
}

/// Why a record is in the Failed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Interim: attempts remain in the period
    Retryable,
    /// Retry ceiling reached
    ExhaustedRetries,
    /// Rejected for a reason retrying cannot fix
    Fatal,
    /// No usable session; a later cycle may retry with fixed credentials
    Auth,
}

impl FailureKind {
    /// Terminal kinds are not retried again in the same period
    pub fn is_terminal(self) -> bool {
        matches!(self, FailureKind::ExhaustedRetries | FailureKind::Fatal)
    }
}

/// One check-in record, unique per (target_key, period)
#[derive(Debug, Clone, PartialEq)]
pub struct CheckInRecord {
    pub target_key: String,
    pub period: String,
    pub status: CheckinStatus,
    pub attempt_count: u32,
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
    pub credits_delta: Option<i64>,
    pub credits_after: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckInRecord {
    /// Working record for a period with no attempts yet
    pub fn new(target_key: &str, period: &str, now: DateTime<Utc>) -> Self {
        Self {
            target_key: target_key.to_string(),
            period: period.to_string(),
            status: CheckinStatus::Failed,
            attempt_count: 0,
            failure: None,
            message: None,
            credits_delta: None,
            credits_after: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_success(
        &mut self,
        message: Option<String>,
        credits_delta: Option<i64>,
        credits_after: Option<i64>,
        now: DateTime<Utc>,
    ) {
        self.status = CheckinStatus::Success;
        self.failure = None;
        self.message = message;
        self.credits_delta = credits_delta;
        self.credits_after = credits_after;
        self.updated_at = now;
    }

    pub fn mark_skipped(&mut self, message: Option<String>, now: DateTime<Utc>) {
        self.status = CheckinStatus::Skipped;
        self.failure = None;
        self.message = message;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, kind: FailureKind, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = CheckinStatus::Failed;
        self.failure = Some(kind);
        self.message = Some(message.into());
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_strings_round_trip_through_storage_form() {
        assert_eq!(CheckinStatus::Success.as_ref(), "success");
        assert_eq!(FailureKind::ExhaustedRetries.as_ref(), "exhausted_retries");
        assert_eq!(CheckinStatus::from_str("skipped").unwrap(), CheckinStatus::Skipped);
        assert!(CheckinStatus::from_str("done").is_err());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(FailureKind::ExhaustedRetries.is_terminal());
        assert!(FailureKind::Fatal.is_terminal());
        assert!(!FailureKind::Retryable.is_terminal());
        assert!(!FailureKind::Auth.is_terminal());
        assert!(CheckinStatus::Skipped.is_done());
        assert!(!CheckinStatus::Failed.is_done());
    }
}
