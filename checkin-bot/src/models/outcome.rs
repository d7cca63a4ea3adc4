/// Result of a single check-in call, as classified by the site adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success {
        message: Option<String>,
        credits_delta: Option<i64>,
        credits_after: Option<i64>,
    },
    /// The site says the period's check-in was already made elsewhere
    AlreadyDone { message: Option<String> },
    RetryableFailure {
        reason: String,
        /// The site no longer accepts the session
        session_expired: bool,
    },
    FatalFailure { reason: String },
}

impl AttemptOutcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        AttemptOutcome::RetryableFailure {
            reason: reason.into(),
            session_expired: false,
        }
    }

    pub fn session_expired(reason: impl Into<String>) -> Self {
        AttemptOutcome::RetryableFailure {
            reason: reason.into(),
            session_expired: true,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        AttemptOutcome::FatalFailure {
            reason: reason.into(),
        }
    }

    #[cfg(test)]
    pub fn success(message: Option<String>) -> Self {
        AttemptOutcome::Success {
            message,
            credits_delta: None,
            credits_after: None,
        }
    }
}
