use chrono::{DateTime, Utc};

/// Where a session's cookie came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    /// Static cookie supplied through the environment
    Environment,
    /// Obtained by a password login
    Login,
    /// Restored from the `site_sessions` table
    Persisted,
}

/// Authentication material for one target
#[derive(Debug, Clone)]
pub struct Session {
    pub target_key: String,
    pub cookie: String,
    pub obtained_at: DateTime<Utc>,
    /// None when the site gives no expiry; such sessions live until rejected
    pub expires_at: Option<DateTime<Utc>>,
    pub source: SessionSource,
}

impl Session {
    pub fn new(target_key: &str, cookie: impl Into<String>, obtained_at: DateTime<Utc>, source: SessionSource) -> Self {
        Self {
            target_key: target_key.to_string(),
            cookie: cookie.into(),
            obtained_at,
            expires_at: None,
            source,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}
