//! Session lifecycle per target
//!
//! Sources are tried in order: in-memory cache, persisted session (when
//! enabled), static cookie from the environment, password login. A static
//! cookie that the site rejected is not offered again for the rest of the
//! process, so the next acquire falls through to login.

use chrono::Duration as ChronoDuration;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::AuthError;
use crate::models::{Session, SessionSource, Target};
use crate::sites::SiteRegistry;

/// Where cookie and password values are looked up by variable name
pub trait CredentialSource: Send + Sync {
    fn lookup(&self, name: &str) -> Option<String>;
}

/// Process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn lookup(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }
}

impl CredentialSource for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

pub struct SessionManager {
    sites: Arc<SiteRegistry>,
    credentials: Arc<dyn CredentialSource>,
    /// Set only when sessions are persisted
    db: Option<Arc<Database>>,
    clock: Arc<dyn Clock>,
    session_ttl: Duration,
    cache: RwLock<HashMap<String, Session>>,
    rejected_env: RwLock<HashSet<String>>,
}

impl SessionManager {
    pub fn new(
        sites: Arc<SiteRegistry>,
        credentials: Arc<dyn CredentialSource>,
        db: Option<Arc<Database>>,
        clock: Arc<dyn Clock>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            sites,
            credentials,
            db,
            clock,
            session_ttl,
            cache: RwLock::new(HashMap::new()),
            rejected_env: RwLock::new(HashSet::new()),
        }
    }

    /// Return a usable session, authenticating if none is cached
    pub async fn acquire(&self, target: &Target) -> Result<Session, AuthError> {
        let now = self.clock.now();

        if let Some(session) = self.cache.read().get(&target.key) {
            if !session.is_expired(now) {
                return Ok(session.clone());
            }
        }

        if let Some(session) = self.load_persisted(target) {
            log::debug!("[SESSION] Restored persisted session for {}", target.key);
            self.cache.write().insert(target.key.clone(), session.clone());
            return Ok(session);
        }

        let env_rejected = self.rejected_env.read().contains(&target.key);
        if !env_rejected {
            if let Some(cookie) = self.env_value(target.cookie_env.as_deref()) {
                validate_cookie(target, &cookie)?;
                log::debug!("[SESSION] Using environment cookie for {}", target.key);
                let session = Session::new(&target.key, cookie, now, SessionSource::Environment);
                self.cache.write().insert(target.key.clone(), session.clone());
                return Ok(session);
            }
        }

        let Some(password) = self.env_value(target.password_env.as_deref()) else {
            return Err(if env_rejected {
                AuthError::Rejected {
                    target: target.key.clone(),
                    reason: "session cookie was rejected and no password is configured".to_string(),
                }
            } else {
                AuthError::MissingCredentials(target.key.clone())
            });
        };

        if target.username.trim().is_empty() {
            return Err(AuthError::Malformed {
                target: target.key.clone(),
                reason: "password login needs a username".to_string(),
            });
        }

        let site = self
            .sites
            .get(&target.site)
            .ok_or_else(|| AuthError::UnknownSite(target.site.clone()))?;

        log::info!("[SESSION] Logging in {} on {}", target.username, target.site);
        let fresh = site.login(target, &password).await?;

        let obtained_at = self.clock.now();
        let mut session = Session::new(&target.key, fresh.cookie, obtained_at, SessionSource::Login);
        if let Ok(ttl) = ChronoDuration::from_std(self.session_ttl) {
            session = session.with_expiry(obtained_at + ttl);
        }

        if let Some(db) = &self.db {
            if let Err(e) = db.save_session(&session) {
                log::warn!("[SESSION] Failed to persist session for {}: {}", target.key, e);
            }
        }
        self.cache.write().insert(target.key.clone(), session.clone());
        Ok(session)
    }

    /// Drop the session so the next acquire authenticates again
    pub fn invalidate(&self, target: &Target) {
        let removed = self.cache.write().remove(&target.key);

        if matches!(removed.as_ref().map(|s| s.source), Some(SessionSource::Environment)) {
            log::warn!("[SESSION] Environment cookie for {} was rejected", target.key);
            self.rejected_env.write().insert(target.key.clone());
        }

        if let Some(db) = &self.db {
            if let Err(e) = db.delete_session(&target.key) {
                log::warn!("[SESSION] Failed to delete persisted session for {}: {}", target.key, e);
            }
        }

        log::info!("[SESSION] Invalidated session for {}", target.key);
    }

    fn load_persisted(&self, target: &Target) -> Option<Session> {
        let db = self.db.as_ref()?;
        match db.load_session(&target.key) {
            Ok(Some(session)) if !session.is_expired(self.clock.now()) => Some(session),
            Ok(Some(_)) => {
                log::debug!("[SESSION] Persisted session for {} expired", target.key);
                if let Err(e) = db.delete_session(&target.key) {
                    log::warn!("[SESSION] Failed to delete expired session for {}: {}", target.key, e);
                }
                None
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("[SESSION] Ignoring unreadable persisted session for {}: {}", target.key, e);
                None
            }
        }
    }

    fn env_value(&self, name: Option<&str>) -> Option<String> {
        self.credentials
            .lookup(name?)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

/// A cookie header is `name=value` pairs without control characters
fn validate_cookie(target: &Target, cookie: &str) -> Result<(), AuthError> {
    let malformed = |reason: &str| AuthError::Malformed {
        target: target.key.clone(),
        reason: reason.to_string(),
    };

    if cookie.chars().any(|c| c.is_control()) {
        return Err(malformed("cookie contains control characters"));
    }
    if !cookie.split(';').map(str::trim).filter(|p| !p.is_empty()).all(|pair| pair.contains('=')) {
        return Err(malformed("cookie must be a list of name=value pairs"));
    }
    Ok(())
}
