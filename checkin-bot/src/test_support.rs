//! Shared fakes for unit tests

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::clock::{Clock, Delay};
use crate::error::AuthError;
use crate::models::{AttemptOutcome, Session, SessionSource, Target};
use crate::sites::CheckinSite;

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Clock at a UTC wall time
    pub fn at(year: i32, month: u32, day: u32, hour: u32) -> Self {
        Self::new(Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Delay that returns at once and remembers what it was asked to wait
#[derive(Default)]
pub struct RecordingDelay {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingDelay {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().clone()
    }
}

#[async_trait]
impl Delay for RecordingDelay {
    async fn sleep(&self, duration: Duration) {
        self.waits.lock().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Site fake replaying scripted outcomes, then a fallback
pub struct MockSite {
    script: Mutex<VecDeque<AttemptOutcome>>,
    fallback: AttemptOutcome,
    login_error: Option<AuthError>,
    call_delay: Option<Duration>,
    checkin_calls: AtomicUsize,
    login_calls: AtomicUsize,
    cookies_seen: Mutex<Vec<String>>,
}

impl MockSite {
    pub fn new(script: Vec<AttemptOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: AttemptOutcome::success(Some("获得5个鸡腿".to_string())),
            login_error: None,
            call_delay: None,
            checkin_calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            cookies_seen: Mutex::new(Vec::new()),
        }
    }

    /// Always answers `outcome`
    pub fn always(outcome: AttemptOutcome) -> Self {
        Self::new(Vec::new()).with_fallback(outcome)
    }

    pub fn with_fallback(mut self, outcome: AttemptOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    pub fn with_login_error(mut self, err: AuthError) -> Self {
        self.login_error = Some(err);
        self
    }

    /// Each check-in takes this long (real time)
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    pub fn checkin_calls(&self) -> usize {
        self.checkin_calls.load(Ordering::SeqCst)
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn cookies_seen(&self) -> Vec<String> {
        self.cookies_seen.lock().clone()
    }
}

#[async_trait]
impl CheckinSite for MockSite {
    async fn checkin(&self, _target: &Target, session: &Session) -> AttemptOutcome {
        self.checkin_calls.fetch_add(1, Ordering::SeqCst);
        self.cookies_seen.lock().push(session.cookie.clone());
        if let Some(delay) = self.call_delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    async fn login(&self, target: &Target, _password: &str) -> Result<Session, AuthError> {
        let n = self.login_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(err) = &self.login_error {
            return Err(err.clone());
        }
        Ok(Session::new(&target.key, format!("session=login-{}", n), Utc::now(), SessionSource::Login))
    }
}
