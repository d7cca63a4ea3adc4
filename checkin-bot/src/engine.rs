//! Check-in engine
//!
//! Per (target, period) the engine moves a record through
//! Pending -> Attempting -> Succeeded | ExhaustedRetries, with Fatal as a
//! second terminal state and Auth as a non-terminal stop. A record that is
//! already `success` or `skipped` for the period short-circuits the whole
//! run, which is what keeps repeated invocations from re-submitting.
//!
//! Every attempt is committed before the next one starts, so the attempt
//! count carries across invocations within one period and a crash never
//! grants extra attempts.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, Delay, PeriodCalendar};
use crate::config::Config;
use crate::db::Database;
use crate::error::{AuthError, StorageError};
use crate::models::{AttemptOutcome, CheckInRecord, CheckinStatus, FailureKind, Target};
use crate::retry::BackoffPolicy;
use crate::session_manager::SessionManager;
use crate::sites::{CheckinSite, SiteRegistry};

/// Days of history a check-in slot stays used
const SLOT_LOOKBACK_DAYS: i64 = 4;

/// Retry and timeout settings of the engine
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub retry_limit: u32,
    pub backoff: BackoffPolicy,
    pub request_timeout: Duration,
    /// Bound on session acquisition, which may include a captcha solve
    pub session_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let captcha_budget = config
            .captcha
            .as_ref()
            .map(|c| c.poll_interval * c.max_polls)
            .unwrap_or_default();

        Self {
            retry_limit: config.retry_limit,
            backoff: config.backoff(),
            request_timeout: config.request_timeout,
            session_timeout: config.request_timeout * 3 + captcha_budget,
        }
    }
}

/// Final result of one `run_target` call
#[derive(Debug)]
pub enum CheckinOutcome {
    /// Already succeeded (or reported done by the site) in this period
    AlreadyDone,
    Succeeded { attempts: u32 },
    ExhaustedRetries { attempts: u32, reason: String },
    Fatal { reason: String },
    Auth(AuthError),
    Storage(StorageError),
    /// Before the target's check-in hour
    NotDue { hour: u8 },
    /// The current slot was used for a check-in in the last few days
    SlotTaken { hour: u32, slot: u32 },
    Cancelled,
}

impl CheckinOutcome {
    /// Outcomes that leave the process exit status at zero
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            CheckinOutcome::AlreadyDone
                | CheckinOutcome::Succeeded { .. }
                | CheckinOutcome::NotDue { .. }
                | CheckinOutcome::SlotTaken { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            CheckinOutcome::AlreadyDone => "already_done",
            CheckinOutcome::Succeeded { .. } => "succeeded",
            CheckinOutcome::ExhaustedRetries { .. } => "exhausted_retries",
            CheckinOutcome::Fatal { .. } => "fatal",
            CheckinOutcome::Auth(_) => "auth",
            CheckinOutcome::Storage(_) => "storage",
            CheckinOutcome::NotDue { .. } => "not_due",
            CheckinOutcome::SlotTaken { .. } => "slot_taken",
            CheckinOutcome::Cancelled => "cancelled",
        }
    }
}

/// Why an attempt ended without an outcome from the site
enum Interrupt {
    Cancelled,
    Auth(AuthError),
}

pub struct CheckinEngine {
    db: Arc<Database>,
    sessions: Arc<SessionManager>,
    sites: Arc<SiteRegistry>,
    clock: Arc<dyn Clock>,
    delay: Arc<dyn Delay>,
    calendar: PeriodCalendar,
    settings: EngineSettings,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CheckinEngine {
    pub fn new(
        db: Arc<Database>,
        sessions: Arc<SessionManager>,
        sites: Arc<SiteRegistry>,
        clock: Arc<dyn Clock>,
        delay: Arc<dyn Delay>,
        calendar: PeriodCalendar,
        settings: EngineSettings,
    ) -> Self {
        Self {
            db,
            sessions,
            sites,
            clock,
            delay,
            calendar,
            settings,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, target_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(target_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn persist(&self, record: &CheckInRecord) -> Result<(), StorageError> {
        if !self.db.save_record(record)? {
            log::warn!(
                "[ENGINE] {} already completed for {}, kept the stored record",
                record.target_key,
                record.period
            );
        }
        Ok(())
    }

    /// Records of the current period, for the cycle summary
    pub fn period_records(&self) -> Result<(String, Vec<CheckInRecord>), StorageError> {
        let period = self.calendar.period_of(self.clock.now());
        let records = self.db.list_records_for_period(&period)?;
        Ok((period, records))
    }

    /// Whether a recent successful check-in fell into the same local slot as `now`
    fn slot_used_recently(&self, target_key: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let cutoff = now - chrono::Duration::days(SLOT_LOOKBACK_DAYS);
        let current = self.calendar.slot_of(now);

        let recent = self.db.recent_records(target_key, SLOT_LOOKBACK_DAYS as usize + 1)?;
        Ok(recent.iter().any(|record| {
            record.status == CheckinStatus::Success
                && record.updated_at > cutoff
                && self.calendar.slot_of(record.updated_at) == current
        }))
    }

    /// Persist `record`, then report `outcome` (or the storage failure)
    fn finish(&self, record: &CheckInRecord, outcome: CheckinOutcome) -> CheckinOutcome {
        match self.persist(record) {
            Ok(()) => outcome,
            Err(e) => {
                log::error!("[ENGINE] Failed to save record for {}: {}", record.target_key, e);
                CheckinOutcome::Storage(e)
            }
        }
    }

    /// Run the check-in for one target in the current period
    pub async fn run_target(&self, target: &Target, cancel: &CancellationToken) -> CheckinOutcome {
        let Some(site) = self.sites.get(&target.site) else {
            log::error!("[ENGINE] {}: no adapter for site '{}'", target.key, target.site);
            return CheckinOutcome::Auth(AuthError::UnknownSite(target.site.clone()));
        };

        let lock = self.lock_for(&target.key);
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return CheckinOutcome::Cancelled,
            guard = lock.lock_owned() => guard,
        };

        let now = self.clock.now();
        let period = self.calendar.period_of(now);

        let existing = match self.db.load_record(&target.key, &period) {
            Ok(existing) => existing,
            Err(e) => {
                log::error!("[ENGINE] {}: cannot read record for {}: {}", target.key, period, e);
                return CheckinOutcome::Storage(e);
            }
        };

        let mut record = match existing {
            Some(record) if record.status.is_done() => {
                log::debug!("[ENGINE] {} already {} for {}", target.key, record.status, period);
                return CheckinOutcome::AlreadyDone;
            }
            Some(record) if record.failure.is_some_and(FailureKind::is_terminal) => {
                let reason = record.message.unwrap_or_default();
                return match record.failure {
                    Some(FailureKind::Fatal) => CheckinOutcome::Fatal { reason },
                    _ => CheckinOutcome::ExhaustedRetries {
                        attempts: record.attempt_count,
                        reason,
                    },
                };
            }
            Some(record) => record,
            None => CheckInRecord::new(&target.key, &period, now),
        };

        if let Some(hour) = target.checkin_hour {
            if self.calendar.local_hour(now) < u32::from(hour) {
                log::debug!("[ENGINE] {} not due until {:02}:00", target.key, hour);
                return CheckinOutcome::NotDue { hour };
            }

            // Scheduled targets never reuse a slot from the last few days
            match self.slot_used_recently(&target.key, now) {
                Ok(false) => {}
                Ok(true) => {
                    let (hour, slot) = self.calendar.slot_of(now);
                    log::debug!("[ENGINE] {} used slot {} of {:02}:00 recently, waiting", target.key, slot, hour);
                    return CheckinOutcome::SlotTaken { hour, slot };
                }
                Err(e) => {
                    log::error!("[ENGINE] {}: cannot read recent records: {}", target.key, e);
                    return CheckinOutcome::Storage(e);
                }
            }
        }

        let retry_limit = self.settings.retry_limit;
        if record.attempt_count >= retry_limit {
            let reason = record.message.clone().unwrap_or_else(|| "retry limit reached".to_string());
            record.mark_failed(FailureKind::ExhaustedRetries, reason.clone(), now);
            return self.finish(
                &record,
                CheckinOutcome::ExhaustedRetries {
                    attempts: record.attempt_count,
                    reason,
                },
            );
        }

        log::info!(
            "[ENGINE] Checking in {} for {} (attempt {}/{})",
            target.key,
            period,
            record.attempt_count + 1,
            retry_limit
        );

        let mut refreshed = false;
        loop {
            let outcome = match self.attempt(site.as_ref(), target, cancel).await {
                Ok(outcome) => outcome,
                Err(Interrupt::Cancelled) => {
                    log::warn!("[ENGINE] {}: cancelled, record left at last commit", target.key);
                    return CheckinOutcome::Cancelled;
                }
                Err(Interrupt::Auth(e)) => {
                    log::error!("[ENGINE] {}: {}", target.key, e);
                    // Auth failures use up attempts too
                    record.attempt_count += 1;
                    record.mark_failed(FailureKind::Auth, e.to_string(), self.clock.now());
                    return self.finish(&record, CheckinOutcome::Auth(e));
                }
            };

            record.attempt_count += 1;
            let attempts = record.attempt_count;
            let now = self.clock.now();

            match outcome {
                AttemptOutcome::Success {
                    message,
                    credits_delta,
                    credits_after,
                } => {
                    log::info!(
                        "[ENGINE] {} checked in for {} after {} attempt(s) (credits {:?} -> {:?})",
                        target.key,
                        period,
                        attempts,
                        credits_delta,
                        credits_after
                    );
                    record.mark_success(message, credits_delta, credits_after, now);
                    return self.finish(&record, CheckinOutcome::Succeeded { attempts });
                }
                AttemptOutcome::AlreadyDone { message } => {
                    log::info!("[ENGINE] {} was already checked in for {}", target.key, period);
                    record.mark_skipped(message, now);
                    return self.finish(&record, CheckinOutcome::AlreadyDone);
                }
                AttemptOutcome::FatalFailure { reason } => {
                    log::error!("[ENGINE] {} failed permanently: {}", target.key, reason);
                    record.mark_failed(FailureKind::Fatal, reason.clone(), now);
                    return self.finish(&record, CheckinOutcome::Fatal { reason });
                }
                AttemptOutcome::RetryableFailure {
                    reason,
                    session_expired,
                } => {
                    log::warn!("[ENGINE] {} attempt {}/{} failed: {}", target.key, attempts, retry_limit, reason);

                    if session_expired {
                        self.sessions.invalidate(target);
                        if refreshed {
                            let err = AuthError::Rejected {
                                target: target.key.clone(),
                                reason: format!("session rejected again after refresh: {}", reason),
                            };
                            record.mark_failed(FailureKind::Auth, err.to_string(), now);
                            return self.finish(&record, CheckinOutcome::Auth(err));
                        }
                        refreshed = true;
                    }

                    if attempts >= retry_limit {
                        record.mark_failed(FailureKind::ExhaustedRetries, reason.clone(), now);
                        return self.finish(&record, CheckinOutcome::ExhaustedRetries { attempts, reason });
                    }

                    record.mark_failed(FailureKind::Retryable, reason, now);
                    if let Err(e) = self.persist(&record) {
                        log::error!("[ENGINE] Failed to save record for {}: {}", target.key, e);
                        return CheckinOutcome::Storage(e);
                    }

                    // A refreshed session is tried at once
                    if !session_expired {
                        let wait = self.settings.backoff.delay_for(attempts);
                        log::debug!("[ENGINE] {} retrying in {:?}", target.key, wait);
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return CheckinOutcome::Cancelled,
                            _ = self.delay.sleep(wait) => {}
                        }
                    }
                }
            }
        }
    }

    /// One session acquisition plus one site call, both time-bounded
    async fn attempt(
        &self,
        site: &dyn CheckinSite,
        target: &Target,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome, Interrupt> {
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
            result = tokio::time::timeout(self.settings.session_timeout, self.sessions.acquire(target)) => result,
        };

        let session = match acquired {
            Ok(Ok(session)) => session,
            Ok(Err(e)) if e.is_transient() => return Ok(AttemptOutcome::retryable(e.to_string())),
            Ok(Err(e)) => return Err(Interrupt::Auth(e)),
            Err(_) => {
                return Ok(AttemptOutcome::retryable(format!(
                    "session acquisition timed out after {:?}",
                    self.settings.session_timeout
                )));
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
            result = tokio::time::timeout(self.settings.request_timeout, site.checkin(target, &session)) => result,
        };

        Ok(result.unwrap_or_else(|_| {
            AttemptOutcome::retryable(format!("check-in timed out after {:?}", self.settings.request_timeout))
        }))
    }
}
