//! Cycle runner: feeds enabled targets to the engine and reports the result

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::engine::{CheckinEngine, CheckinOutcome};
use crate::models::Target;

/// Outcomes of one pass over the targets, in target order
#[derive(Debug)]
pub struct CycleReport {
    pub cycle_id: String,
    pub outcomes: Vec<(String, CheckinOutcome)>,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// 0 when nothing failed, 1 otherwise
    pub fn exit_code(&self) -> u8 {
        if self.failed() == 0 { 0 } else { 1 }
    }

    pub fn log_summary(&self) {
        for (key, outcome) in &self.outcomes {
            match outcome {
                CheckinOutcome::Succeeded { attempts } => {
                    log::info!("[RUNNER] {}: succeeded after {} attempt(s)", key, attempts)
                }
                CheckinOutcome::AlreadyDone => log::info!("[RUNNER] {}: {}", key, outcome.label()),
                CheckinOutcome::NotDue { hour } => log::info!("[RUNNER] {}: not due until {:02}:00", key, hour),
                CheckinOutcome::SlotTaken { hour, slot } => {
                    log::info!("[RUNNER] {}: slot {} of {:02}:00 used recently, waiting", key, slot, hour)
                }
                CheckinOutcome::ExhaustedRetries { attempts, reason } => {
                    log::error!("[RUNNER] {}: gave up after {} attempts: {}", key, attempts, reason)
                }
                CheckinOutcome::Fatal { reason } => log::error!("[RUNNER] {}: fatal: {}", key, reason),
                CheckinOutcome::Auth(e) => log::error!("[RUNNER] {}: {}", key, e),
                CheckinOutcome::Storage(e) => log::error!("[RUNNER] {}: storage: {}", key, e),
                CheckinOutcome::Cancelled => log::warn!("[RUNNER] {}: cancelled", key),
            }
        }

        log::info!(
            "[RUNNER] Cycle {} finished: {} ok, {} failed",
            self.cycle_id,
            self.succeeded(),
            self.failed()
        );
    }
}

pub struct Runner {
    engine: Arc<CheckinEngine>,
    targets: Vec<Target>,
    max_concurrency: usize,
}

impl Runner {
    pub fn new(engine: Arc<CheckinEngine>, targets: Vec<Target>, max_concurrency: usize) -> Self {
        Self {
            engine,
            targets,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// One pass over every enabled target
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let cycle_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let enabled: Vec<(usize, &Target)> = self.targets.iter().filter(|t| t.enabled).enumerate().collect();
        log::info!("[RUNNER] Cycle {} starting with {} target(s)", cycle_id, enabled.len());

        let engine = &self.engine;
        let mut results: Vec<(usize, String, CheckinOutcome)> = stream::iter(enabled)
            .map(|(index, target)| async move {
                let outcome = engine.run_target(target, cancel).await;
                (index, target.key.clone(), outcome)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;
        results.sort_by_key(|(index, _, _)| *index);

        let report = CycleReport {
            cycle_id,
            outcomes: results.into_iter().map(|(_, key, outcome)| (key, outcome)).collect(),
        };
        report.log_summary();
        self.log_period_summary();
        report
    }

    /// Tally of the stored records for the current period
    fn log_period_summary(&self) {
        match self.engine.period_records() {
            Ok((period, records)) => {
                let done = records.iter().filter(|r| r.status.is_done()).count();
                log::info!(
                    "[RUNNER] Period {}: {} of {} target(s) done",
                    period,
                    done,
                    self.targets.iter().filter(|t| t.enabled).count()
                );
                for record in records.iter().filter(|r| !r.status.is_done()) {
                    log::debug!(
                        "[RUNNER] {} pending after {} attempt(s): {}",
                        record.target_key,
                        record.attempt_count,
                        record.message.as_deref().unwrap_or("-")
                    );
                }
            }
            Err(e) => log::warn!("[RUNNER] Cannot read period records: {}", e),
        }
    }

    /// Run now, then on every schedule tick until cancelled; returns the last report
    pub async fn run_loop(&self, schedule: &cron::Schedule, cancel: &CancellationToken) -> CycleReport {
        let mut last = self.run_cycle(cancel).await;

        while !cancel.is_cancelled() {
            let Some(next) = schedule.upcoming(Utc).next() else {
                log::warn!("[RUNNER] Schedule has no upcoming runs, stopping");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            log::info!("[RUNNER] Next cycle at {}", next);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            last = self.run_cycle(cancel).await;
        }

        log::info!("[RUNNER] Loop stopped");
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::PeriodCalendar;
    use crate::db::Database;
    use crate::engine::EngineSettings;
    use crate::models::AttemptOutcome;
    use crate::retry::BackoffPolicy;
    use crate::session_manager::{CredentialSource, SessionManager};
    use crate::sites::SiteRegistry;
    use crate::test_support::{ManualClock, MockSite, RecordingDelay};
    use chrono::FixedOffset;
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::time::Duration;

    fn runner(sites: Vec<(&str, Arc<MockSite>)>, targets: Vec<Target>, max_concurrency: usize) -> Runner {
        let mut registry = SiteRegistry::new();
        for (id, site) in sites {
            registry.register(id, site);
        }
        let sites = Arc::new(registry);
        let clock = Arc::new(ManualClock::at(2024, 6, 1, 2));
        let creds: HashMap<String, String> = HashMap::from([("COOKIE".to_string(), "session=env".to_string())]);
        let creds: Arc<dyn CredentialSource> = Arc::new(creds);

        let sessions = Arc::new(SessionManager::new(sites.clone(), creds, None, clock.clone(), Duration::from_secs(3600)));
        let engine = CheckinEngine::new(
            Arc::new(Database::in_memory().unwrap()),
            sessions,
            sites,
            clock,
            Arc::new(RecordingDelay::default()),
            PeriodCalendar::new(FixedOffset::east_opt(8 * 3600).unwrap()),
            EngineSettings {
                retry_limit: 2,
                backoff: BackoffPolicy::default().without_jitter(),
                request_timeout: Duration::from_secs(1),
                session_timeout: Duration::from_secs(1),
            },
        );
        Runner::new(Arc::new(engine), targets, max_concurrency)
    }

    fn target(key: &str, site: &str) -> Target {
        let mut target = Target::new(key, site, "user");
        target.cookie_env = Some("COOKIE".to_string());
        target
    }

    #[tokio::test]
    async fn test_cycle_reports_in_target_order() {
        let good = Arc::new(MockSite::new(vec![]));
        let bad = Arc::new(MockSite::always(AttemptOutcome::fatal("HTTP 410")));
        let mut disabled = target("c", "good");
        disabled.enabled = false;

        let runner = runner(
            vec![("good", good.clone()), ("bad", bad.clone())],
            vec![target("a", "good"), target("b", "bad"), disabled, target("d", "good")],
            3,
        );
        let report = runner.run_cycle(&CancellationToken::new()).await;

        let keys: Vec<&str> = report.outcomes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "d"]);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(good.checkin_calls(), 2);
    }

    #[tokio::test]
    async fn test_repeat_cycle_is_idempotent_and_clean() {
        let site = Arc::new(MockSite::new(vec![]));
        let runner = runner(vec![("good", site.clone())], vec![target("a", "good"), target("b", "good")], 1);
        let cancel = CancellationToken::new();

        assert_eq!(runner.run_cycle(&cancel).await.exit_code(), 0);
        let second = runner.run_cycle(&cancel).await;

        assert_eq!(second.exit_code(), 0);
        assert!(second.outcomes.iter().all(|(_, o)| matches!(o, CheckinOutcome::AlreadyDone)));
        assert_eq!(site.checkin_calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_cycle_exits_zero() {
        let runner = runner(vec![], vec![], 1);
        let report = runner.run_cycle(&CancellationToken::new()).await;
        assert!(report.outcomes.is_empty());
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let site = Arc::new(MockSite::new(vec![]));
        let runner = runner(vec![("good", site.clone())], vec![target("a", "good")], 1);
        // Once a year
        let schedule = cron::Schedule::from_str("0 0 0 1 1 *").unwrap();
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), runner.run_loop(&schedule, &cancel))
            .await
            .unwrap();

        assert_eq!(report.exit_code(), 0);
        assert_eq!(site.checkin_calls(), 1);
    }
}
