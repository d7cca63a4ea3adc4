use chrono::FixedOffset;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::Target;
use crate::retry::{BackoffPolicy, DEFAULT_BACKOFF_BASE_SECS, DEFAULT_BACKOFF_MAX_SECS};

pub const DEFAULT_DATA_DIR: &str = "/app/data";
pub const DEFAULT_SCHEDULE: &str = "0 */10 * * * *";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36 Edg/125.0.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One pass over all targets, then exit
    Once,
    /// Repeat on the cron schedule until stopped
    Loop,
}

#[derive(Debug, Clone)]
pub struct CaptchaConfig {
    pub api_url: String,
    pub api_key: String,
    pub max_polls: u32,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub database_url: String,
    pub targets_file: PathBuf,
    pub sites_file: PathBuf,
    pub retry_limit: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub request_timeout: Duration,
    pub run_mode: RunMode,
    pub schedule: String,
    pub run_deadline: Option<Duration>,
    pub max_concurrency: usize,
    pub timezone_offset: FixedOffset,
    pub persist_sessions: bool,
    pub session_ttl: Duration,
    pub socks5_proxy: Option<String>,
    pub user_agent: String,
    pub captcha: Option<CaptchaConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build from any variable lookup; empty values count as unset
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let data_dir = PathBuf::from(var("DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()));
        let database_url = var("DATABASE_URL")
            .unwrap_or_else(|| data_dir.join("checkin.db").to_string_lossy().into_owned());
        let targets_file = var("TARGETS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("targets.ron"));
        let sites_file = var("SITES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("sites.ron"));

        let retry_limit: u32 = parse_or("RETRY_LIMIT", var("RETRY_LIMIT"), 3)?;
        if retry_limit == 0 {
            return Err(ConfigError::invalid("RETRY_LIMIT", "must be at least 1"));
        }

        let backoff_base = Duration::from_secs(parse_or("BACKOFF_BASE_SECS", var("BACKOFF_BASE_SECS"), DEFAULT_BACKOFF_BASE_SECS)?);
        let backoff_max = Duration::from_secs(parse_or("BACKOFF_MAX_SECS", var("BACKOFF_MAX_SECS"), DEFAULT_BACKOFF_MAX_SECS)?);
        if backoff_base > backoff_max {
            return Err(ConfigError::invalid("BACKOFF_BASE_SECS", "must not exceed BACKOFF_MAX_SECS"));
        }

        let request_timeout_secs: u64 = parse_or("REQUEST_TIMEOUT_SECS", var("REQUEST_TIMEOUT_SECS"), 15)?;
        if request_timeout_secs == 0 {
            return Err(ConfigError::invalid("REQUEST_TIMEOUT_SECS", "must be at least 1"));
        }

        let run_mode = match var("RUN_MODE").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("once") => RunMode::Once,
            Some("loop") => RunMode::Loop,
            Some(other) => {
                return Err(ConfigError::invalid("RUN_MODE", format!("expected 'once' or 'loop', got '{}'", other)));
            }
        };

        let schedule = var("CHECKIN_SCHEDULE").unwrap_or_else(|| DEFAULT_SCHEDULE.to_string());
        if let Err(e) = cron::Schedule::from_str(&schedule) {
            return Err(ConfigError::invalid("CHECKIN_SCHEDULE", e.to_string()));
        }

        let run_deadline = match var("RUN_DEADLINE_SECS") {
            Some(raw) => Some(Duration::from_secs(parse_value("RUN_DEADLINE_SECS", &raw)?)),
            None => None,
        };

        let max_concurrency: usize = parse_or("MAX_CONCURRENCY", var("MAX_CONCURRENCY"), 1)?;
        if max_concurrency == 0 {
            return Err(ConfigError::invalid("MAX_CONCURRENCY", "must be at least 1"));
        }

        let timezone_offset = parse_utc_offset(&var("TIMEZONE_OFFSET").unwrap_or_else(|| "+08:00".to_string()))?;

        let persist_sessions = match var("PERSIST_SESSIONS") {
            Some(raw) => parse_bool("PERSIST_SESSIONS", &raw)?,
            None => false,
        };
        let session_ttl = Duration::from_secs(3600 * parse_or::<u64>("SESSION_TTL_HOURS", var("SESSION_TTL_HOURS"), 24 * 7)?);

        let socks5_proxy = var("SOCKS5_PROXY").map(|raw| normalize_proxy_url(&raw));
        if let Some(proxy) = &socks5_proxy {
            url::Url::parse(proxy).map_err(|e| ConfigError::invalid("SOCKS5_PROXY", e.to_string()))?;
        }

        let captcha = match (var("CAPTCHA_API_URL"), var("CAPTCHA_API_KEY")) {
            (Some(api_url), Some(api_key)) => {
                url::Url::parse(&api_url).map_err(|e| ConfigError::invalid("CAPTCHA_API_URL", e.to_string()))?;
                Some(CaptchaConfig {
                    api_url: api_url.trim_end_matches('/').to_string(),
                    api_key,
                    max_polls: parse_or("CAPTCHA_MAX_POLLS", var("CAPTCHA_MAX_POLLS"), 20)?,
                    poll_interval: Duration::from_secs(parse_or("CAPTCHA_POLL_INTERVAL_SECS", var("CAPTCHA_POLL_INTERVAL_SECS"), 3)?),
                })
            }
            (None, None) => None,
            _ => {
                return Err(ConfigError::invalid(
                    "CAPTCHA_API_URL",
                    "CAPTCHA_API_URL and CAPTCHA_API_KEY must be set together",
                ));
            }
        };

        Ok(Self {
            data_dir,
            database_url,
            targets_file,
            sites_file,
            retry_limit,
            backoff_base,
            backoff_max,
            request_timeout: Duration::from_secs(request_timeout_secs),
            run_mode,
            schedule,
            run_deadline,
            max_concurrency,
            timezone_offset,
            persist_sessions,
            session_ttl,
            socks5_proxy,
            user_agent: var("USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            captcha,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_max)
    }

    pub fn cron_schedule(&self) -> Result<cron::Schedule, ConfigError> {
        cron::Schedule::from_str(&self.schedule).map_err(|e| ConfigError::invalid("CHECKIN_SCHEDULE", e.to_string()))
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| ConfigError::invalid(key, format!("'{}': {}", raw, e)))
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, format!("'{}' is not a boolean", raw))),
    }
}

/// Parse `+08:00`, `-0530`, `+8` or `Z` into a fixed offset
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset, ConfigError> {
    let invalid = || ConfigError::invalid("TIMEZONE_OFFSET", format!("'{}' is not a UTC offset like +08:00", raw));
    let raw = raw.trim();

    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = match raw.chars().next() {
        Some('+') => (1, &raw[1..]),
        Some('-') => (-1, &raw[1..]),
        _ => return Err(invalid()),
    };

    if !rest.chars().all(|c| c.is_ascii_digit() || c == ':') {
        return Err(invalid());
    }

    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };

    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// `socks5://` resolves DNS locally; switch to `socks5h://` so the proxy resolves
pub fn normalize_proxy_url(raw: &str) -> String {
    match raw.strip_prefix("socks5://") {
        Some(rest) => format!("socks5h://{}", rest),
        None => raw.to_string(),
    }
}

/// Load and validate the RON target list
pub fn load_targets(path: &Path) -> Result<Vec<Target>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let targets = parse_targets(&content).map_err(|e| match e {
        ConfigError::Parse { reason, .. } => ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        },
        other => other,
    })?;

    log::info!("[CONFIG] Loaded {} targets from {:?}", targets.len(), path);
    Ok(targets)
}

pub fn parse_targets(content: &str) -> Result<Vec<Target>, ConfigError> {
    let targets: Vec<Target> = ron::from_str(content).map_err(|e| ConfigError::Parse {
        path: PathBuf::new(),
        reason: e.to_string(),
    })?;

    let mut seen = HashSet::new();
    for target in &targets {
        if target.key.trim().is_empty() {
            return Err(ConfigError::Targets("target key must not be empty".to_string()));
        }
        if !seen.insert(target.key.as_str()) {
            return Err(ConfigError::Targets(format!("duplicate target key '{}'", target.key)));
        }
        if let Some(hour) = target.checkin_hour {
            if hour > 23 {
                return Err(ConfigError::Targets(format!(
                    "target '{}' has checkin_hour {} (expected 0-23)",
                    target.key, hour
                )));
            }
        }
    }

    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CheckinMode;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/app/data"));
        assert_eq!(config.database_url, "/app/data/checkin.db");
        assert_eq!(config.targets_file, PathBuf::from("/app/data/targets.ron"));
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.backoff_base, Duration::from_secs(5));
        assert_eq!(config.backoff_max, Duration::from_secs(60));
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.run_mode, RunMode::Once);
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.timezone_offset.local_minus_utc(), 8 * 3600);
        assert!(!config.persist_sessions);
        assert!(config.captcha.is_none());
        assert!(config.cron_schedule().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("DATA_DIR", "/tmp/bot"),
            ("RETRY_LIMIT", "5"),
            ("RUN_MODE", "LOOP"),
            ("RUN_DEADLINE_SECS", "300"),
            ("PERSIST_SESSIONS", "yes"),
            ("SOCKS5_PROXY", "socks5://127.0.0.1:1080"),
            ("CAPTCHA_API_URL", "https://solver.example/"),
            ("CAPTCHA_API_KEY", "k"),
        ])
        .unwrap();

        assert_eq!(config.database_url, "/tmp/bot/checkin.db");
        assert_eq!(config.retry_limit, 5);
        assert_eq!(config.run_mode, RunMode::Loop);
        assert_eq!(config.run_deadline, Some(Duration::from_secs(300)));
        assert!(config.persist_sessions);
        assert_eq!(config.socks5_proxy.as_deref(), Some("socks5h://127.0.0.1:1080"));
        let captcha = config.captcha.unwrap();
        assert_eq!(captcha.api_url, "https://solver.example");
        assert_eq!(captcha.max_polls, 20);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(config_from(&[("RETRY_LIMIT", "0")]).is_err());
        assert!(config_from(&[("RETRY_LIMIT", "three")]).is_err());
        assert!(config_from(&[("BACKOFF_BASE_SECS", "90")]).is_err());
        assert!(config_from(&[("RUN_MODE", "daemon")]).is_err());
        assert!(config_from(&[("CHECKIN_SCHEDULE", "every day")]).is_err());
        assert!(config_from(&[("CAPTCHA_API_KEY", "only-key")]).is_err());
        assert!(config_from(&[("PERSIST_SESSIONS", "maybe")]).is_err());
    }

    #[test]
    fn test_parse_utc_offset() {
        assert_eq!(parse_utc_offset("+08:00").unwrap().local_minus_utc(), 8 * 3600);
        assert_eq!(parse_utc_offset("-0530").unwrap().local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(parse_utc_offset("+9").unwrap().local_minus_utc(), 9 * 3600);
        assert_eq!(parse_utc_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_utc_offset("08:00").is_err());
        assert!(parse_utc_offset("+25:00").is_err());
        assert!(parse_utc_offset("Asia/Shanghai").is_err());
    }

    #[test]
    fn test_non_ascii_offset_is_rejected() {
        assert!(parse_utc_offset("+1é2").is_err());
        assert!(parse_utc_offset("+０８００").is_err());
        assert!(config_from(&[("TIMEZONE_OFFSET", "+1é2")]).is_err());
    }

    #[test]
    fn test_parse_targets() {
        let content = r#"[
            (key: "nodeseek-alice", site: "nodeseek", username: "alice",
             checkin_mode: Random, checkin_hour: Some(4), cookie_env: Some("ALICE_COOKIE")),
            (key: "deepflood-bob", site: "deepflood", username: "bob",
             enabled: false, password_env: Some("BOB_PASSWORD")),
        ]"#;

        let targets = parse_targets(content).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].checkin_mode, CheckinMode::Random);
        assert_eq!(targets[0].checkin_hour, Some(4));
        assert!(targets[0].enabled);
        assert_eq!(targets[1].checkin_mode, CheckinMode::Fixed);
        assert!(!targets[1].enabled);
        assert_eq!(targets[1].password_env.as_deref(), Some("BOB_PASSWORD"));
    }

    #[test]
    fn test_demo_targets_file_parses() {
        let targets = parse_targets(include_str!("../../demos/targets.ron")).unwrap();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets.iter().filter(|t| t.enabled).count(), 2);
    }

    #[test]
    fn test_parse_targets_rejects_duplicates_and_bad_hours() {
        let duplicate = r#"[
            (key: "a", site: "nodeseek", username: "x"),
            (key: "a", site: "deepflood", username: "y"),
        ]"#;
        assert!(matches!(parse_targets(duplicate), Err(ConfigError::Targets(_))));

        let bad_hour = r#"[(key: "a", site: "nodeseek", username: "x", checkin_hour: Some(24))]"#;
        assert!(matches!(parse_targets(bad_hour), Err(ConfigError::Targets(_))));

        assert!(matches!(parse_targets("not ron"), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_targets_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.ron");
        std::fs::write(&path, r#"[(key: "a", site: "nodeseek", username: "x")]"#).unwrap();

        assert_eq!(load_targets(&path).unwrap().len(), 1);
        assert!(matches!(
            load_targets(&dir.path().join("missing.ron")),
            Err(ConfigError::Read { .. })
        ));
    }
}
