//! Attendance adapter for forum sites sharing the `/api/attendance` layout
//!
//! Check-in is a single POST authenticated by the session cookie. The
//! response message decides the outcome more reliably than the HTTP status,
//! so the JSON body is inspected first and the status is only a fallback.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{CONTENT_TYPE, COOKIE, ORIGIN, REFERER};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{CheckinSite, HttpSettings, SitePreset};
use crate::captcha::{CaptchaError, CaptchaSolver};
use crate::config::Config;
use crate::error::AuthError;
use crate::models::{AttemptOutcome, CheckinMode, Session, SessionSource, Target};
use crate::retry::{is_reqwest_error_retryable, is_retryable_status};

/// Reward message fragment ("drumsticks", the site currency)
const REWARD_MARKER: &str = "鸡腿";
/// "Check-in already completed"
const ALREADY_DONE_MARKER: &str = "已完成签到";
/// Credit history entries written by a check-in
const CHECKIN_CREDIT_MARKER: &str = "签到";

/// Body of an attendance response; every field is optional on the wire
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttendanceResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub gain: Option<i64>,
    #[serde(default)]
    pub current: Option<i64>,
}

pub struct AttendanceSite {
    preset: SitePreset,
    client: reqwest::Client,
    http: HttpSettings,
    captcha: Option<Arc<CaptchaSolver>>,
}

impl AttendanceSite {
    pub fn new(
        preset: SitePreset,
        client: reqwest::Client,
        config: &Config,
        captcha: Option<Arc<CaptchaSolver>>,
    ) -> Self {
        Self {
            preset,
            client,
            http: HttpSettings::from_config(config),
            captcha,
        }
    }

    /// Latest balance and the amount of the newest check-in entry, if any
    async fn fetch_credits(&self, session: &Session) -> Option<(i64, Option<i64>)> {
        let response = self
            .client
            .get(self.preset.credit_url())
            .header(COOKIE, &session.cookie)
            .header(ORIGIN, &self.preset.base_url)
            .header(REFERER, self.preset.referer())
            .send()
            .await;

        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                log::warn!("[SITE] {} credit page returned HTTP {}", self.preset.name, response.status().as_u16());
                return None;
            }
            Err(e) => {
                log::warn!("[SITE] {} credit page request failed: {}", self.preset.name, e);
                return None;
            }
        };

        match response.json::<Value>().await {
            Ok(body) => parse_credit_page(&body),
            Err(e) => {
                log::warn!("[SITE] {} credit page is not JSON: {}", self.preset.name, e);
                None
            }
        }
    }
}

#[async_trait]
impl CheckinSite for AttendanceSite {
    async fn checkin(&self, target: &Target, session: &Session) -> AttemptOutcome {
        let random = target.checkin_mode == CheckinMode::Random;
        let url = self.preset.checkin_url(random);
        log::debug!("[SITE] POST {} for {}", url, target.key);

        let response = self
            .client
            .post(&url)
            .header(COOKIE, &session.cookie)
            .header(ORIGIN, &self.preset.base_url)
            .header(REFERER, self.preset.referer())
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return transport_outcome(&e),
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return transport_outcome(&e),
        };
        let parsed = serde_json::from_str::<AttendanceResponse>(&body).ok();

        let (message, credits_delta, credits_after) = match classify_attendance(status, parsed.as_ref()) {
            AttemptOutcome::Success { message, credits_delta, credits_after } => (message, credits_delta, credits_after),
            other => return other,
        };

        // Credits are informational; a failed lookup never turns a success into a failure
        let (credits_after, credits_delta) = match (credits_after, credits_delta) {
            (Some(after), Some(delta)) => (Some(after), Some(delta)),
            (after, delta) => match self.fetch_credits(session).await {
                Some((balance, entry)) => (Some(balance), delta.or(entry)),
                None => (after, delta),
            },
        };

        AttemptOutcome::Success {
            message,
            credits_delta,
            credits_after,
        }
    }

    async fn login(&self, target: &Target, password: &str) -> Result<Session, AuthError> {
        let Some(captcha) = &self.captcha else {
            return Err(AuthError::Captcha("no captcha solver configured".to_string()));
        };

        let jar = Arc::new(Jar::default());
        let client = self
            .http
            .builder()
            .and_then(|builder| builder.cookie_provider(jar.clone()).build())
            .map_err(|e| AuthError::Unavailable(format!("failed to build login client: {}", e)))?;

        // Initial cookies come from the login page
        log::debug!("[SITE] Fetching login page {}", self.preset.login_url);
        let page = client
            .get(&self.preset.login_url)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(format!("login page request failed: {}", e)))?;
        if page.status().as_u16() == 403 || is_retryable_status(page.status().as_u16()) {
            return Err(AuthError::Unavailable(format!("login page returned HTTP {}", page.status().as_u16())));
        }

        let token = captcha
            .solve(&self.preset.login_url, &self.preset.sitekey)
            .await
            .map_err(|e| match e {
                CaptchaError::Rejected(reason) => AuthError::Captcha(reason),
                other => AuthError::Unavailable(other.to_string()),
            })?;

        let response = client
            .post(self.preset.login_api_url())
            .header(ORIGIN, &self.preset.base_url)
            .header(REFERER, &self.preset.login_url)
            .json(&json!({
                "username": target.username,
                "password": password,
                "token": token,
                "source": "turnstile",
            }))
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(format!("login request failed: {}", e)))?;

        let status = response.status().as_u16();
        if status == 403 || is_retryable_status(status) {
            return Err(AuthError::Unavailable(format!("login returned HTTP {}", status)));
        }
        let rejected = |reason: String| AuthError::Rejected {
            target: target.key.clone(),
            reason,
        };
        if !response.status().is_success() {
            return Err(rejected(format!("HTTP {}", status)));
        }

        let body: AttendanceResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(format!("login response is not JSON: {}", e)))?;
        if body.success != Some(true) {
            return Err(rejected(body.message.unwrap_or_else(|| "login refused".to_string())));
        }

        // Path-scoped cookies are matched against the login endpoint too
        let cookie = [self.preset.login_api_url(), self.preset.base_url.clone()]
            .iter()
            .filter_map(|raw| url::Url::parse(raw).ok())
            .filter_map(|url| jar.cookies(&url))
            .filter_map(|value| value.to_str().ok().map(str::to_string))
            .max_by_key(String::len)
            .ok_or_else(|| rejected("login succeeded but no session cookie was set".to_string()))?;

        log::info!("[SITE] Logged in to {} as {}", self.preset.name, target.username);
        Ok(Session::new(&target.key, cookie, Utc::now(), SessionSource::Login))
    }
}

fn transport_outcome(err: &reqwest::Error) -> AttemptOutcome {
    if is_reqwest_error_retryable(err) {
        AttemptOutcome::retryable(format!("request failed: {}", err))
    } else {
        AttemptOutcome::fatal(format!("request failed: {}", err))
    }
}

/// Classify one attendance response from its HTTP status and JSON body
pub fn classify_attendance(status: u16, body: Option<&AttendanceResponse>) -> AttemptOutcome {
    match status {
        401 => return AttemptOutcome::session_expired("HTTP 401"),
        403 => return AttemptOutcome::retryable("blocked by Cloudflare (HTTP 403)"),
        _ => {}
    }

    if let Some(body) = body {
        let message = body.message.clone().filter(|m| !m.is_empty());
        let text = message.as_deref().unwrap_or("");

        if body.success == Some(true) || text.contains(REWARD_MARKER) {
            return AttemptOutcome::Success {
                message,
                credits_delta: body.gain,
                credits_after: body.current,
            };
        }
        if text.contains(ALREADY_DONE_MARKER) {
            return AttemptOutcome::AlreadyDone { message };
        }
        if body.status == Some(404) {
            return AttemptOutcome::session_expired("site reports the session cookie is invalid");
        }
        if is_retryable_status(status) || (200..300).contains(&status) {
            return AttemptOutcome::retryable(format!("check-in refused: {}", text));
        }
        return AttemptOutcome::fatal(format!("HTTP {}: {}", status, text));
    }

    if is_retryable_status(status) {
        AttemptOutcome::retryable(format!("HTTP {}", status))
    } else if (200..300).contains(&status) {
        AttemptOutcome::retryable("response body is not JSON")
    } else if (400..500).contains(&status) {
        AttemptOutcome::fatal(format!("HTTP {}", status))
    } else {
        AttemptOutcome::retryable(format!("unexpected HTTP {}", status))
    }
}

/// Read `data: [[amount, balance, description, time], ...]`, newest first
pub fn parse_credit_page(body: &Value) -> Option<(i64, Option<i64>)> {
    if body.get("success").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    let newest = body.get("data")?.as_array()?.first()?.as_array()?;
    let balance = newest.get(1)?.as_i64()?;

    let amount = newest.first().and_then(Value::as_i64);
    let is_checkin = newest
        .get(2)
        .and_then(Value::as_str)
        .map(|desc| desc.contains(CHECKIN_CREDIT_MARKER))
        .unwrap_or(false);

    Some((balance, if is_checkin { amount } else { None }))
}
