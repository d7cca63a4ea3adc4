//! Turnstile captcha solving through a task-based solver API
//!
//! The solver takes a `createTask` call, then is polled with `getTaskResult`
//! until the task reports `completed`. Polling waits go through [`Delay`].

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Delay;
use crate::config::CaptchaConfig;

#[derive(Debug, thiserror::Error)]
pub enum CaptchaError {
    #[error("captcha service request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("captcha service rejected the task: {0}")]
    Rejected(String),

    #[error("captcha not solved after {0} polls")]
    TimedOut(u32),
}

pub struct CaptchaSolver {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    max_polls: u32,
    poll_interval: Duration,
    delay: Arc<dyn Delay>,
}

impl CaptchaSolver {
    pub fn new(client: reqwest::Client, config: &CaptchaConfig, delay: Arc<dyn Delay>) -> Self {
        Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            max_polls: config.max_polls.max(1),
            poll_interval: config.poll_interval,
            delay,
        }
    }

    /// Solve the Turnstile challenge of `site_url` and return its token
    pub async fn solve(&self, site_url: &str, sitekey: &str) -> Result<String, CaptchaError> {
        log::debug!("[CAPTCHA] Creating task for {}", site_url);

        let response = self
            .client
            .post(format!("{}/createTask", self.api_url))
            .json(&json!({
                "clientKey": self.api_key,
                "type": "Turnstile",
                "url": site_url,
                "siteKey": sitekey,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CaptchaError::Rejected(format!("createTask returned HTTP {}", status.as_u16())));
        }

        let created: Value = response.json().await?;
        let task_id = task_id_of(&created)
            .ok_or_else(|| CaptchaError::Rejected("createTask response has no taskId".to_string()))?;
        log::debug!("[CAPTCHA] Task {} created", task_id);

        for poll in 1..=self.max_polls {
            match self.poll_once(&task_id).await {
                Ok(Some(token)) => {
                    log::info!("[CAPTCHA] Solved after {} polls", poll);
                    return Ok(token);
                }
                Ok(None) => log::debug!("[CAPTCHA] Task {} pending ({}/{})", task_id, poll, self.max_polls),
                Err(e) => log::debug!("[CAPTCHA] Poll {}/{} failed: {}", poll, self.max_polls, e),
            }

            if poll < self.max_polls {
                self.delay.sleep(self.poll_interval).await;
            }
        }

        log::warn!("[CAPTCHA] Task {} not solved after {} polls", task_id, self.max_polls);
        Err(CaptchaError::TimedOut(self.max_polls))
    }

    async fn poll_once(&self, task_id: &str) -> Result<Option<String>, CaptchaError> {
        let response = self
            .client
            .post(format!("{}/getTaskResult", self.api_url))
            .json(&json!({
                "clientKey": self.api_key,
                "taskId": task_id,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let body: Value = response.json().await?;
        if body.get("status").and_then(Value::as_str) != Some("completed") {
            return Ok(None);
        }
        Ok(extract_token(&body))
    }
}

/// Task ids come back as strings or numbers depending on the solver
fn task_id_of(body: &Value) -> Option<String> {
    match body.get("taskId")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Token is either `result.response.token` or `result.response` itself
fn extract_token(body: &Value) -> Option<String> {
    let response = body.get("result")?.get("response")?;
    let token = match response {
        Value::Object(_) => response.get("token")?.as_str()?,
        Value::String(token) => token.as_str(),
        _ => return None,
    };
    (!token.is_empty()).then(|| token.to_string())
}
