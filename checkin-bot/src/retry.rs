//! Backoff policy and transient-failure classification
//!
//! The engine asks [`BackoffPolicy`] how long to wait after the n-th failed
//! attempt. Delays double from the base and are capped; with jitter enabled
//! the delay is drawn from the upper half of that window, so it never
//! exceeds the cap.

use rand::Rng;
use std::time::Duration;

/// Default first backoff delay in seconds
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 5;
/// Default maximum backoff delay in seconds
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: true,
        }
    }

    #[cfg(test)]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Upper bound of the wait after `attempt` failures (1-based)
    pub fn ceiling_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Wait after `attempt` failures (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_for(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }

        let ceiling_ms = ceiling.as_millis().min(u64::MAX as u128) as u64;
        let floor_ms = ceiling_ms / 2;
        let millis = rand::thread_rng().gen_range(floor_ms..=ceiling_ms);
        Duration::from_millis(millis)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
        )
    }
}

/// Check if an error message describes a transient condition
pub fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    // Network/connection errors
    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("dns")
        || error_lower.contains("resolve")
    {
        return true;
    }

    // Gateway errors (5xx that are typically transient)
    if error_lower.contains("502")
        || error_lower.contains("bad gateway")
        || error_lower.contains("503")
        || error_lower.contains("service unavailable")
        || error_lower.contains("504")
        || error_lower.contains("gateway timeout")
    {
        return true;
    }

    // Rate limiting
    error_lower.contains("429")
        || error_lower.contains("too many requests")
        || error_lower.contains("rate limit")
}

/// Check if an HTTP status code indicates a retryable error
pub fn is_retryable_status(status: u16) -> bool {
    matches!(
        status,
        408 | // Request Timeout
        429 | // Too Many Requests
        500 | // Internal Server Error (sometimes transient)
        502 | // Bad Gateway
        503 | // Service Unavailable
        504 | // Gateway Timeout
        520 | // Cloudflare - Web Server Returned an Unknown Error
        521 | // Cloudflare - Web Server Is Down
        522 | // Cloudflare - Connection Timed Out
        523 | // Cloudflare - Origin Is Unreachable
        524   // Cloudflare - A Timeout Occurred
    )
}

/// Check if a reqwest transport error is worth another attempt
pub fn is_reqwest_error_retryable(err: &reqwest::Error) -> bool {
    err.is_timeout()
        || err.is_connect()
        || err.is_request()
        || err
            .status()
            .map(|s| is_retryable_status(s.as_u16()))
            .unwrap_or(false)
        || is_retryable_error(&err.to_string())
}
