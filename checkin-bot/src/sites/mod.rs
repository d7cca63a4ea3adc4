//! Site adapters - the only code that talks to the external check-in service

pub mod attendance;
pub mod presets;

pub use attendance::AttendanceSite;
pub use presets::{load_site_presets, SitePreset};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::captcha::CaptchaSolver;
use crate::config::Config;
use crate::error::AuthError;
use crate::models::{AttemptOutcome, Session, Target};

/// One external site that accepts check-ins
#[async_trait]
pub trait CheckinSite: Send + Sync {
    /// Perform the check-in with an already acquired session
    async fn checkin(&self, target: &Target, session: &Session) -> AttemptOutcome;

    /// Log in with a password and return a fresh session
    async fn login(&self, target: &Target, password: &str) -> Result<Session, AuthError>;
}

/// Site adapters keyed by the `site` field of a target
#[derive(Default)]
pub struct SiteRegistry {
    sites: HashMap<String, Arc<dyn CheckinSite>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One attendance adapter per preset, sharing the HTTP client
    pub fn from_presets(
        presets: HashMap<String, SitePreset>,
        client: reqwest::Client,
        config: &Config,
        captcha: Option<Arc<CaptchaSolver>>,
    ) -> Self {
        let mut registry = Self::new();
        for (id, preset) in presets {
            let site = AttendanceSite::new(preset, client.clone(), config, captcha.clone());
            registry.register(&id, Arc::new(site));
        }
        registry
    }

    pub fn register(&mut self, id: &str, site: Arc<dyn CheckinSite>) {
        self.sites.insert(id.to_string(), site);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn CheckinSite>> {
        self.sites.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }
}

/// Client settings shared by every request to a site
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout: Duration,
    pub proxy: Option<String>,
}

impl HttpSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            timeout: config.request_timeout,
            proxy: config.socks5_proxy.clone(),
        }
    }

    /// Builder with timeout, user agent and proxy applied
    pub fn builder(&self) -> Result<reqwest::ClientBuilder, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .timeout(self.timeout)
            .connect_timeout(self.timeout);

        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
        }
        Ok(builder)
    }
}

/// Shared client for site traffic
pub fn build_http_client(config: &Config) -> Result<reqwest::Client, reqwest::Error> {
    if config.socks5_proxy.is_some() {
        log::info!("[SITE] Routing site traffic through proxy");
    }
    HttpSettings::from_config(config).builder()?.build()
}
