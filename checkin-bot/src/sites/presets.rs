//! Site presets: endpoints of each supported site
//!
//! Built-in presets cover the known sites. A `sites.ron` file in the data
//! directory may override them or add new sites sharing the same API.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;

/// Endpoint layout of one site
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SitePreset {
    pub name: String,
    pub base_url: String,
    pub login_url: String,
    pub api_base: String,
    #[serde(default = "default_login_api")]
    pub login_api: String,
    #[serde(default = "default_checkin_api")]
    pub checkin_api: String,
    #[serde(default = "default_credit_api")]
    pub credit_api: String,
    /// Turnstile sitekey of the login page
    pub sitekey: String,
}

fn default_login_api() -> String {
    "/account/signIn".to_string()
}

fn default_checkin_api() -> String {
    "/attendance".to_string()
}

fn default_credit_api() -> String {
    "/account/credit".to_string()
}

impl SitePreset {
    fn forum(name: &str, host: &str) -> Self {
        let base_url = format!("https://{}", host);
        Self {
            name: name.to_string(),
            login_url: format!("{}/signIn.html", base_url),
            api_base: format!("{}/api", base_url),
            login_api: default_login_api(),
            checkin_api: default_checkin_api(),
            credit_api: default_credit_api(),
            sitekey: "0x4AAAAAAAaNy7leGjewpVyR".to_string(),
            base_url,
        }
    }

    pub fn checkin_url(&self, random: bool) -> String {
        format!("{}{}?random={}", self.api_base, self.checkin_api, random)
    }

    pub fn credit_url(&self) -> String {
        format!("{}{}/page-1", self.api_base, self.credit_api)
    }

    pub fn login_api_url(&self) -> String {
        format!("{}{}", self.api_base, self.login_api)
    }

    pub fn referer(&self) -> String {
        format!("{}/board", self.base_url)
    }
}

/// Presets compiled into the binary, keyed by site id
pub fn builtin_presets() -> HashMap<String, SitePreset> {
    let mut presets = HashMap::new();
    presets.insert("nodeseek".to_string(), SitePreset::forum("NodeSeek", "www.nodeseek.com"));
    presets.insert("deepflood".to_string(), SitePreset::forum("DeepFlood", "www.deepflood.com"));
    presets
}

/// Built-in presets merged with overrides from `path`, if the file exists
pub fn load_site_presets(path: &Path) -> Result<HashMap<String, SitePreset>, ConfigError> {
    let mut presets = builtin_presets();

    if !path.exists() {
        log::debug!("[presets] No site overrides at {:?}, using {} built-in sites", path, presets.len());
        return Ok(presets);
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let overrides = parse_site_presets(&content).map_err(|reason| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    })?;

    log::info!("[presets] Loaded {} site presets from {:?}", overrides.len(), path);
    presets.extend(overrides);
    Ok(presets)
}

fn parse_site_presets(content: &str) -> Result<HashMap<String, SitePreset>, String> {
    let presets: HashMap<String, SitePreset> = ron::from_str(content).map_err(|e| e.to_string())?;
    for (id, preset) in &presets {
        for (field, value) in [("base_url", &preset.base_url), ("login_url", &preset.login_url), ("api_base", &preset.api_base)] {
            url::Url::parse(value).map_err(|e| format!("site '{}' has invalid {}: {}", id, field, e))?;
        }
    }
    Ok(presets)
}
