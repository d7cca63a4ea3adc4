use serde::Deserialize;

/// How the site picks the check-in reward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum CheckinMode {
    /// Fixed reward
    #[default]
    Fixed,
    /// Random reward (`random=true` on the attendance call)
    Random,
}

/// One account on one site, as listed in the targets file
///
/// Credentials are never part of the file: `cookie_env` and `password_env`
/// name the environment variables that hold them.
#[derive(Debug, Clone, Deserialize)]
pub struct Target {
    pub key: String,
    pub site: String,
    pub username: String,
    #[serde(default)]
    pub checkin_mode: CheckinMode,
    /// Local hour (0-23) from which the target is due each day
    #[serde(default)]
    pub checkin_hour: Option<u8>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub cookie_env: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Target {
    #[cfg(test)]
    pub fn new(key: &str, site: &str, username: &str) -> Self {
        Self {
            key: key.to_string(),
            site: site.to_string(),
            username: username.to_string(),
            checkin_mode: CheckinMode::Fixed,
            checkin_hour: None,
            enabled: true,
            cookie_env: None,
            password_env: None,
        }
    }
}
