use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.flockwork/config.toml`.
///
/// Every knob has a serde default so a missing or partial file still yields a
/// runnable configuration. Environment variables override file values for
/// the operational surface (see [`Config::apply_env`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            api: ApiConfig::default(),
            reply: ReplyConfig::default(),
            quota: QuotaConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `~/.flockwork/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment overrides for the operational knobs.
    ///
    /// Recognized variables: `FLOCKWORK_DATA_DIR`, `FLOCKWORK_API_BASE_URL`,
    /// `FLOCKWORK_POLL_INTERVAL_SECS`, `FLOCKWORK_MAX_WORKERS`,
    /// `FLOCKWORK_ACTION_TIMEOUT_SECS`, `FLOCKWORK_REPLY_ENDPOINT`,
    /// `FLOCKWORK_REPLY_API_KEY`. The encryption key is read separately from
    /// `FLOCKWORK_ENCRYPTION_KEY` and never stored in the file.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("FLOCKWORK_DATA_DIR") {
            self.general.data_dir = v;
        }
        if let Ok(v) = std::env::var("FLOCKWORK_API_BASE_URL") {
            self.api.base_url = v;
        }
        if let Ok(v) = std::env::var("FLOCKWORK_POLL_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.schedule.poll_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("FLOCKWORK_MAX_WORKERS") {
            if let Ok(n) = v.parse() {
                self.schedule.max_workers = n;
            }
        }
        if let Ok(v) = std::env::var("FLOCKWORK_ACTION_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.schedule.action_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("FLOCKWORK_REPLY_ENDPOINT") {
            self.reply.endpoint = v;
        }
        if let Ok(v) = std::env::var("FLOCKWORK_REPLY_API_KEY") {
            self.reply.api_key = Some(v);
        }
    }

    /// Resolved data directory, with `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        let raw = &self.general.data_dir;
        if let Some(rest) = raw.strip_prefix("~/") {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(rest)
        } else {
            PathBuf::from(raw)
        }
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".flockwork")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Begin ticking immediately on startup instead of waiting for enable().
    #[serde(default)]
    pub autostart: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            autostart: false,
        }
    }
}

fn default_data_dir() -> String {
    "~/.flockwork".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    /// Token endpoint used for modern-credential refresh.
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_client_ttl")]
    pub client_cache_ttl_secs: u64,
    /// Refresh modern tokens this many minutes before they expire.
    #[serde(default = "default_refresh_window")]
    pub refresh_window_mins: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_http_timeout(),
            token_url: default_token_url(),
            client_cache_ttl_secs: default_client_ttl(),
            refresh_window_mins: default_refresh_window(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.example-platform.com/2".into()
}
fn default_http_timeout() -> u64 {
    30
}
fn default_token_url() -> String {
    "https://api.example-platform.com/2/oauth2/token".into()
}
fn default_client_ttl() -> u64 {
    600
}
fn default_refresh_window() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Style hint forwarded to the text provider.
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default = "default_reply_max_len")]
    pub max_len: usize,
    #[serde(default)]
    pub images_enabled: bool,
    #[serde(default = "default_image_probability")]
    pub image_probability: f64,
    #[serde(default = "default_images_dir")]
    pub images_dir: String,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: None,
            style: None,
            max_len: default_reply_max_len(),
            images_enabled: false,
            image_probability: default_image_probability(),
            images_dir: default_images_dir(),
        }
    }
}

fn default_reply_max_len() -> usize {
    280
}
fn default_image_probability() -> f64 {
    0.25
}
fn default_images_dir() -> String {
    "reply-images".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_pack_total")]
    pub pack_total: u64,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,
    /// Percentage split of the daily limit across action kinds.
    #[serde(default = "default_like_pct")]
    pub like_pct: u64,
    #[serde(default = "default_repost_pct")]
    pub repost_pct: u64,
    #[serde(default = "default_reply_pct")]
    pub reply_pct: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            pack_total: default_pack_total(),
            daily_limit: default_daily_limit(),
            like_pct: default_like_pct(),
            repost_pct: default_repost_pct(),
            reply_pct: default_reply_pct(),
        }
    }
}

fn default_pack_total() -> u64 {
    10_000
}
fn default_daily_limit() -> u64 {
    100
}
fn default_like_pct() -> u64 {
    40
}
fn default_repost_pct() -> u64 {
    10
}
fn default_reply_pct() -> u64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_min_delay")]
    pub min_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_first_scan_timeout")]
    pub first_scan_timeout_secs: u64,
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,
    /// Graceful-shutdown drain deadline.
    #[serde(default = "default_drain_deadline")]
    pub drain_deadline_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            min_delay_secs: default_min_delay(),
            max_delay_secs: default_max_delay(),
            max_workers: default_max_workers(),
            action_timeout_secs: default_action_timeout(),
            first_scan_timeout_secs: default_first_scan_timeout(),
            scan_timeout_secs: default_scan_timeout(),
            drain_deadline_secs: default_drain_deadline(),
        }
    }
}

fn default_poll_interval() -> u64 {
    1800
}
fn default_min_delay() -> u64 {
    60
}
fn default_max_delay() -> u64 {
    120
}
fn default_max_workers() -> usize {
    16
}
fn default_action_timeout() -> u64 {
    300
}
fn default_first_scan_timeout() -> u64 {
    300
}
fn default_scan_timeout() -> u64 {
    600
}
fn default_drain_deadline() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let cfg = Config::default();
        assert_eq!(cfg.quota.like_pct + cfg.quota.repost_pct + cfg.quota.reply_pct, 100);
        assert!(cfg.schedule.min_delay_secs <= cfg.schedule.max_delay_secs);
        assert_eq!(cfg.schedule.max_workers, 16);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [quota]
            daily_limit = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.quota.daily_limit, 10);
        assert_eq!(cfg.quota.pack_total, default_pack_total());
        assert_eq!(cfg.schedule.poll_interval_secs, 1800);
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.quota.daily_limit, cfg.quota.daily_limit);
        assert_eq!(back.api.base_url, cfg.api.base_url);
    }
}
