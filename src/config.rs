use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub pubdesk: PubdeskConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub images: ImagesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PubdeskConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for PubdeskConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            log_level: default_log_level(),
            timezone: default_timezone(),
        }
    }
}

fn default_version() -> u32 {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub timeout: String,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout: default_request_timeout(),
            user_agent: None,
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:5000/api".to_string()
}
fn default_request_timeout() -> String {
    // Generation with several images routinely takes minutes.
    "10m".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_word_count")]
    pub word_count: u32,
    #[serde(default = "default_image_count")]
    pub image_count: u32,
    #[serde(default = "default_model")]
    pub ai_model: String,
    #[serde(default = "default_model")]
    pub image_model: String,
    /// HTML file whose markup the backend imitates when formatting the article.
    #[serde(default)]
    pub format_template: Option<PathBuf>,
    /// Model-specific extras sent verbatim alongside the generation request.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            word_count: default_word_count(),
            image_count: default_image_count(),
            ai_model: default_model(),
            image_model: default_model(),
            format_template: None,
            params: Map::new(),
        }
    }
}

fn default_word_count() -> u32 {
    5000
}
fn default_image_count() -> u32 {
    3
}
fn default_model() -> String {
    "gemini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_tick")]
    pub tick: String,
    #[serde(default = "default_image_range_start")]
    pub image_range_start: u8,
    #[serde(default = "default_image_range_end")]
    pub image_range_end: u8,
    #[serde(default = "default_cap")]
    pub cap: u8,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            tick: default_tick(),
            image_range_start: default_image_range_start(),
            image_range_end: default_image_range_end(),
            cap: default_cap(),
        }
    }
}

impl ProgressConfig {
    pub fn tick_duration(&self) -> Duration {
        humantime::parse_duration(&self.tick).unwrap_or(Duration::from_millis(800))
    }
}

fn default_tick() -> String {
    "800ms".to_string()
}
fn default_image_range_start() -> u8 {
    35
}
fn default_image_range_end() -> u8 {
    94
}
fn default_cap() -> u8 {
    99
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval")]
    pub interval: String,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: default_reconcile_interval(),
        }
    }
}

impl ReconcileConfig {
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(30))
    }
}

fn default_reconcile_interval() -> String {
    "30s".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImagesConfig {
    /// Hosts that refuse image requests carrying a foreign Referer.
    #[serde(default = "default_hotlink_hosts")]
    pub hotlink_hosts: Vec<String>,
    #[serde(default = "default_proxy_path")]
    pub proxy_path: String,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            hotlink_hosts: default_hotlink_hosts(),
            proxy_path: default_proxy_path(),
        }
    }
}

fn default_hotlink_hosts() -> Vec<String> {
    vec!["mmbiz.qpic.cn".to_string()]
}
fn default_proxy_path() -> String {
    "/api/proxy-image".to_string()
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        humantime::parse_duration(&self.backend.timeout).unwrap_or(Duration::from_secs(600))
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        self.pubdesk.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

/// Load the config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        info!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.pubdesk.version != 1 {
        return Err(ConfigError::Validation(format!(
            "unsupported config version {} (this binary supports version 1)",
            config.pubdesk.version
        ))
        .into());
    }

    config
        .pubdesk
        .timezone
        .parse::<chrono_tz::Tz>()
        .map_err(|_| ConfigError::Validation(format!("unknown timezone '{}'", config.pubdesk.timezone)))?;

    let base = &config.backend.base_url;
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(ConfigError::Validation(format!("backend base_url '{base}' must be an http(s) URL")).into());
    }

    humantime::parse_duration(&config.backend.timeout)
        .map_err(|e| ConfigError::Validation(format!("backend timeout '{}': {}", config.backend.timeout, e)))?;

    if config.generation.word_count == 0 {
        return Err(ConfigError::Validation("generation word_count must be positive".to_string()).into());
    }
    if config.generation.ai_model.trim().is_empty() || config.generation.image_model.trim().is_empty() {
        return Err(ConfigError::Validation("generation ai_model and image_model must be set".to_string()).into());
    }

    let tick = humantime::parse_duration(&config.progress.tick)
        .map_err(|e| ConfigError::Validation(format!("progress tick '{}': {}", config.progress.tick, e)))?;
    if tick.is_zero() {
        return Err(ConfigError::Validation("progress tick must be non-zero".to_string()).into());
    }

    let p = &config.progress;
    if !(p.image_range_start <= p.image_range_end && p.image_range_end < p.cap && p.cap < 100) {
        return Err(ConfigError::Validation(format!(
            "progress range must satisfy image_range_start <= image_range_end < cap < 100 (got {}..{}, cap {})",
            p.image_range_start, p.image_range_end, p.cap
        ))
        .into());
    }

    let interval = humantime::parse_duration(&config.reconcile.interval).map_err(|e| {
        ConfigError::Validation(format!("reconcile interval '{}': {}", config.reconcile.interval, e))
    })?;
    if interval < Duration::from_secs(1) {
        return Err(ConfigError::Validation("reconcile interval must be at least 1s".to_string()).into());
    }

    if !config.images.proxy_path.starts_with('/') {
        return Err(ConfigError::Validation(format!(
            "images proxy_path '{}' must start with '/'",
            config.images.proxy_path
        ))
        .into());
    }
    for host in &config.images.hotlink_hosts {
        if host.is_empty() || host.contains('/') || host.contains(char::is_whitespace) {
            return Err(ConfigError::Validation(format!("images hotlink host '{host}' must be a bare host name")).into());
        }
    }

    Ok(())
}
