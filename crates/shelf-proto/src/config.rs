use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Where the processing backend lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Optional bearer token sent with every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// What to do when a single status poll fails in transport or parsing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransientErrorPolicy {
    /// Log and stop polling; the task keeps its last known state.
    #[default]
    Stall,
    /// Retry with linear backoff; after `max_retries` consecutive failures
    /// the task is marked FAILED.
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub transient_errors: TransientErrorPolicy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// Automatic removal of finished tasks.  A delay of 0 keeps the entry until
/// the user dismisses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_completed_removal_ms")]
    pub completed_removal_ms: u64,
    #[serde(default)]
    pub failed_removal_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    /// Option selected when the option list loads (falls back to the first).
    #[serde(default = "default_option_name")]
    pub default_option: String,
    /// Backend context (chapter id) to submit against, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<i64>,
    /// Display labels attached to submitted tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_title: Option<String>,
    /// Audio player binary; receives `--no-video <url>`.
    #[serde(default = "default_player")]
    pub player: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default = "default_log_file")]
    pub file: PathBuf,
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Floor for poll and retry delays; 0 would hammer the backend.
pub const MIN_POLL_DELAY_MS: u64 = 100;

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(MIN_POLL_DELAY_MS))
    }

    /// Base step of the linear retry backoff.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.max(MIN_POLL_DELAY_MS))
    }
}

impl CleanupConfig {
    pub fn completed_removal(&self) -> Option<Duration> {
        non_zero_ms(self.completed_removal_ms)
    }

    pub fn failed_removal(&self) -> Option<Duration> {
        non_zero_ms(self.failed_removal_ms)
    }
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            auth_token: None,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            transient_errors: TransientErrorPolicy::default(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            completed_removal_ms: default_completed_removal_ms(),
            failed_removal_ms: 0,
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            default_option: default_option_name(),
            context_id: None,
            book_title: None,
            chapter_title: None,
            player: default_player(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            file: default_log_file(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:5000/api".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_completed_removal_ms() -> u64 {
    3000
}

fn default_option_name() -> String {
    "Kore".to_string()
}

fn default_player() -> String {
    "mpv".to_string()
}

fn default_log_filter() -> String {
    // Keep connection-level DEBUG from the HTTP stack out of the log.
    "debug,hyper_util=warn,reqwest=warn,hyper=warn".to_string()
}

fn default_log_file() -> PathBuf {
    platform::log_path()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            polling: PollingConfig::default(),
            cleanup: CleanupConfig::default(),
            ui: UiConfig::default(),
            log: LogConfig::default(),
        }
    }
}
