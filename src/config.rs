//! Configuration management.
//!
//! Configuration is loaded from the process environment (with `.env` support)
//! under the `ANTHILL` prefix, e.g. `ANTHILL__QUEUE__CONCURRENCY=4` or
//! `ANTHILL__LOG__THRESHOLD=5`.

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Runtime environment mode
    #[serde(default)]
    pub environment: Environment,

    /// Redis (broker backend) configuration
    #[serde(default)]
    pub redis: RedisSettings,

    /// Database (log store) configuration
    #[serde(default)]
    pub database: DatabaseSettings,

    /// Queue and worker configuration
    #[serde(default)]
    pub queue: QueueSettings,

    /// Logging pipeline configuration
    #[serde(default)]
    pub log: LogSettings,
}

/// Runtime environment mode.
///
/// Development mode pretty-prints JSON log payloads and prefers
/// human-readable diagnostics; production stays compact.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL for the database log sink
    pub url: Option<String>,

    /// Table the database log sink writes to
    #[serde(default = "default_log_table")]
    pub log_table: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            log_table: default_log_table(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Queue used when a dispatch does not name one
    #[serde(default = "default_queue_name")]
    pub default_queue: String,

    /// Group name, snake-cased into the broker key prefix
    #[serde(default = "default_group")]
    pub group: String,

    /// Concurrent worker slots per worker type
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retry strategy applied to dispatched jobs
    #[serde(default)]
    pub retry_strategy: RetryStrategyKind,

    /// Delay between retry attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Attempts per job before it is considered permanently failed
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Drop completed jobs from the broker instead of retaining them
    #[serde(default)]
    pub remove_on_complete: bool,

    /// Drop failed jobs from the broker instead of retaining them
    #[serde(default)]
    pub remove_on_fail: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_queue: default_queue_name(),
            group: default_group(),
            concurrency: default_concurrency(),
            retry_strategy: RetryStrategyKind::default(),
            retry_delay_ms: default_retry_delay_ms(),
            attempts: default_attempts(),
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

/// Configured retry strategy for dispatched jobs.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategyKind {
    /// No backoff options are attached; the broker default applies
    #[default]
    None,
    /// Fixed delay between attempts
    Fixed,
    /// Delay doubles per attempt
    Exponential,
}

impl RetryStrategyKind {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    /// Maximum level number that is recorded (lower number = more severe)
    #[serde(default = "default_threshold")]
    pub threshold: u8,

    /// Directory file sinks write to
    #[serde(default = "default_log_directory")]
    pub directory: String,

    /// Base name for log files (`<file_name>-<date>.log`)
    #[serde(default = "default_log_file_name")]
    pub file_name: String,

    /// Delete log files older than this many days (None = keep forever)
    pub max_days: Option<u32>,

    /// Roll the current log file once it exceeds this size in MiB
    pub max_size_mb: Option<u64>,

    /// Evaluate file rotation only every Nth write
    #[serde(default = "default_rotation_check_every")]
    pub rotation_check_every: u32,

    /// Grace window for a failing database sink before it self-disables
    #[serde(default = "default_db_retry_window_ms")]
    pub db_retry_window_ms: u64,

    /// Pending-entry cap for the database sink
    #[serde(default = "default_db_max_pending")]
    pub db_max_pending: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            directory: default_log_directory(),
            file_name: default_log_file_name(),
            max_days: None,
            max_size_mb: None,
            rotation_check_every: default_rotation_check_every(),
            db_retry_window_ms: default_db_retry_window_ms(),
            db_max_pending: default_db_max_pending(),
        }
    }
}

// Default value functions
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_log_table() -> String {
    "app_logs".to_string()
}
fn default_queue_name() -> String {
    "default".to_string()
}
fn default_group() -> String {
    "anthill".to_string()
}
fn default_concurrency() -> usize {
    1
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_attempts() -> u32 {
    3
}
fn default_threshold() -> u8 {
    3
}
fn default_log_directory() -> String {
    "logs".to_string()
}
fn default_log_file_name() -> String {
    "anthill".to_string()
}
fn default_rotation_check_every() -> u32 {
    10
}
fn default_db_retry_window_ms() -> u64 {
    5000
}
fn default_db_max_pending() -> usize {
    1024
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// `.env` files are honored if present; explicit process environment
    /// variables win over file contents.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("ANTHILL").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Normalize a queue or group name into a broker-safe snake_case key.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else if ch == ' ' || ch == '-' {
            out.push('_');
            prev_lower = false;
        } else {
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            out.push(ch);
        }
    }
    out
}
