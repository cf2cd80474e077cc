use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Mirror configuration, loaded from `config.toml` with env overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// DNS name of the directory domain. Required.
    pub domain: String,
    /// First component of the per-domain file names.
    pub identity: String,
    /// DC hostname to try before any discovery.
    pub preferred_server: Option<String>,
    /// Store every attribute in the schema-agnostic tail.
    pub load_all_attributes: bool,
    /// Extra attributes to request when `load_all_attributes` is off.
    pub other_attributes: Vec<String>,
    /// Override the default cache-file location (a directory).
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval_secs: u64,
    pub bulk_load_page_size: u32,
    pub queue_capacity: usize,
    pub watchdog_interval_secs: u64,
    pub notify_idle_timeout_secs: u64,
    pub backoff_min_secs: u64,
    pub backoff_max_secs: u64,
    pub bootstrap_timeout_secs: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: String::new(),
            identity: "mirror".into(),
            preferred_server: None,
            load_all_attributes: false,
            other_attributes: Vec::new(),
            snapshot_path: None,
            snapshot_interval_secs: 300,
            bulk_load_page_size: 1000,
            queue_capacity: 512,
            watchdog_interval_secs: 300,
            notify_idle_timeout_secs: 2 * 24 * 60 * 60,
            backoff_min_secs: 2,
            backoff_max_secs: 300,
            bootstrap_timeout_secs: 10,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn notify_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_idle_timeout_secs)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_secs(self.backoff_min_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    /// Directory holding the cache/log/sidecar files.
    pub fn data_base(&self) -> PathBuf {
        self.snapshot_path
            .clone()
            .unwrap_or_else(crate::paths::data_dir)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
    pub retention_max_age_days: Option<u64>,
    pub retention_max_files: Option<usize>,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
            retention_max_age_days: Some(7),
            retention_max_files: Some(10),
        }
    }
}
