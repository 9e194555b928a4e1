use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Job queue database. Defaults to `~/.csv-migrator/data/migrator.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_lane")]
    pub lane: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_progress_poll_interval_ms")]
    pub progress_poll_interval_ms: u64,
    #[serde(default)]
    pub wave_timeout_secs: Option<u64>,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub import: Option<ImportConfig>,
    #[serde(default)]
    pub upload_directory: Option<PathBuf>,
    #[serde(default)]
    pub field_filter: Option<FieldFilterSettings>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_lane() -> String {
    "csv-migration".to_string()
}

fn default_chunk_size() -> usize {
    1000
}

fn default_max_concurrency() -> usize {
    num_cpus::get()
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_progress_poll_interval_ms() -> u64 {
    2000
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn progress_poll_interval(&self) -> Duration {
        Duration::from_millis(self.progress_poll_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: None,
            lane: default_lane(),
            chunk_size: default_chunk_size(),
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
            progress_poll_interval_ms: default_progress_poll_interval_ms(),
            wave_timeout_secs: None,
            destination: DestinationConfig::default(),
            import: None,
            upload_directory: None,
            field_filter: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Where migrated documents go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Document store database. Defaults to the job queue database.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Columns forming the document key. Empty means content hash.
    #[serde(default)]
    pub key_fields: Vec<String>,
}

fn default_collection() -> String {
    "records".to_string()
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            collection: default_collection(),
            key_fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    pub input_directory: PathBuf,
    pub processed_directory: PathBuf,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

fn default_scan_interval_secs() -> u64 {
    60
}

impl ImportConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldFilterSettings {
    pub path: PathBuf,
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
}

fn default_reload_interval_secs() -> u64 {
    5
}

impl FieldFilterSettings {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
