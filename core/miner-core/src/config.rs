//! Runtime configuration (`~/.miner/config.toml`).
//!
//! Every section and field is optional; a missing file yields defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::patterns::{ActivityMatcher, DEFAULT_ACTIVITY_MARKERS};
use crate::session::ClassifierPolicy;
use crate::storage::{self, StoragePaths};

/// CPU usage needs two refreshes at least this far apart to mean anything.
const MIN_SAMPLE_INTERVAL_MS: u64 = 200;
/// Upper bound for configured durations (100 years).
const MAX_DURATION_SECS: i64 = 100 * 365 * 24 * 3600;

fn seconds(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX).min(MAX_DURATION_SECS))
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MinerConfig {
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub log_watcher: LogWatcherConfig,
    #[serde(default)]
    pub resource_monitor: ResourceMonitorConfig,
    #[serde(default)]
    pub event_receiver: EventReceiverConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_cpu_threshold_percent")]
    pub cpu_threshold_percent: f32,
    #[serde(default = "default_activity_window_secs")]
    pub activity_window_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            cpu_threshold_percent: default_cpu_threshold_percent(),
            activity_window_secs: default_activity_window_secs(),
        }
    }
}

impl ClassifierConfig {
    pub fn policy(&self) -> ClassifierPolicy {
        ClassifierPolicy {
            cpu_threshold_percent: self.cpu_threshold_percent,
            activity_window: seconds(self.activity_window_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogWatcherConfig {
    /// Defaults to `~/.claude/debug`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_log_extension")]
    pub extension: String,
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    #[serde(default = "default_tail_max_bytes")]
    pub tail_max_bytes: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_fallback_scan_secs")]
    pub fallback_scan_secs: u64,
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
    /// Scan the directory on a timer instead of using native notification.
    #[serde(default)]
    pub force_polling: bool,
}

impl Default for LogWatcherConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            extension: default_log_extension(),
            tail_lines: default_tail_lines(),
            tail_max_bytes: default_tail_max_bytes(),
            debounce_ms: default_debounce_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            fallback_scan_secs: default_fallback_scan_secs(),
            markers: default_markers(),
            force_polling: false,
        }
    }
}

impl LogWatcherConfig {
    pub fn resolved_log_dir(&self, paths: &StoragePaths) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| paths.agent_log_dir())
    }

    pub fn matcher(&self) -> Result<ActivityMatcher, ConfigError> {
        ActivityMatcher::new(&self.markers)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn fallback_scan_interval(&self) -> Duration {
        Duration::from_secs(self.fallback_scan_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceMonitorConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub interval_ms: u64,
    /// Matched against the executable name and the first command-line argument.
    #[serde(default = "default_process_names")]
    pub process_names: Vec<String>,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sample_interval_ms(),
            process_names: default_process_names(),
        }
    }
}

impl ResourceMonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(MIN_SAMPLE_INTERVAL_MS))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventReceiverConfig {
    /// Defaults to `~/.miner/feed.sock`; `MINER_FEED_SOCKET` overrides both.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
    #[serde(default = "default_receiver_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl Default for EventReceiverConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            max_record_bytes: default_max_record_bytes(),
            read_timeout_secs: default_receiver_read_timeout_secs(),
        }
    }
}

impl EventReceiverConfig {
    pub fn resolved_socket_path(&self, paths: &StoragePaths) -> PathBuf {
        storage::socket_override(
            storage::FEED_SOCKET_ENV,
            self.socket_path.as_deref(),
            paths.feed_socket(),
        )
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_summary_interval_secs")]
    pub summary_interval_secs: u64,
    #[serde(default = "default_stale_session_secs")]
    pub stale_session_secs: u64,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            summary_interval_secs: default_summary_interval_secs(),
            stale_session_secs: default_stale_session_secs(),
            kill_timeout_ms: default_kill_timeout_ms(),
        }
    }
}

impl CoordinatorConfig {
    pub fn summary_interval(&self) -> Duration {
        Duration::from_secs(self.summary_interval_secs.max(1))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        seconds(self.stale_session_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms.max(1))
    }
}

fn default_cpu_threshold_percent() -> f32 {
    10.0
}

fn default_activity_window_secs() -> u64 {
    15
}

fn default_log_extension() -> String {
    "txt".to_string()
}

fn default_tail_lines() -> usize {
    50
}

fn default_tail_max_bytes() -> u64 {
    64 * 1024
}

fn default_debounce_ms() -> u64 {
    200
}

fn default_read_timeout_ms() -> u64 {
    500
}

fn default_fallback_scan_secs() -> u64 {
    2
}

fn default_markers() -> Vec<String> {
    DEFAULT_ACTIVITY_MARKERS
        .iter()
        .map(|marker| marker.to_string())
        .collect()
}

fn default_sample_interval_ms() -> u64 {
    2000
}

fn default_process_names() -> Vec<String> {
    vec!["claude".to_string()]
}

fn default_max_record_bytes() -> usize {
    miner_protocol::MAX_FEED_RECORD_BYTES
}

fn default_receiver_read_timeout_secs() -> u64 {
    2
}

fn default_summary_interval_secs() -> u64 {
    30
}

fn default_stale_session_secs() -> u64 {
    3600
}

fn default_kill_timeout_ms() -> u64 {
    5000
}

/// Loads the config file, returning defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<MinerConfig, ConfigError> {
    if !path.exists() {
        return Ok(MinerConfig::default());
    }

    let content = fs_err::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config =
        toml::from_str::<MinerConfig>(&content).map_err(|err| ConfigError::Malformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?;

    // Surface bad marker patterns at load time rather than inside the watcher.
    config.log_watcher.matcher()?;
    Ok(config)
}
