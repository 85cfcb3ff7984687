//! Path management for miner.
//!
//! Every file and socket location is decided here so binaries and tests agree.
//! Production code uses [`StoragePaths::resolve`] (`~/.miner` and `~/.claude`);
//! tests inject temp directories with [`StoragePaths::with_roots`].

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

pub const CONFIG_ENV: &str = "MINER_CONFIG";
pub const FEED_SOCKET_ENV: &str = "MINER_FEED_SOCKET";
pub const CONTROL_SOCKET_ENV: &str = "MINER_CONTROL_SOCKET";

#[derive(Debug, Clone)]
pub struct StoragePaths {
    /// Root directory for miner data (default: ~/.miner)
    root: PathBuf,
    /// Root directory for the monitored agent's data (default: ~/.claude)
    claude_root: PathBuf,
}

impl StoragePaths {
    pub fn resolve() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(Self {
            root: home.join(".miner"),
            claude_root: home.join(".claude"),
        })
    }

    pub fn with_roots(root: PathBuf, claude_root: PathBuf) -> Self {
        Self { root, claude_root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn claude_root(&self) -> &Path {
        &self.claude_root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // miner files
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn config_file(&self) -> PathBuf {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => self.root.join("config.toml"),
        }
    }

    pub fn feed_socket(&self) -> PathBuf {
        self.root.join("feed.sock")
    }

    pub fn control_socket(&self) -> PathBuf {
        self.root.join("control.sock")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Agent files
    // ─────────────────────────────────────────────────────────────────────────────

    /// Directory of per-session debug logs, one `<session-uuid>.txt` per session.
    pub fn agent_log_dir(&self) -> PathBuf {
        self.claude_root.join("debug")
    }

    pub fn agent_settings_file(&self) -> PathBuf {
        self.claude_root.join("settings.json")
    }
}

/// Env var wins over the configured value, which wins over the default.
pub fn socket_override(env_name: &str, configured: Option<&Path>, default: PathBuf) -> PathBuf {
    if let Ok(value) = std::env::var(env_name) {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    configured.map(Path::to_path_buf).unwrap_or(default)
}
