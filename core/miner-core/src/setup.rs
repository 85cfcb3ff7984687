//! Registration of the feed hook in the agent's `settings.json`.
//!
//! The agent runs `miner-hook send` on each lifecycle event we care about, and
//! the hook forwards the event to the feed socket. Installing rewrites the
//! settings file atomically and leaves unrelated keys and hooks untouched.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::SetupError;

/// Lifecycle events forwarded to the feed.
pub const MINER_HOOK_EVENTS: [&str; 4] = ["SessionStart", "UserPromptSubmit", "Stop", "SessionEnd"];

const HOOK_BINARY_NAME: &str = "miner-hook";
const HOOK_TIMEOUT_SECONDS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookStatus {
    NotInstalled,
    Partial { missing: Vec<String> },
    Installed,
}

pub struct HookInstaller {
    settings_path: PathBuf,
    command: String,
}

impl HookInstaller {
    /// `command` is what the agent runs, e.g. `/home/me/.local/bin/miner-hook send`.
    pub fn new(settings_path: PathBuf, command: impl Into<String>) -> Self {
        Self {
            settings_path,
            command: command.into(),
        }
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    pub fn status(&self) -> Result<HookStatus, SetupError> {
        let settings = self.read_settings()?;
        let hooks = settings.hooks.unwrap_or_default();

        let missing: Vec<String> = MINER_HOOK_EVENTS
            .iter()
            .filter(|event| {
                !hooks
                    .get(**event)
                    .map(|configs| configs.iter().any(HookConfig::has_miner_hook))
                    .unwrap_or(false)
            })
            .map(|event| event.to_string())
            .collect();

        Ok(if missing.is_empty() {
            HookStatus::Installed
        } else if missing.len() == MINER_HOOK_EVENTS.len() {
            HookStatus::NotInstalled
        } else {
            HookStatus::Partial { missing }
        })
    }

    pub fn install(&self) -> Result<(), SetupError> {
        let mut settings = self.read_settings()?;
        let hooks = settings.hooks.get_or_insert_with(HashMap::new);

        for event in MINER_HOOK_EVENTS {
            let event_hooks = hooks.entry(event.to_string()).or_default();

            let mut already_installed = false;
            for config in event_hooks.iter_mut() {
                for hook in config.hooks.iter_mut().flatten() {
                    if is_miner_hook_command(hook.command.as_deref()) {
                        hook.command = Some(self.command.clone());
                        hook.hook_type.get_or_insert_with(|| "command".to_string());
                        hook.timeout = Some(HOOK_TIMEOUT_SECONDS);
                        already_installed = true;
                    }
                }
            }

            if !already_installed {
                event_hooks.push(HookConfig {
                    matcher: None,
                    hooks: Some(vec![InnerHook {
                        hook_type: Some("command".to_string()),
                        command: Some(self.command.clone()),
                        timeout: Some(HOOK_TIMEOUT_SECONDS),
                        other: HashMap::new(),
                    }]),
                    other: HashMap::new(),
                });
            }
        }

        self.write_settings(&settings)
    }

    /// Removes our hook entries. Returns how many were removed.
    pub fn uninstall(&self) -> Result<usize, SetupError> {
        if !self.settings_path.exists() {
            return Ok(0);
        }
        let mut settings = self.read_settings()?;
        let Some(hooks) = settings.hooks.as_mut() else {
            return Ok(0);
        };

        let mut removed = 0;
        for configs in hooks.values_mut() {
            for config in configs.iter_mut() {
                if let Some(inner) = config.hooks.as_mut() {
                    let before = inner.len();
                    inner.retain(|hook| !is_miner_hook_command(hook.command.as_deref()));
                    removed += before - inner.len();
                }
            }
            configs.retain(|config| {
                config
                    .hooks
                    .as_ref()
                    .map(|inner| !inner.is_empty())
                    .unwrap_or(true)
            });
        }
        hooks.retain(|_, configs| !configs.is_empty());

        if removed > 0 {
            self.write_settings(&settings)?;
        }
        Ok(removed)
    }

    fn read_settings(&self) -> Result<SettingsFile, SetupError> {
        if !self.settings_path.exists() {
            return Ok(SettingsFile::default());
        }
        let content = fs::read_to_string(&self.settings_path).map_err(|source| SetupError::Read {
            path: self.settings_path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| SetupError::Corrupt {
            path: self.settings_path.clone(),
            source,
        })
    }

    fn write_settings(&self, settings: &SettingsFile) -> Result<(), SetupError> {
        let write_err = |details: String| SetupError::Write {
            path: self.settings_path.clone(),
            details,
        };

        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| write_err(format!("serialize: {e}")))?;
        let settings_dir = self
            .settings_path
            .parent()
            .ok_or_else(|| write_err("settings path has no parent directory".to_string()))?;
        fs::create_dir_all(settings_dir).map_err(|e| write_err(e.to_string()))?;

        let mut temp = NamedTempFile::new_in(settings_dir).map_err(|e| write_err(e.to_string()))?;
        temp.write_all(content.as_bytes())
            .map_err(|e| write_err(e.to_string()))?;
        temp.flush().map_err(|e| write_err(e.to_string()))?;
        temp.persist(&self.settings_path)
            .map_err(|e| write_err(e.error.to_string()))?;
        Ok(())
    }
}

fn is_miner_hook_command(cmd: Option<&str>) -> bool {
    cmd.map(|c| c.contains(HOOK_BINARY_NAME)).unwrap_or(false)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    hooks: Option<HashMap<String, Vec<HookConfig>>>,
    #[serde(flatten)]
    other: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HookConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    matcher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hooks: Option<Vec<InnerHook>>,
    #[serde(flatten)]
    other: HashMap<String, serde_json::Value>,
}

impl HookConfig {
    fn has_miner_hook(&self) -> bool {
        self.hooks
            .iter()
            .flatten()
            .any(|hook| is_miner_hook_command(hook.command.as_deref()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InnerHook {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    hook_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u32>,
    #[serde(flatten)]
    other: HashMap<String, serde_json::Value>,
}
