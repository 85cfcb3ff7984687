//! Error types for miner-core operations.
//!
//! Per-event errors never leave the monitor that produced them; only valid
//! events cross into the queue. What does surface is listed here.

use std::path::PathBuf;

use miner_protocol::KillFailure;

use crate::monitor::MonitorSource;

// ═══════════════════════════════════════════════════════════════════════════════
// Monitor Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Failures inside a monitor's I/O loop.
///
/// `Io` and `Watch` are retried with backoff, `Parse` and `ProcessLookup` are
/// handled per event, and `ChannelClosed` ends the monitor.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Process {0} vanished before it could be inspected")]
    ProcessLookup(u32),

    #[error("{0} output channel closed")]
    ChannelClosed(MonitorSource),
}

impl MonitorError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        MonitorError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for monitor results.
pub type Result<T> = std::result::Result<T, MonitorError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Command Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KillError {
    #[error("No such process")]
    NotFound,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Kill failed: {0}")]
    Other(String),
}

impl From<KillError> for KillFailure {
    fn from(err: KillError) -> Self {
        match err {
            KillError::NotFound => KillFailure::NotFound,
            KillError::PermissionDenied => KillFailure::PermissionDenied,
            KillError::Other(reason) => KillFailure::Other(reason),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration / Setup Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {details}")]
    Malformed { path: PathBuf, details: String },

    #[error("Invalid activity marker {pattern:?}: {details}")]
    InvalidMarker { pattern: String, details: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path} (file may be corrupted): {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write settings {path}: {details}")]
    Write { path: PathBuf, details: String },
}
