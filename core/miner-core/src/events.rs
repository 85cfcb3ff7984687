//! Normalized events produced by the monitors.
//!
//! Monitors translate raw observations (log tails, process samples, feed
//! records) into these values; nothing else crosses into the coordinator.

use chrono::{DateTime, Utc};
use miner_protocol::HookKind;

/// Log activity for one session log file.
///
/// `session_id` comes from the file name and `pid` from temp-file paths in the
/// tail. Carrying both is what lets the registry join a pid-only placeholder
/// to its canonical session.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub session_id: Option<String>,
    pub pid: Option<u32>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSample {
    pub pid: u32,
    pub cpu_usage: f32,
    pub memory_bytes: u64,
    pub has_terminal: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookEvent {
    pub session_id: String,
    pub kind: HookKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Log(LogEvent),
    Resource(ResourceSample),
    /// A tracked process disappeared from the process table.
    ProcessVanished { pid: u32, at: DateTime<Utc> },
    Hook(HookEvent),
}

impl MonitorEvent {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            MonitorEvent::Log(event) => event.at,
            MonitorEvent::Resource(sample) => sample.at,
            MonitorEvent::ProcessVanished { at, .. } => *at,
            MonitorEvent::Hook(event) => event.at,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            MonitorEvent::Log(_) => "log",
            MonitorEvent::Resource(_) => "resource",
            MonitorEvent::ProcessVanished { .. } => "process_vanished",
            MonitorEvent::Hook(_) => "hook",
        }
    }
}
