//! Periodic CPU / memory / terminal sampling of agent processes.
//!
//! Emits one sample per matching pid per tick. A pid that was sampled last
//! tick but is missing now is reported as vanished; deciding whether that
//! means termination is left to the coordinator.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use sysinfo::{ProcessRefreshKind, ProcessStatus, System, UpdateKind};
use tracing::{debug, info};

use super::{MonitorSource, StopFlag};
use crate::config::ResourceMonitorConfig;
use crate::error::MonitorError;
use crate::events::{MonitorEvent, ResourceSample};
use crate::process;
use crate::queue::EventSender;

const SOURCE: MonitorSource = MonitorSource::ResourceMonitor;

pub struct ResourceMonitor {
    config: ResourceMonitorConfig,
    sender: EventSender,
    stop: StopFlag,
    system: System,
    own_pid: u32,
    previous: HashSet<u32>,
}

impl ResourceMonitor {
    pub fn new(config: ResourceMonitorConfig, sender: EventSender, stop: StopFlag) -> Self {
        Self {
            config,
            sender,
            stop,
            system: System::new(),
            own_pid: std::process::id(),
            previous: HashSet::new(),
        }
    }

    pub fn run(mut self) -> Result<(), MonitorError> {
        info!(
            interval_ms = self.config.interval().as_millis() as u64,
            names = ?self.config.process_names,
            "Resource monitor started"
        );

        while !self.stop.is_stopped() {
            for event in self.sample(Utc::now()) {
                self.sender.send(SOURCE, event)?;
            }
            if !self.stop.sleep(self.config.interval()) {
                break;
            }
        }
        Ok(())
    }

    /// Takes one sample of every matching process.
    pub fn sample(&mut self, at: DateTime<Utc>) -> Vec<MonitorEvent> {
        // argv is not loaded unless asked for; interpreters hide the agent behind it.
        self.system.refresh_processes_specifics(
            ProcessRefreshKind::new()
                .with_cpu()
                .with_memory()
                .with_cmd(UpdateKind::OnlyIfNotSet),
        );

        let mut current = HashSet::new();
        let mut events = Vec::new();

        for (pid, proc_) in self.system.processes() {
            let pid = pid.as_u32();
            if pid == self.own_pid
                || matches!(proc_.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
                || !matches_process(proc_.name(), proc_.cmd(), &self.config.process_names)
            {
                continue;
            }

            let Some(has_terminal) = process::has_controlling_terminal(pid) else {
                debug!(pid, "Process vanished between enumeration and inspection");
                continue;
            };

            current.insert(pid);
            events.push(MonitorEvent::Resource(ResourceSample {
                pid,
                cpu_usage: proc_.cpu_usage(),
                memory_bytes: proc_.memory(),
                has_terminal,
                at,
            }));
        }

        for pid in vanished_pids(&self.previous, &current) {
            events.push(MonitorEvent::ProcessVanished { pid, at });
        }
        self.previous = current;
        events
    }
}

/// Matches the executable name or the basename of either of the first two
/// arguments (interpreters put the script second).
pub fn matches_process(name: &str, cmd: &[String], filters: &[String]) -> bool {
    filters.iter().any(|filter| {
        name == filter
            || cmd.iter().take(2).any(|arg| {
                Path::new(arg)
                    .file_name()
                    .and_then(|base| base.to_str())
                    .map(|base| base == filter)
                    .unwrap_or(false)
            })
    })
}

pub fn vanished_pids(previous: &HashSet<u32>, current: &HashSet<u32>) -> Vec<u32> {
    let mut gone: Vec<u32> = previous.difference(current).copied().collect();
    gone.sort_unstable();
    gone
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters() -> Vec<String> {
        vec!["claude".to_string()]
    }

    #[test]
    fn matches_by_name_or_script_basename() {
        assert!(matches_process("claude", &[], &filters()));
        assert!(matches_process(
            "node",
            &[
                "/usr/bin/node".to_string(),
                "/usr/local/lib/node_modules/.bin/claude".to_string()
            ],
            &filters()
        ));
        assert!(!matches_process(
            "node",
            &["node".to_string(), "server.js".to_string(), "claude".to_string()],
            &filters()
        ));
        assert!(!matches_process("claude-helper", &[], &filters()));
    }

    #[test]
    fn vanished_is_previous_minus_current() {
        let previous: HashSet<u32> = [1, 2, 3].into_iter().collect();
        let current: HashSet<u32> = [2, 4].into_iter().collect();
        assert_eq!(vanished_pids(&previous, &current), vec![1, 3]);
        assert!(vanished_pids(&current, &current).is_empty());
    }
}
