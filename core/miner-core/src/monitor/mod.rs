//! Signal sources feeding the event queue.
//!
//! Each monitor runs on its own thread with its own I/O loop and shares only
//! an [`EventSender`] and a [`StopFlag`] with the rest of the system.

pub mod log_watcher;
pub mod receiver;
pub mod resource;
mod tail;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::MonitorError;
use crate::queue::{Command, EventSender};

pub use log_watcher::LogWatcher;
pub use receiver::{FeedReceiver, ReceiverStats, ReceiverStatsSnapshot};
pub use resource::ResourceMonitor;

/// How long blocking waits last before re-checking the stop flag.
pub(crate) const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorSource {
    LogWatcher,
    ResourceMonitor,
    EventReceiver,
}

impl MonitorSource {
    pub const ALL: [MonitorSource; 3] = [
        MonitorSource::LogWatcher,
        MonitorSource::ResourceMonitor,
        MonitorSource::EventReceiver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorSource::LogWatcher => "log_watcher",
            MonitorSource::ResourceMonitor => "resource_monitor",
            MonitorSource::EventReceiver => "event_receiver",
        }
    }
}

impl fmt::Display for MonitorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative shutdown signal shared by every monitor.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps up to `duration`, waking early on stop. Returns false if stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// Runs a monitor body on a named thread.
///
/// An error return is reported to the coordinator as `MonitorStopped`; a
/// closed channel is only logged since there is nobody left to tell.
pub fn spawn_monitor<F>(
    source: MonitorSource,
    sender: EventSender,
    body: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<(), MonitorError> + Send + 'static,
{
    thread::Builder::new()
        .name(format!("miner-{source}"))
        .spawn(move || match body() {
            Ok(()) => info!(monitor = %source, "Monitor stopped"),
            Err(MonitorError::ChannelClosed(_)) => {
                warn!(monitor = %source, "Monitor output channel closed")
            }
            Err(err) => {
                error!(monitor = %source, error = %err, "Monitor failed");
                if !sender.command(Command::MonitorStopped {
                    source,
                    reason: err.to_string(),
                }) {
                    warn!(monitor = %source, "Coordinator gone; stop not reported");
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{event_queue, Pop, QueueItem};

    #[test]
    fn stop_flag_interrupts_sleep() {
        let flag = StopFlag::new();
        let remote = flag.clone();
        let started = Instant::now();
        let sleeper = thread::spawn(move || remote.sleep(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(50));
        flag.stop();
        assert!(!sleeper.join().expect("join"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn failed_monitor_reports_stop() {
        let (sender, receiver) = event_queue();
        let handle = spawn_monitor(MonitorSource::LogWatcher, sender, || {
            Err(MonitorError::Parse("boom".to_string()))
        })
        .expect("spawn");
        handle.join().expect("join");

        let Pop::Item(QueueItem::Command(Command::MonitorStopped { source, reason })) =
            receiver.pop(Duration::from_secs(1))
        else {
            panic!("expected MonitorStopped");
        };
        assert_eq!(source, MonitorSource::LogWatcher);
        assert!(reason.contains("boom"));
    }
}
