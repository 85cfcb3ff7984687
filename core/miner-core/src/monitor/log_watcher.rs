//! Watches the agent's per-session debug logs for activity markers.
//!
//! File changes arrive through native notification (`notify`); a timed
//! directory scan takes over only when no watcher can be created. Changes are
//! debounced per file, then the file's tail is read on a short-lived thread so
//! a slow or hung read never holds up other files.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Instant, SystemTime};

use chrono::Utc;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use super::tail::{read_tail, Tail};
use super::{MonitorSource, StopFlag, STOP_POLL_INTERVAL};
use crate::backoff::RetryBackoff;
use crate::config::LogWatcherConfig;
use crate::error::MonitorError;
use crate::events::{LogEvent, MonitorEvent};
use crate::identity::is_canonical_session_id;
use crate::patterns::{self, ActivityMatcher};
use crate::queue::EventSender;

const SOURCE: MonitorSource = MonitorSource::LogWatcher;

enum WatchInput {
    Fs(notify::Result<Event>),
    TailDone { path: PathBuf, result: io::Result<Tail> },
}

pub struct LogWatcher {
    log_dir: PathBuf,
    config: LogWatcherConfig,
    matcher: ActivityMatcher,
    sender: EventSender,
    stop: StopFlag,
}

impl LogWatcher {
    pub fn new(
        log_dir: PathBuf,
        config: LogWatcherConfig,
        matcher: ActivityMatcher,
        sender: EventSender,
        stop: StopFlag,
    ) -> Self {
        Self {
            log_dir,
            config,
            matcher,
            sender,
            stop,
        }
    }

    pub fn run(self) -> Result<(), MonitorError> {
        if !self.wait_for_log_dir() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        let watcher = if self.config.force_polling {
            None
        } else {
            match self.create_watcher(tx.clone()) {
                Ok(watcher) => Some(watcher),
                Err(err) => {
                    warn!(
                        error = %err,
                        dir = %self.log_dir.display(),
                        "File notification unavailable; falling back to directory scans"
                    );
                    None
                }
            }
        };

        info!(
            dir = %self.log_dir.display(),
            polling = watcher.is_none(),
            "Log watcher started"
        );

        let mut state = WatchState::new(self, watcher.is_none());
        let result = state.run(&tx, &rx);
        drop(watcher);
        result
    }

    /// Returns false if stopped before the directory appeared.
    fn wait_for_log_dir(&self) -> bool {
        let mut backoff = RetryBackoff::default();
        while !self.log_dir.is_dir() {
            let delay = backoff.record_failure();
            if backoff.failures() == 1 {
                info!(dir = %self.log_dir.display(), "Waiting for log directory");
            }
            if !self.stop.sleep(delay) {
                return false;
            }
        }
        true
    }

    fn create_watcher(&self, tx: Sender<WatchInput>) -> notify::Result<RecommendedWatcher> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(WatchInput::Fs(res));
        })?;
        watcher.watch(&self.log_dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }
}

struct WatchState {
    watcher: LogWatcher,
    polling: bool,
    /// Changed files waiting out their debounce, with the time they become due.
    dirty: HashMap<PathBuf, Instant>,
    in_flight: HashMap<PathBuf, Instant>,
    hung_reported: HashSet<PathBuf>,
    known_len: HashMap<PathBuf, u64>,
    pids: HashMap<PathBuf, u32>,
    scanned: HashMap<PathBuf, (u64, Option<SystemTime>)>,
    last_scan: Option<Instant>,
}

impl WatchState {
    fn new(watcher: LogWatcher, polling: bool) -> Self {
        Self {
            watcher,
            polling,
            dirty: HashMap::new(),
            in_flight: HashMap::new(),
            hung_reported: HashSet::new(),
            known_len: HashMap::new(),
            pids: HashMap::new(),
            scanned: HashMap::new(),
            last_scan: None,
        }
    }

    fn run(
        &mut self,
        tx: &Sender<WatchInput>,
        rx: &mpsc::Receiver<WatchInput>,
    ) -> Result<(), MonitorError> {
        let wait = STOP_POLL_INTERVAL.min(self.watcher.config.debounce().max(STOP_POLL_INTERVAL / 4));

        while !self.watcher.stop.is_stopped() {
            match rx.recv_timeout(wait) {
                Ok(WatchInput::Fs(Ok(event))) => self.on_fs_event(event),
                Ok(WatchInput::Fs(Err(err))) => {
                    warn!(error = %err, "File watch error");
                }
                Ok(WatchInput::TailDone { path, result }) => self.on_tail(path, result)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if self.polling {
                self.scan_if_due();
            }
            self.dispatch_due(tx);
            self.report_hung_reads();
        }
        Ok(())
    }

    fn is_log_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext == self.watcher.config.extension)
            .unwrap_or(false)
    }

    fn on_fs_event(&mut self, event: Event) {
        match event.kind {
            EventKind::Modify(_) | EventKind::Create(_) => {
                for path in event.paths {
                    if self.is_log_file(&path) {
                        self.schedule(path);
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.forget(path);
                }
            }
            _ => {}
        }
    }

    /// Throttle: the first change after a read sets the due time and later
    /// changes keep it, so a file written continuously is still read once
    /// per debounce interval.
    fn schedule(&mut self, path: PathBuf) {
        let due = Instant::now() + self.watcher.config.debounce();
        self.dirty.entry(path).or_insert(due);
    }

    fn forget(&mut self, path: &Path) {
        self.dirty.remove(path);
        self.known_len.remove(path);
        self.pids.remove(path);
        self.scanned.remove(path);
    }

    fn dispatch_due(&mut self, tx: &Sender<WatchInput>) {
        let now = Instant::now();
        let due: Vec<PathBuf> = self
            .dirty
            .iter()
            .filter(|(path, due)| **due <= now && !self.in_flight.contains_key(*path))
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            self.dirty.remove(&path);
            let tx = tx.clone();
            let read_path = path.clone();
            let lines = self.watcher.config.tail_lines;
            let max_bytes = self.watcher.config.tail_max_bytes;
            let spawned = thread::Builder::new()
                .name("miner-log-tail".to_string())
                .spawn(move || {
                    let result = read_tail(&read_path, lines, max_bytes);
                    let _ = tx.send(WatchInput::TailDone {
                        path: read_path,
                        result,
                    });
                });
            match spawned {
                Ok(_) => {
                    self.in_flight.insert(path, now);
                }
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "Failed to spawn tail reader");
                    self.dirty.insert(path, now + self.watcher.config.debounce());
                }
            }
        }
    }

    fn report_hung_reads(&mut self) {
        let timeout = self.watcher.config.read_timeout();
        for (path, started) in &self.in_flight {
            if started.elapsed() > timeout && self.hung_reported.insert(path.clone()) {
                warn!(
                    path = %path.display(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Tail read exceeded timeout; file skipped until it completes"
                );
            }
        }
    }

    fn on_tail(&mut self, path: PathBuf, result: io::Result<Tail>) -> Result<(), MonitorError> {
        self.in_flight.remove(&path);
        self.hung_reported.remove(&path);

        let tail = match result {
            Ok(tail) => tail,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Log file vanished before read");
                self.forget(&path);
                return Ok(());
            }
            Err(err) => {
                warn!(error = %err, path = %path.display(), "Failed to read log tail");
                return Ok(());
            }
        };

        if let Some(previous) = self.known_len.insert(path.clone(), tail.file_len) {
            if tail.file_len < previous {
                debug!(path = %path.display(), "Log file truncated; re-tailed from start");
            }
        }

        let lines = || tail.lines.iter().map(String::as_str);
        if let Some(pid) = patterns::find_pid(lines()) {
            self.pids.insert(path.clone(), pid);
        }
        if !self.watcher.matcher.any_match(lines()) {
            return Ok(());
        }

        let session_id = session_id_from_path(&path);
        let pid = self.pids.get(&path).copied();
        if session_id.is_none() && pid.is_none() {
            debug!(path = %path.display(), "Activity in log with no session id or pid");
            return Ok(());
        }

        self.watcher.sender.send(
            SOURCE,
            MonitorEvent::Log(LogEvent {
                session_id,
                pid,
                at: Utc::now(),
            }),
        )
    }

    fn scan_if_due(&mut self) {
        let interval = self.watcher.config.fallback_scan_interval();
        if self
            .last_scan
            .map(|last| last.elapsed() < interval)
            .unwrap_or(false)
        {
            return;
        }
        let first_scan = self.last_scan.is_none();
        self.last_scan = Some(Instant::now());

        let entries = match fs_err::read_dir(&self.watcher.log_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "Failed to scan log directory");
                return;
            }
        };

        let mut seen = HashSet::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !self.is_log_file(&path) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let fingerprint = (metadata.len(), metadata.modified().ok());
            seen.insert(path.clone());
            let changed = self.scanned.insert(path.clone(), fingerprint) != Some(fingerprint);
            if changed && !first_scan {
                self.schedule(path);
            }
        }

        let gone: Vec<PathBuf> = self
            .scanned
            .keys()
            .filter(|path| !seen.contains(*path))
            .cloned()
            .collect();
        for path in gone {
            self.forget(&path);
        }
    }
}

/// Session logs are named `<session-uuid>.<ext>`.
pub fn session_id_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    is_canonical_session_id(stem).then(|| stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_comes_from_uuid_file_stem() {
        assert_eq!(
            session_id_from_path(Path::new(
                "/h/.claude/debug/3f2a9c1e-8b7d-4e6f-a5c4-1d2e3f4a5b6c.txt"
            )),
            Some("3f2a9c1e-8b7d-4e6f-a5c4-1d2e3f4a5b6c".to_string())
        );
        assert_eq!(session_id_from_path(Path::new("/h/.claude/debug/latest.txt")), None);
    }
}
